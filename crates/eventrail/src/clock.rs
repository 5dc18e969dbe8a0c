use chrono::{DateTime, Utc};
use chrono_tz::Tz;

/// Format of every timestamp written to a stream.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Renders timestamps as local wall-clock strings in a fixed timezone.
///
/// Entries stay readable in broker introspection tools, at the cost of carrying
/// no offset; every producer of a stream must share the same timezone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WallClock {
    timezone: Tz,
}

impl WallClock {
    /// Creates a clock rendering in `timezone`.
    #[must_use]
    pub const fn new(timezone: Tz) -> Self {
        Self { timezone }
    }

    /// The timezone used for rendering.
    #[must_use]
    pub const fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Renders an instant.
    #[must_use]
    pub fn render(&self, at: DateTime<Utc>) -> String {
        at.with_timezone(&self.timezone)
            .format(TIMESTAMP_FORMAT)
            .to_string()
    }

    /// Renders the current instant.
    #[must_use]
    pub fn now(&self) -> String {
        self.render(Utc::now())
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new(Tz::Asia__Ho_Chi_Minh)
    }
}
