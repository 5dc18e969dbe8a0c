use std::fmt;

/// Error returned when an id is not of the form `<ms>-<seq>` or `<ms>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParseEntryIdError(String);

impl fmt::Display for ParseEntryIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid stream entry id: {:?}", self.0)
    }
}

impl std::error::Error for ParseEntryIdError {}

/// Broker-assigned entry id.
///
/// Kept as the broker's string form; ids are compared through [`EntryId::parts`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EntryId(String);

impl EntryId {
    /// Builds an id from its millisecond and sequence components.
    #[must_use]
    pub fn from_parts(ms: u64, seq: u64) -> Self {
        Self(format!("{ms}-{seq}"))
    }

    /// The smallest possible id, `0-0`.
    #[must_use]
    pub fn zero() -> Self {
        Self::from_parts(0, 0)
    }

    /// The largest possible id.
    #[must_use]
    pub fn max() -> Self {
        Self::from_parts(u64::MAX, u64::MAX)
    }

    /// Whether the id is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether the id is `0-0` (or `0`).
    #[must_use]
    pub fn is_zero(&self) -> bool {
        matches!(self.parts(), Ok((0, 0)))
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Splits the id into `(ms, seq)`. A bare `<ms>` has sequence 0.
    ///
    /// # Errors
    ///
    /// Returns an error if either component is not an unsigned integer.
    pub fn parts(&self) -> Result<(u64, u64), ParseEntryIdError> {
        let invalid = || ParseEntryIdError(self.0.clone());

        match self.0.split_once('-') {
            Some((ms, seq)) => Ok((
                ms.parse().map_err(|_| invalid())?,
                seq.parse().map_err(|_| invalid())?,
            )),
            None => Ok((self.0.parse().map_err(|_| invalid())?, 0)),
        }
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::zero()
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for EntryId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for EntryId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<EntryId> for String {
    fn from(id: EntryId) -> Self {
        id.0
    }
}

impl AsRef<str> for EntryId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
