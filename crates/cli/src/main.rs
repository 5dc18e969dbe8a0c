//! Operator CLI for event streams: publish, consume, tail dead letters, inspect pending entries.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::io::Write;

use async_trait::async_trait;
use chrono_tz::Tz;
use clap::{Parser, Subcommand};
use eventrail::{
    ConsumptionDriver, DeadLetterChannel, DeadLetterEntry, DeadLetterHandler, EntryId, Event,
    EventHandler, EventStreamConfig, HandlerError, StreamBroker, StreamChannel, StreamEntry,
};
use eventrail_broker_redis::{RedisBroker, RedisBrokerConfig};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// CLI-specific error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Broker connection error
    #[error(transparent)]
    Broker(#[from] eventrail_broker_redis::Error),

    /// Channel operation error
    #[error(transparent)]
    Channel(#[from] eventrail::Error<eventrail_broker_redis::Error>),

    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] eventrail::ConfigError),

    /// Payload is not valid JSON
    #[error("invalid payload: {0}")]
    Payload(#[from] serde_json::Error),

    /// Unknown timezone name
    #[error("invalid timezone: {0}")]
    Timezone(String),
}

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Redis connection URL
    #[arg(long, default_value = "redis://127.0.0.1:6379/0", env = "REDIS_URL")]
    redis_url: String,

    /// Deployment environment
    #[arg(long, default_value = "local", env = "APP_ENV")]
    environment: String,

    /// Service name stamped on published events
    #[arg(long, default_value = "default", env = "REDIS_STREAM_SERVICE_NAME")]
    service: String,

    /// Version of the event contract
    #[arg(long, default_value = "1.0.0", env = "REDIS_EVENT_SERVICE_VERSION")]
    service_version: String,

    /// Consumer group of the origin stream
    #[arg(long, default_value = "default-group", env = "REDIS_GROUP")]
    group: String,

    /// Consumer name; generated per process when omitted
    #[arg(long, env = "REDIS_CONSUMER")]
    consumer: Option<String>,

    /// Host name used in generated consumer names
    #[arg(long, env = "HOSTNAME")]
    hostname: Option<String>,

    /// Timezone for rendered timestamps
    #[arg(long, default_value = "Asia/Ho_Chi_Minh", env = "APP_TIMEZONE")]
    timezone: String,

    /// Delivery count at which entries are moved to the dead-letter stream
    #[arg(long, default_value_t = 3, env = "REDIS_MAX_TIMES_DELIVERED")]
    max_times_delivered: u64,

    /// Idle time before a pending entry may be claimed, in milliseconds
    #[arg(long, default_value_t = 60_000, env = "REDIS_IDLE_TIME_MS")]
    idle_time_ms: u64,

    /// Read block time, in milliseconds
    #[arg(long, default_value_t = 10_000, env = "REDIS_BLOCK_TIME_MS")]
    block_time_ms: u64,

    /// Per-message handler timeout, in milliseconds
    #[arg(long, env = "REDIS_HANDLER_TIMEOUT_MS")]
    handler_timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Debug, Subcommand)]
enum Command {
    /// Publish one event to the service's stream
    Publish {
        /// Event type, e.g. `order.created`
        #[arg(long = "type")]
        event_type: String,

        /// Event payload as JSON
        #[arg(long, default_value = "{}")]
        payload: String,
    },

    /// Consume the service's stream, printing each event as a JSON line
    Consume,

    /// Work with the dead-letter stream
    DeadLetters {
        #[command(subcommand)]
        action: DeadLetterAction,
    },

    /// List pending entries of a group
    Pending {
        /// Group to inspect; defaults to the consumer group
        #[arg(long)]
        group: Option<String>,

        /// Maximum number of entries listed
        #[arg(long, default_value_t = 100)]
        count: usize,
    },
}

#[derive(Clone, Debug, Subcommand)]
enum DeadLetterAction {
    /// Print every dead letter moved from now on, as JSON lines
    Tail,
}

impl Args {
    fn config(&self) -> Result<EventStreamConfig, Error> {
        let timezone = self
            .timezone
            .parse::<Tz>()
            .map_err(|e| Error::Timezone(e.to_string()))?;

        let consumer = self.consumer.clone().unwrap_or_else(|| {
            let instance = Uuid::new_v4().simple().to_string();
            format!(
                "{}-{}-{}",
                self.service,
                self.hostname.as_deref().unwrap_or("worker"),
                &instance[..8]
            )
        });

        let config = EventStreamConfig {
            environment: self.environment.clone(),
            service_name: self.service.clone(),
            service_version: self.service_version.clone(),
            default_group: self.group.clone(),
            default_consumer: consumer,
            timezone,
            max_times_delivered: self.max_times_delivered,
            idle_time_ms: self.idle_time_ms,
            block_time_ms: self.block_time_ms,
            handler_timeout_ms: self.handler_timeout_ms,
            ..EventStreamConfig::default()
        };
        config.validate()?;

        Ok(config)
    }
}

/// Failure to write to stdout.
#[derive(Debug, thiserror::Error)]
#[error("cannot write to stdout: {0}")]
struct PrintError(#[from] std::io::Error);

impl HandlerError for PrintError {}

fn print_line(line: &Value) -> Result<(), PrintError> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{line}")?;
    stdout.flush()?;
    Ok(())
}

fn decode_payload(payload: &str) -> Value {
    serde_json::from_str(payload).unwrap_or_else(|_| Value::String(payload.to_string()))
}

#[derive(Clone, Copy, Debug)]
struct PrintEvents;

#[async_trait]
impl EventHandler for PrintEvents {
    type Error = PrintError;

    async fn handle(&self, entry: StreamEntry) -> Result<(), Self::Error> {
        print_line(&json!({
            "id": entry.id.as_str(),
            "type": entry.event_type,
            "service": entry.service,
            "createdAt": entry.created_at,
            "payload": decode_payload(&entry.payload),
        }))
    }
}

#[derive(Clone, Copy, Debug)]
struct PrintDeadLetters;

#[async_trait]
impl DeadLetterHandler for PrintDeadLetters {
    type Error = PrintError;

    async fn handle(&self, entry: DeadLetterEntry) -> Result<(), Self::Error> {
        print_line(&json!({
            "id": entry.id.as_str(),
            "original_id": entry.original_id.as_str(),
            "type": entry.event_type,
            "service": entry.service,
            "consumer": entry.consumer,
            "retries": entry.retries,
            "moved_at": entry.moved_at,
            "payload": decode_payload(&entry.payload),
        }))
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    // Logs go to stderr so stdout carries only JSON lines
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = args.config()?;

    let broker = RedisBroker::connect(RedisBrokerConfig {
        url: args.redis_url.clone(),
    })
    .await?;

    match args.command {
        Command::Publish {
            event_type,
            payload,
        } => {
            let payload: Value = serde_json::from_str(&payload)?;
            let channel = StreamChannel::from_config(broker, &config, config.origin_settings());

            let id = channel.publish(&Event::new(event_type, payload)).await?;
            println!("{id}");
        }
        Command::Consume => {
            let channel = StreamChannel::from_config(broker, &config, config.origin_settings());
            let driver = ConsumptionDriver::new(channel, PrintEvents)
                .with_handler_timeout(config.handler_timeout());

            driver.run(shutdown_on_signal()).await;
        }
        Command::DeadLetters {
            action: DeadLetterAction::Tail,
        } => {
            let notifier = DeadLetterChannel::from_config(broker, &config)
                .notifier(config.mail_settings(), PrintDeadLetters)
                .with_handler_timeout(config.handler_timeout());

            notifier.run(shutdown_on_signal()).await;
        }
        Command::Pending { group, count } => {
            let stream = config.stream_key();
            let group = group.unwrap_or_else(|| config.default_group.clone());

            let pending = broker
                .pending_info(&stream, &group, &EntryId::zero(), &EntryId::max(), count)
                .await?;

            if pending.is_empty() {
                info!(%stream, %group, "no pending entries");
            }

            for entry in pending {
                println!(
                    "{}",
                    json!({
                        "id": entry.id.as_str(),
                        "consumer": entry.consumer,
                        "idle_ms": u64::try_from(entry.idle.as_millis()).unwrap_or(u64::MAX),
                        "deliveries": entry.times_delivered,
                    })
                );
            }
        }
    }

    Ok(())
}

/// A token cancelled on SIGTERM or SIGINT.
fn shutdown_on_signal() -> CancellationToken {
    let shutdown = CancellationToken::new();

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;

        info!("shutting down");
        signal_shutdown.cancel();
    });

    shutdown
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => info!("received SIGTERM"),
                _ = sigint.recv() => info!("received SIGINT"),
            }
        }
        (Err(e), _) | (_, Err(e)) => {
            warn!(error = %e, "cannot install signal handlers, falling back to ctrl-c");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("received interrupt signal");
}
