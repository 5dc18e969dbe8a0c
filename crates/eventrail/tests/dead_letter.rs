use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use eventrail::{
    ChannelSettings, DeadLetterChannel, DeadLetterEntry, DeadLetterHandler, EntryId,
    HandlerError, PassReport, ReprocessFilter, StreamBroker, StreamEntry,
};
use eventrail_broker_memory::MemoryBroker;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use tracing_test::traced_test;

const DEAD_LETTERS: &str = "local:events:dead-letter";
const REPROCESS_GROUP: &str = "order.dead-letter.reprocess";
const MAIL_GROUP: &str = "dead-letter-mail-group";
const ANY_TYPE: [&str; 0] = [];

#[derive(Debug, Error)]
#[error("mail server unreachable")]
struct Unreachable;

impl HandlerError for Unreachable {}

#[derive(Clone, Debug, Default)]
struct Inbox {
    failing: Arc<AtomicBool>,
    letters: Arc<Mutex<Vec<DeadLetterEntry>>>,
}

impl Inbox {
    async fn letters(&self) -> Vec<DeadLetterEntry> {
        self.letters.lock().await.clone()
    }
}

#[async_trait]
impl DeadLetterHandler for Inbox {
    type Error = Unreachable;

    async fn handle(&self, entry: DeadLetterEntry) -> Result<(), Self::Error> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Unreachable);
        }

        self.letters.lock().await.push(entry);
        Ok(())
    }
}

fn settings(group: &str) -> ChannelSettings {
    ChannelSettings {
        group_name: group.to_string(),
        consumer_name: "worker-1".to_string(),
        block_time: Duration::from_millis(100),
        batch_size: 10,
        idle_time: Duration::from_secs(1),
        max_claim_count: 10,
        max_times_delivered: 3,
    }
}

fn letter(n: u64, service: &str, event_type: &str) -> DeadLetterEntry {
    let origin = StreamEntry {
        id: EntryId::from_parts(n, 0),
        event_type: event_type.to_string(),
        service: service.to_string(),
        payload: format!(r#"{{"type":"{event_type}","payload":{{}},"createdAt":"2024-01-01T00:00:00Z"}}"#),
        created_at: None,
    };

    DeadLetterEntry::from_origin(&origin, "worker-1", 3, "2024-01-01 07:00:00".to_string())
}

async fn move_letter(broker: &MemoryBroker, letter: &DeadLetterEntry) {
    broker.append(DEAD_LETTERS, letter.to_fields()).await.unwrap();
}

#[test]
fn test_filter_matches_service_and_types() {
    let any_type = ReprocessFilter::new("order");
    let created_only = ReprocessFilter::new("order").with_event_types(["order.created"]);

    assert!(any_type.matches(&letter(1, "order", "order.cancelled")));
    assert!(!any_type.matches(&letter(1, "billing", "order.created")));
    assert!(created_only.matches(&letter(1, "order", "order.created")));
    assert!(!created_only.matches(&letter(1, "order", "order.cancelled")));
}

#[tokio::test(start_paused = true)]
async fn test_reprocessor_handles_matching_letters_only() {
    let broker = MemoryBroker::new();
    let inbox = Inbox::default();

    move_letter(&broker, &letter(1, "order", "order.created")).await;
    move_letter(&broker, &letter(2, "order", "order.cancelled")).await;
    move_letter(&broker, &letter(3, "billing", "order.created")).await;

    let reprocessor = DeadLetterChannel::new(broker.clone(), DEAD_LETTERS, "order").reprocessor(
        settings(REPROCESS_GROUP),
        ["order.created"],
        inbox.clone(),
    );

    let report = reprocessor.poll_once().await.unwrap();

    assert_eq!(
        report,
        PassReport {
            received: 3,
            handled: 1,
            skipped: 2,
            failed: 0,
        }
    );

    let letters = inbox.letters().await;
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].original_id, EntryId::from_parts(1, 0));
    assert_eq!(letters[0].retries, 3);
    assert_eq!(broker.pending_count(DEAD_LETTERS, REPROCESS_GROUP).await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_reprocessor_failure_leaves_letter_pending() {
    let broker = MemoryBroker::new();
    let inbox = Inbox::default();
    inbox.failing.store(true, Ordering::SeqCst);

    move_letter(&broker, &letter(1, "order", "order.created")).await;

    let reprocessor = DeadLetterChannel::new(broker.clone(), DEAD_LETTERS, "order").reprocessor(
        settings(REPROCESS_GROUP),
        ANY_TYPE,
        inbox.clone(),
    );

    let report = reprocessor.poll_once().await.unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(broker.pending_count(DEAD_LETTERS, REPROCESS_GROUP).await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_reprocessor_skips_other_services() {
    let broker = MemoryBroker::new();
    let inbox = Inbox::default();

    move_letter(&broker, &letter(1, "billing", "invoice.issued")).await;
    move_letter(&broker, &letter(2, "order", "order.created")).await;

    let reprocessor = DeadLetterChannel::new(broker.clone(), DEAD_LETTERS, "order").reprocessor(
        settings(REPROCESS_GROUP),
        ANY_TYPE,
        inbox.clone(),
    );

    let report = reprocessor.poll_once().await.unwrap();

    assert_eq!(reprocessor.filter().service(), "order");
    assert_eq!(report.skipped, 1);
    assert_eq!(report.handled, 1);

    let letters = inbox.letters().await;
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].service, "order");
    assert_eq!(broker.pending_count(DEAD_LETTERS, REPROCESS_GROUP).await, 0);
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn test_reprocessor_run_recovers_after_broker_outage() {
    let broker = MemoryBroker::new();
    let inbox = Inbox::default();

    let reprocessor = DeadLetterChannel::new(broker.clone(), DEAD_LETTERS, "order").reprocessor(
        settings(REPROCESS_GROUP),
        ANY_TYPE,
        inbox.clone(),
    );

    broker.set_unavailable(true);

    let shutdown = CancellationToken::new();
    let task = tokio::spawn(
        {
            let shutdown = shutdown.clone();
            async move { reprocessor.run(shutdown).await }
        }
        .in_current_span(),
    );

    tokio::time::sleep(Duration::from_millis(350)).await;
    assert!(inbox.letters().await.is_empty());

    broker.set_unavailable(false);
    move_letter(&broker, &letter(1, "order", "order.created")).await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(inbox.letters().await.len(), 1);
    assert_eq!(broker.pending_count(DEAD_LETTERS, REPROCESS_GROUP).await, 0);
    assert!(logs_contain("dead-letter read failed"));
}

#[tokio::test(start_paused = true)]
async fn test_notifier_ignores_history_and_receives_every_service() {
    let broker = MemoryBroker::new();
    let inbox = Inbox::default();

    move_letter(&broker, &letter(1, "order", "order.created")).await;

    let notifier = DeadLetterChannel::new(broker.clone(), DEAD_LETTERS, "order")
        .notifier(settings(MAIL_GROUP), inbox.clone());

    assert_eq!(notifier.poll_once().await.unwrap(), PassReport::default());

    move_letter(&broker, &letter(2, "order", "order.created")).await;
    move_letter(&broker, &letter(3, "billing", "invoice.issued")).await;

    let report = notifier.poll_once().await.unwrap();
    assert_eq!(report.received, 2);
    assert_eq!(report.handled, 2);

    let services: Vec<String> = inbox
        .letters()
        .await
        .into_iter()
        .map(|letter| letter.service)
        .collect();
    assert_eq!(services, vec!["order", "billing"]);

    let groups = broker.list_groups(DEAD_LETTERS).await.unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].pending, 0);
}

#[tokio::test(start_paused = true)]
async fn test_notifier_run_stops_on_cancellation() {
    let broker = MemoryBroker::new();
    let inbox = Inbox::default();

    let notifier = DeadLetterChannel::new(broker.clone(), DEAD_LETTERS, "order")
        .notifier(settings(MAIL_GROUP), inbox.clone());

    let shutdown = CancellationToken::new();
    let task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { notifier.run(shutdown).await }
    });

    tokio::time::sleep(Duration::from_millis(250)).await;
    move_letter(&broker, &letter(1, "order", "order.created")).await;
    tokio::time::sleep(Duration::from_millis(250)).await;

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(inbox.letters().await.len(), 1);
}
