//! Dead-letter sweep behaviour under paused time

use resilience::test_utils::ScriptedHandler;
use resilience::{DeadLetterConfig, DeadLetterQueue, ReplayOutcome, TerminalReason, OWNER_FIELD};
use std::sync::Arc;
use std::time::Duration;
use stream_broker::{InMemoryBroker, StreamBroker};
use types::{fields::field_map, streams, DeadLetterEntry};

fn entry(id: &str) -> DeadLetterEntry {
    DeadLetterEntry::new(id, "forward", field_map([("id", id)]), "downstream unavailable")
}

#[tokio::test(start_paused = true)]
async fn exhausted_entry_expires_after_ttl_without_replay() {
    let dlq = DeadLetterQueue::new(DeadLetterConfig::default());
    let mut terminal = dlq.subscribe_terminal();
    let handler = ScriptedHandler::always(ReplayOutcome::Recovered);

    let mut exhausted = entry("opp-1").with_ttl_ms(1_000);
    exhausted.retry_count = exhausted.max_retries;
    dlq.enqueue(exhausted).await;

    let report = dlq.sweep(&handler).await;
    assert_eq!(report.retried, 0);
    assert_eq!(dlq.len(), 1);

    tokio::time::advance(Duration::from_millis(1_000)).await;
    let report = dlq.sweep(&handler).await;
    assert_eq!(report.expired, 1);
    assert!(dlq.is_empty());
    assert_eq!(handler.replay_count(), 0);

    let signal = terminal.try_recv().unwrap();
    assert_eq!(signal.reason, TerminalReason::Expired);
    assert_eq!(signal.entry.operation_id.as_str(), "opp-1");
}

#[tokio::test(start_paused = true)]
async fn failed_replays_consume_retries_until_exhausted() {
    let dlq = DeadLetterQueue::new(DeadLetterConfig::default());
    let handler = ScriptedHandler::always(ReplayOutcome::Failed("still down".into()));
    dlq.enqueue(entry("opp-2").with_max_retries(2)).await;

    assert_eq!(dlq.sweep(&handler).await.retried, 1);
    assert_eq!(dlq.sweep(&handler).await.retried, 1);
    assert_eq!(dlq.sweep(&handler).await.retried, 0);

    let parked = &dlq.snapshot()[0];
    assert_eq!(parked.retry_count, 2);
    assert_eq!(parked.last_error, "still down");
    assert_eq!(handler.replay_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn deferred_replays_consume_nothing() {
    let dlq = DeadLetterQueue::new(DeadLetterConfig::default());
    let handler = ScriptedHandler::new(
        vec![ReplayOutcome::Deferred, ReplayOutcome::Deferred],
        ReplayOutcome::Recovered,
    );
    dlq.enqueue(entry("opp-3").with_max_retries(1)).await;

    for _ in 0..2 {
        let report = dlq.sweep(&handler).await;
        assert_eq!(report.deferred, 1);
        assert_eq!(dlq.snapshot()[0].retry_count, 0);
    }

    let report = dlq.sweep(&handler).await;
    assert_eq!(report.recovered, 1);
    assert!(dlq.is_empty());
    assert_eq!(dlq.stats().recovered, 1);
}

#[tokio::test(start_paused = true)]
async fn terminal_entries_are_never_replayed() {
    let dlq = DeadLetterQueue::new(DeadLetterConfig::default());
    let handler = ScriptedHandler::always(ReplayOutcome::Recovered);
    dlq.enqueue(entry("opp-4").terminal().with_ttl_ms(500)).await;

    assert_eq!(dlq.sweep(&handler).await.retried, 0);
    tokio::time::advance(Duration::from_millis(500)).await;
    assert_eq!(dlq.sweep(&handler).await.expired, 1);
    assert_eq!(handler.replay_count(), 0);
}

#[tokio::test]
async fn enqueue_mirrors_to_dead_letter_stream() {
    let broker = Arc::new(InMemoryBroker::default());
    let dlq = DeadLetterQueue::with_broker(DeadLetterConfig::default(), broker.clone());

    dlq.enqueue(entry("opp-5")).await;
    assert_eq!(broker.len(streams::DEAD_LETTER).await.unwrap(), 1);

    broker.set_unavailable(true);
    dlq.enqueue(entry("opp-6")).await;
    assert_eq!(dlq.len(), 2);
    assert_eq!(dlq.stats().mirror_failures, 1);
}

fn journaled(broker: &Arc<InMemoryBroker>, owner: &str) -> DeadLetterQueue {
    let broker: Arc<dyn StreamBroker> = broker.clone();
    DeadLetterQueue::with_journal(DeadLetterConfig::default(), broker, owner)
}

fn ids(dlq: &DeadLetterQueue) -> Vec<String> {
    dlq.snapshot()
        .into_iter()
        .map(|e| e.operation_id.into_inner())
        .collect()
}

#[tokio::test(start_paused = true)]
async fn restarted_queue_recovers_only_unresolved_entries() {
    let broker = Arc::new(InMemoryBroker::default());
    let neighbour = journaled(&broker, "coord-b");
    assert_eq!(neighbour.recover().await.unwrap(), 0);

    let first = journaled(&broker, "coord-a");
    assert_eq!(first.recover().await.unwrap(), 0);
    first.enqueue(entry("opp-1")).await;
    first.enqueue(entry("opp-2")).await;
    assert_eq!(ids(&first), vec!["opp-1", "opp-2"]);

    let handler = ScriptedHandler::new(
        vec![ReplayOutcome::Recovered, ReplayOutcome::Deferred],
        ReplayOutcome::Deferred,
    );
    assert_eq!(first.sweep(&handler).await.recovered, 1);
    drop(first);

    let restarted = journaled(&broker, "coord-a");
    assert_eq!(restarted.recover().await.unwrap(), 1);
    assert_eq!(ids(&restarted), vec!["opp-2"]);

    // Another owner's records are acked, never adopted.
    assert_eq!(neighbour.sync().await.unwrap(), 0);
    assert!(neighbour.is_empty());
    let group = streams::dead_letter_group("coord-b");
    assert_eq!(broker.pending(streams::DEAD_LETTER, &group).await.unwrap().count, 0);
}

#[tokio::test(start_paused = true)]
async fn expired_journal_entries_are_not_recovered() {
    let broker = Arc::new(InMemoryBroker::default());
    let first = journaled(&broker, "exec-a");
    first.recover().await.unwrap();
    first.enqueue(entry("opp-7").terminal().with_ttl_ms(500)).await;

    tokio::time::advance(Duration::from_millis(500)).await;
    let handler = ScriptedHandler::always(ReplayOutcome::Recovered);
    assert_eq!(first.sweep(&handler).await.expired, 1);

    let group = streams::dead_letter_group("exec-a");
    assert_eq!(broker.pending(streams::DEAD_LETTER, &group).await.unwrap().count, 0);
    let restarted = journaled(&broker, "exec-a");
    assert_eq!(restarted.recover().await.unwrap(), 0);
    assert!(restarted.is_empty());
}

#[tokio::test(start_paused = true)]
async fn unread_journal_records_are_adopted_on_restart() {
    let broker = Arc::new(InMemoryBroker::default());
    let first = journaled(&broker, "coord-a");
    first.recover().await.unwrap();
    first.enqueue(entry("opp-8")).await;
    assert_eq!(first.len(), 1);
    drop(first);

    // A record appended by the same owner that no process ever read back.
    let mut fields = entry("opp-9").to_fields();
    fields.insert(OWNER_FIELD.to_string(), "coord-a".to_string());
    broker.append(streams::DEAD_LETTER, fields).await.unwrap();

    let restarted = journaled(&broker, "coord-a");
    assert_eq!(restarted.recover().await.unwrap(), 2);
    assert_eq!(ids(&restarted), vec!["opp-8", "opp-9"]);
}
