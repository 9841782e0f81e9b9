// Event stream publisher for workflow state changes

//! # Event Stream
//!
//! Every state change the tracker makes is published here with a sequence
//! number that increases by one per workflow run. Subscribers receive
//! events through a `tokio::sync::broadcast` channel; a bounded per-run log
//! lets them reconnect with `after = <last seen sequence>` and catch up.
//!
//! Delivery is at-least-once: a reconnecting consumer may see an event
//! twice, and [`SequenceDedup`] drops anything at or below the highest
//! sequence already seen for that run.
//!
//! Logs of finished runs stay replayable for a grace period after
//! [`EventStreamPublisher::close`], then [`EventStreamPublisher::prune`]
//! drops them.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::{StateChange, StateChangeEvent};

#[derive(Debug, Default)]
struct RunLog {
    last_sequence: u64,
    events: VecDeque<StateChangeEvent>,
    closed_at: Option<DateTime<Utc>>,
}

pub struct EventStreamPublisher {
    logs: DashMap<Uuid, RunLog>,
    sender: broadcast::Sender<StateChangeEvent>,
    /// Events kept per run for replay
    retention: usize,
    /// How long a closed run's log stays replayable
    replay_ttl: Duration,
}

impl EventStreamPublisher {
    pub fn new(channel_capacity: usize, retention: usize) -> Self {
        let (sender, _) = broadcast::channel(channel_capacity.max(1));
        Self {
            logs: DashMap::new(),
            sender,
            retention: retention.max(1),
            replay_ttl: Duration::from_secs(600),
        }
    }

    pub fn with_replay_ttl(mut self, replay_ttl: Duration) -> Self {
        self.replay_ttl = replay_ttl;
        self
    }

    /// Assigns the next sequence for the run and fans the event out
    pub fn publish(&self, workflow_run_id: Uuid, change: StateChange) -> StateChangeEvent {
        let mut log = self.logs.entry(workflow_run_id).or_default();
        log.last_sequence += 1;
        let event = StateChangeEvent {
            sequence: log.last_sequence,
            workflow_run_id,
            change,
            occurred_at: Utc::now(),
        };
        log.events.push_back(event.clone());
        while log.events.len() > self.retention {
            log.events.pop_front();
        }
        // Sent under the entry guard so broadcast order matches sequence order
        if self.sender.send(event.clone()).is_err() {
            debug!(workflow_run_id = %workflow_run_id, sequence = event.sequence, "No live subscribers");
        }
        event
    }

    /// Retained events of a run with `sequence > after`
    pub fn replay(&self, workflow_run_id: Uuid, after: u64) -> Vec<StateChangeEvent> {
        self.logs
            .get(&workflow_run_id)
            .map(|log| {
                log.events
                    .iter()
                    .filter(|event| event.sequence > after)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn last_sequence(&self, workflow_run_id: Uuid) -> u64 {
        self.logs
            .get(&workflow_run_id)
            .map(|log| log.last_sequence)
            .unwrap_or(0)
    }

    /// Marks a run finished; its log is kept until the replay TTL lapses
    pub fn close(&self, workflow_run_id: Uuid) {
        if let Some(mut log) = self.logs.get_mut(&workflow_run_id) {
            log.closed_at.get_or_insert_with(Utc::now);
        }
    }

    /// Drops logs of runs closed longer than the replay TTL ago
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let ttl = chrono::Duration::from_std(self.replay_ttl).unwrap_or_else(|_| chrono::Duration::max_value());
        let before = self.logs.len();
        self.logs
            .retain(|_, log| log.closed_at.map_or(true, |closed| now - closed < ttl));
        let pruned = before.saturating_sub(self.logs.len());
        if pruned > 0 {
            debug!(pruned, "Pruned closed event logs");
        }
        pruned
    }

    /// Raw feed of every run's events
    pub fn subscribe_all(&self) -> broadcast::Receiver<StateChangeEvent> {
        self.sender.subscribe()
    }

    /// Backlog after `after`, then live events for one run
    pub fn subscribe(
        &self,
        workflow_run_id: Uuid,
        after: u64,
    ) -> impl Stream<Item = StateChangeEvent> + Send + 'static {
        // Subscribe before reading the backlog so nothing falls in between
        let receiver = self.sender.subscribe();
        let backlog = self.replay(workflow_run_id, after);
        let mut high_water = backlog.last().map(|event| event.sequence).unwrap_or(after);

        let live = BroadcastStream::new(receiver).filter_map(move |received| match received {
            Ok(event) if event.workflow_run_id == workflow_run_id && event.sequence > high_water => {
                high_water = event.sequence;
                Some(event)
            }
            Ok(_) => None,
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(workflow_run_id = %workflow_run_id, skipped, "Subscriber lagged; reconnect with last sequence to catch up");
                None
            }
        });

        tokio_stream::iter(backlog).chain(live)
    }
}

impl Default for EventStreamPublisher {
    fn default() -> Self {
        Self::new(1024, 512)
    }
}

/// Consumer-side filter for at-least-once delivery
#[derive(Debug, Default)]
pub struct SequenceDedup {
    highest: HashMap<Uuid, u64>,
}

impl SequenceDedup {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` if the event is new for its run
    pub fn accept(&mut self, event: &StateChangeEvent) -> bool {
        let highest = self.highest.entry(event.workflow_run_id).or_insert(0);
        if event.sequence <= *highest {
            return false;
        }
        *highest = event.sequence;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(percent: f64) -> StateChange {
        StateChange::ProgressUpdated {
            progress_percent: percent,
        }
    }

    #[test]
    fn test_sequences_are_per_run_and_monotonic() {
        let publisher = EventStreamPublisher::default();
        let run_a = Uuid::new_v4();
        let run_b = Uuid::new_v4();

        assert_eq!(publisher.publish(run_a, progress(0.0)).sequence, 1);
        assert_eq!(publisher.publish(run_a, progress(10.0)).sequence, 2);
        assert_eq!(publisher.publish(run_b, progress(0.0)).sequence, 1);
        assert_eq!(publisher.last_sequence(run_a), 2);

        let replayed: Vec<u64> = publisher.replay(run_a, 1).iter().map(|e| e.sequence).collect();
        assert_eq!(replayed, vec![2]);
    }

    #[test]
    fn test_retention_bounds_replay() {
        let publisher = EventStreamPublisher::new(16, 3);
        let run = Uuid::new_v4();
        for i in 0..5 {
            publisher.publish(run, progress(i as f64));
        }
        let replayed: Vec<u64> = publisher.replay(run, 0).iter().map(|e| e.sequence).collect();
        assert_eq!(replayed, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_subscribe_replays_then_streams_live() {
        let publisher = EventStreamPublisher::default();
        let run = Uuid::new_v4();
        let other = Uuid::new_v4();
        publisher.publish(run, progress(0.0));
        publisher.publish(run, progress(11.1));

        let stream = publisher.subscribe(run, 1);
        tokio::pin!(stream);

        publisher.publish(other, progress(50.0));
        publisher.publish(run, progress(22.2));

        let first = stream.next().await.unwrap();
        let second = stream.next().await.unwrap();
        assert_eq!((first.sequence, second.sequence), (2, 3));
        assert_eq!(second.workflow_run_id, run);
    }

    #[test]
    fn test_closed_logs_are_pruned_after_ttl() {
        let publisher = EventStreamPublisher::new(16, 8).with_replay_ttl(Duration::from_secs(60));
        let finished = Uuid::new_v4();
        let running = Uuid::new_v4();
        publisher.publish(finished, progress(100.0));
        publisher.publish(running, progress(10.0));
        publisher.close(finished);

        assert_eq!(publisher.prune(Utc::now()), 0);
        assert_eq!(publisher.replay(finished, 0).len(), 1);

        let later = Utc::now() + chrono::Duration::seconds(61);
        assert_eq!(publisher.prune(later), 1);
        assert!(publisher.replay(finished, 0).is_empty());
        assert_eq!(publisher.last_sequence(finished), 0);
        assert_eq!(publisher.replay(running, 0).len(), 1);
    }

    #[test]
    fn test_dedup_drops_redelivery() {
        let publisher = EventStreamPublisher::default();
        let run = Uuid::new_v4();
        let event = publisher.publish(run, progress(0.0));
        let mut dedup = SequenceDedup::new();

        assert!(dedup.accept(&event));
        assert!(!dedup.accept(&event));
        assert!(dedup.accept(&publisher.publish(run, progress(5.0))));
    }
}
