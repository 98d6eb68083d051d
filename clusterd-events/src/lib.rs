//! # Clusterd Events
//! Structured event records produced by the cluster daemon core.
//!
//! Every event is appended to an unbounded delivery queue, logged through a
//! static message table and handed to the external hook commands configured
//! for its id.

#[macro_use]
extern crate tracing;

mod error;
mod event;
mod exec;
mod hooks;
mod messages;

use std::sync::Arc;

pub use error::EventError;
pub use event::{Event, EventData, EVENT_KIND};
pub use exec::{CommandExecutor, ProcessExecutor};
pub use hooks::{HookConfig, HookRunner, ALL_EVENTS};
pub use messages::{format_event, lookup_template};

/// The default number of undelivered events kept in the queue.
pub const DEFAULT_MAX_PENDING: usize = 10_000;

/// Queues, logs and dispatches cluster events.
///
/// The queue is meant to be drained by a consumer of [EventSink::subscribe].
/// Without one, only the latest `max_pending` events are kept.
pub struct EventSink {
    nodename: String,
    tx: flume::Sender<Event>,
    rx: flume::Receiver<Event>,
    max_pending: usize,
    hooks: HookRunner,
}

impl EventSink {
    pub fn new(nodename: impl Into<String>, executor: Arc<dyn CommandExecutor>) -> Self {
        let (tx, rx) = flume::unbounded();

        Self {
            nodename: nodename.into(),
            tx,
            rx,
            max_pending: DEFAULT_MAX_PENDING,
            hooks: HookRunner::new(executor),
        }
    }

    /// Set how many undelivered events are kept before the oldest are dropped.
    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending.max(1);
        self
    }

    #[inline]
    /// The hooks events are delivered to.
    pub fn hooks(&self) -> &HookRunner {
        &self.hooks
    }

    #[inline]
    /// A handle to the delivery queue.
    ///
    /// All receivers share the same queue, each event is delivered once.
    pub fn subscribe(&self) -> flume::Receiver<Event> {
        self.rx.clone()
    }

    #[inline]
    /// The number of events waiting in the delivery queue.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    /// Records a new event.
    ///
    /// Events without a message template are queued and hooked but not logged.
    pub fn emit(&self, ts: f64, data: EventData) -> Event {
        let event = Event {
            nodename: self.nodename.clone(),
            ts,
            kind: EVENT_KIND.to_string(),
            data,
        };

        if let Some(message) = format_event(&event.data) {
            info!(
                event_id = %event.data.id,
                svcname = event.data.svcname.as_deref().unwrap_or(""),
                "{}",
                message,
            );
        }

        // We own a receiver so the unbounded channel cannot be disconnected.
        let _ = self.tx.send(event.clone());
        self.drop_overflow();
        self.hooks.run(&event);

        event
    }

    fn drop_overflow(&self) {
        let mut dropped = 0;
        while self.rx.len() > self.max_pending && self.rx.try_recv().is_ok() {
            dropped += 1;
        }

        if dropped > 0 {
            debug!(
                num_dropped = dropped,
                max_pending = self.max_pending,
                "Event queue is not drained, dropped the oldest events.",
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    struct RecordingExecutor {
        calls: Mutex<Vec<(Vec<String>, Option<Vec<u8>>)>>,
    }

    impl CommandExecutor for RecordingExecutor {
        fn spawn(
            &self,
            argv: &[String],
            input: Option<Vec<u8>>,
        ) -> Result<(), EventError> {
            if argv.is_empty() {
                return Err(EventError::EmptyCommand);
            }
            self.calls.lock().push((argv.to_vec(), input));
            Ok(())
        }
    }

    #[test]
    fn test_emit_queues_and_runs_hooks() -> anyhow::Result<()> {
        test_helper::init_tracing();

        let executor = Arc::new(RecordingExecutor::default());
        let sink = EventSink::new("n1", executor.clone());
        sink.hooks().set_hooks(vec![
            HookConfig {
                name: "on-forget".to_string(),
                events: vec!["forget_peer".to_string()],
                command: vec!["/usr/bin/logger".to_string(), "-t".to_string()],
            },
            HookConfig {
                name: "broken".to_string(),
                events: vec![ALL_EVENTS.to_string()],
                command: Vec::new(),
            },
        ]);

        let rx = sink.subscribe();
        let event = sink.emit(
            12.5,
            EventData::new("forget_peer")
                .with_reason("no_rx")
                .with("peer", "n2"),
        );
        assert_eq!(event.nodename, "n1");
        assert_eq!(event.kind, EVENT_KIND);
        assert_eq!(sink.pending(), 1);

        let queued = rx.try_recv()?;
        assert_eq!(queued, event);

        let calls = executor.calls.lock();
        assert_eq!(calls.len(), 1, "Only the valid matching hook should run.");
        let (argv, input) = &calls[0];
        assert_eq!(argv[0], "/usr/bin/logger");
        let input = input.as_ref().expect("Hook input should be set.");
        let sent: Event = serde_json::from_slice(input)?;
        assert_eq!(sent, event);
        Ok(())
    }

    #[test]
    fn test_unlisted_event_is_still_queued() {
        let sink = EventSink::new("n1", Arc::new(RecordingExecutor::default()));
        sink.emit(1.0, EventData::new("custom_event"));
        assert_eq!(sink.pending(), 1);
    }

    #[test]
    fn test_undrained_queue_keeps_latest_events() -> anyhow::Result<()> {
        test_helper::init_tracing();

        let sink = EventSink::new("n1", Arc::new(RecordingExecutor::default()))
            .with_max_pending(2);
        for ts in [1.0, 2.0, 3.0] {
            sink.emit(ts, EventData::new("custom_event"));
        }
        assert_eq!(sink.pending(), 2);

        let rx = sink.subscribe();
        assert_eq!(rx.try_recv()?.ts, 2.0);
        assert_eq!(rx.try_recv()?.ts, 3.0);
        Ok(())
    }
}
