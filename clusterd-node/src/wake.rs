use std::borrow::Cow;
use std::time::Duration;

use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// A request for the orchestration task to run a reconciliation pass.
pub struct Wake {
    /// Increases with every wake request.
    pub seq: u64,
    /// Why the wake was requested, for diagnostics.
    pub reason: Cow<'static, str>,
}

/// The orchestration wake signal.
///
/// Waking never blocks and never fails, even without any subscriber.
pub struct WakeSignal {
    tx: watch::Sender<Wake>,
}

impl Default for WakeSignal {
    fn default() -> Self {
        let (tx, _) = watch::channel(Wake::default());
        Self { tx }
    }
}

impl WakeSignal {
    pub fn wake(&self, reason: impl Into<Cow<'static, str>>) {
        let reason = reason.into();
        trace!(reason = %reason, "Waking orchestration.");
        self.tx.send_modify(|wake| {
            wake.seq += 1;
            wake.reason = reason;
        });
    }

    #[inline]
    pub fn subscribe(&self) -> watch::Receiver<Wake> {
        self.tx.subscribe()
    }

    #[inline]
    /// Get a stream of wake requests.
    pub fn stream(&self) -> WatchStream<Wake> {
        WatchStream::new(self.subscribe())
    }

    #[inline]
    /// The most recent wake request.
    pub fn last(&self) -> Wake {
        self.tx.borrow().clone()
    }
}

/// Waits for the next wake request, or until `fallback` elapses.
///
/// Returns `None` on timeout, so callers run their periodic pass either way.
pub async fn wait_for_wake(
    rx: &mut watch::Receiver<Wake>,
    fallback: Duration,
) -> Option<Wake> {
    match tokio::time::timeout(fallback, rx.changed()).await {
        Ok(Ok(())) => Some(rx.borrow_and_update().clone()),
        // The sender lives as long as the cluster state.
        Ok(Err(_)) => None,
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wake_and_fallback() {
        let signal = WakeSignal::default();
        let mut rx = signal.subscribe();

        signal.wake("node mon change");
        let wake = wait_for_wake(&mut rx, Duration::from_secs(5))
            .await
            .expect("A wake should be observed.");
        assert_eq!(wake.seq, 1);
        assert_eq!(wake.reason, "node mon change");

        let wake = wait_for_wake(&mut rx, Duration::from_millis(20)).await;
        assert!(wake.is_none(), "No new wake should time out.");
    }

    #[test]
    fn test_wake_without_subscribers() {
        let signal = WakeSignal::default();
        signal.wake("first");
        signal.wake(format!("forget node {} data", "n2"));
        let last = signal.last();
        assert_eq!(last.seq, 2);
        assert_eq!(last.reason, "forget node n2 data");
    }
}
