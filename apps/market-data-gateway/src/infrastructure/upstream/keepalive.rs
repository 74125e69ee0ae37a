//! Keep-alive Ticker
//!
//! While a session is `Connected`, a fixed-interval ping is written to the
//! upstream socket so idle-timeout intermediaries keep the connection open.
//! No pong is expected; a missing pong is not an error.
//!
//! The ticker runs as its own task and is controlled through a
//! [`TimerHandle`], which cancels the task when dropped or when
//! [`TimerHandle::cancel`] is called, regardless of whether a tick is
//! pending.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Shortest period the ticker will run at.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Tick emitted by the keep-alive task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveTick;

/// Cancellable handle for a spawned timer task.
#[derive(Debug)]
pub struct TimerHandle {
    cancel: CancellationToken,
    join: Option<JoinHandle<()>>,
}

impl TimerHandle {
    /// Stop the timer. Safe to call more than once.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the timer has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel and wait for the task to exit.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Start a keep-alive ticker.
///
/// The first tick fires one full `interval` after the call. The task ends
/// when the handle is cancelled or the receiver is dropped. A zero
/// interval is raised to one millisecond.
#[must_use]
pub fn start(interval: Duration, tx: mpsc::Sender<KeepaliveTick>) -> TimerHandle {
    let interval = interval.max(MIN_INTERVAL);
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    let join = tokio::spawn(async move {
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = token.cancelled() => {
                    tracing::debug!("Keep-alive ticker cancelled");
                    break;
                }
                _ = ticker.tick() => {
                    if tx.send(KeepaliveTick).await.is_err() {
                        tracing::debug!("Keep-alive receiver closed, stopping ticker");
                        break;
                    }
                }
            }
        }
    });

    TimerHandle {
        cancel,
        join: Some(join),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ticks_after_interval() {
        let (tx, mut rx) = mpsc::channel(4);
        let handle = start(Duration::from_millis(30), tx);

        let tick = tokio::time::timeout(Duration::from_millis(300), rx.recv())
            .await
            .expect("should tick")
            .expect("channel open");
        assert_eq!(tick, KeepaliveTick);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn zero_interval_still_ticks() {
        let (tx, mut rx) = mpsc::channel(4);
        let handle = start(Duration::ZERO, tx);

        let tick = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
        assert_eq!(tick.ok().flatten(), Some(KeepaliveTick));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn no_tick_before_first_interval() {
        let (tx, mut rx) = mpsc::channel(4);
        let _handle = start(Duration::from_secs(10), tx);

        let result = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn cancel_stops_ticks() {
        let (tx, mut rx) = mpsc::channel(4);
        let handle = start(Duration::from_millis(20), tx);

        handle.cancel();
        assert!(handle.is_cancelled());
        handle.shutdown().await;

        // Task exited and dropped its sender.
        let drained = tokio::time::timeout(Duration::from_millis(500), async {
            while rx.recv().await.is_some() {}
        })
        .await;
        assert!(drained.is_ok());
    }

    #[tokio::test]
    async fn drop_cancels_task() {
        let (tx, mut rx) = mpsc::channel(4);
        drop(start(Duration::from_millis(20), tx));

        let drained = tokio::time::timeout(Duration::from_millis(500), async {
            while rx.recv().await.is_some() {}
        })
        .await;
        assert!(drained.is_ok(), "task should exit and drop its sender");
    }
}
