//! Periodic feedback requests
//!
//! The poller only asks; answers arrive through the receiver thread.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Span};

use super::controller::Controller;

/// Longest uninterrupted sleep, bounds how late a stop request is noticed
const SLEEP_SLICE: Duration = Duration::from_millis(10);

/// Background thread requesting all-channel feedback at a fixed period
pub struct FeedbackPoller {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl FeedbackPoller {
    /// Spawn the polling thread
    pub fn start(controller: Arc<Controller>, interval: Duration, span: Span) -> std::io::Result<Self> {
        let cancel = CancellationToken::new();
        let handle = {
            let cancel = cancel.clone();
            thread::Builder::new()
                .name("svh-poller".into())
                .spawn(move || span.in_scope(|| poll_loop(&controller, interval, &cancel)))?
        };
        debug!(target: "svh::poller", interval_ms = interval.as_millis() as u64, "feedback poller started");
        Ok(Self {
            cancel,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop and join the thread. Idempotent.
    pub fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(target: "svh::poller", "poller thread panicked");
            }
            debug!(target: "svh::poller", "feedback poller stopped");
        }
    }
}

impl Drop for FeedbackPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

fn poll_loop(controller: &Controller, interval: Duration, cancel: &CancellationToken) {
    let mut failing = false;
    while !cancel.is_cancelled() {
        let started = Instant::now();
        match controller.request_feedback_all() {
            Ok(()) => failing = false,
            Err(e) => {
                if !failing {
                    warn!(target: "svh::poller", "feedback request failed: {e}");
                }
                failing = true;
            }
        }

        while !cancel.is_cancelled() {
            let elapsed = started.elapsed();
            if elapsed >= interval {
                break;
            }
            thread::sleep((interval - elapsed).min(SLEEP_SLICE));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo::LoopbackTransport;
    use crate::protocol::InterfaceConfig;

    #[test]
    fn test_poller_sends_and_stops() {
        let controller = Arc::new(Controller::new(
            Box::new(LoopbackTransport::new()),
            InterfaceConfig::default(),
            Span::none(),
        ));
        controller.connect("loopback").unwrap();

        let mut poller =
            FeedbackPoller::start(Arc::clone(&controller), Duration::from_millis(5), Span::none())
                .unwrap();
        thread::sleep(Duration::from_millis(60));
        assert!(poller.is_running());

        let stopped_at = Instant::now();
        poller.stop();
        assert!(stopped_at.elapsed() < Duration::from_millis(100));
        assert!(!poller.is_running());
        poller.stop();

        let sent = controller.transmitted_count();
        assert!(sent >= 3, "only {sent} requests");
        thread::sleep(Duration::from_millis(20));
        assert_eq!(controller.transmitted_count(), sent);
    }
}
