//! Deferred display of fatal startup errors.
//!
//! An error raised while the host is still starting cannot be shown right away. The reporter
//! hands it to a detached thread that polls the host until it can display messages, and gives
//! up silently after a bounded number of attempts.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error};

use crate::config::Config;
use crate::error::Result;

/// Host-side message display.
pub trait ErrorDisplay: Send + Sync + 'static {
    /// Whether the symbols needed to show a message resolved.
    fn is_available(&self) -> bool;

    /// Whether the host is in a state where a message can be shown.
    fn can_show(&self) -> bool;

    fn show(&self, message: &str, exit_host: bool);
}

#[derive(Debug)]
pub enum ReportOutcome {
    /// The display symbols are missing; the error was only logged.
    Unavailable,
    Shown,
    /// The polling thread; yields whether the message was eventually shown.
    Deferred(JoinHandle<bool>),
}

pub struct StartupErrorReporter<D> {
    display: Arc<D>,
    attempts: u32,
    interval: Duration,
}

impl<D: ErrorDisplay> StartupErrorReporter<D> {
    pub fn new(display: Arc<D>, config: &Config) -> Self {
        Self::with_polling(
            display,
            config.error_poll_attempts,
            config.error_poll_interval(),
        )
    }

    pub fn with_polling(display: Arc<D>, attempts: u32, interval: Duration) -> Self {
        Self {
            display,
            attempts,
            interval,
        }
    }

    /// Log `message` and show it, right away or once the host is ready when `wait` is set.
    pub fn report(&self, message: &str, wait: bool, exit_host: bool) -> Result<ReportOutcome> {
        error!("STARTUP ERROR: {}", message);

        if !self.display.is_available() {
            return Ok(ReportOutcome::Unavailable);
        }

        if !wait {
            self.display.show(message, exit_host);
            return Ok(ReportOutcome::Shown);
        }

        let display = Arc::clone(&self.display);
        let message = message.to_string();
        let attempts = self.attempts;
        let interval = self.interval;
        let handle = thread::Builder::new()
            .name("startup-error".to_string())
            .spawn(move || poll_and_show(&*display, &message, exit_host, attempts, interval))?;
        Ok(ReportOutcome::Deferred(handle))
    }
}

fn poll_and_show<D: ErrorDisplay + ?Sized>(
    display: &D,
    message: &str,
    exit_host: bool,
    attempts: u32,
    interval: Duration,
) -> bool {
    for attempt in 0..attempts {
        if display.can_show() {
            debug!("Host ready after {} polls", attempt);
            display.show(message, exit_host);
            return true;
        }
        thread::sleep(interval);
    }
    debug!("Host never became ready, startup error dropped");
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeDisplay {
        available: bool,
        ready_after: u32,
        polls: AtomicU32,
        shown: Mutex<Vec<(String, bool)>>,
    }

    impl FakeDisplay {
        fn new(available: bool, ready_after: u32) -> Arc<Self> {
            Arc::new(Self {
                available,
                ready_after,
                polls: AtomicU32::new(0),
                shown: Mutex::new(Vec::new()),
            })
        }

        fn shown(&self) -> Vec<(String, bool)> {
            self.shown.lock().unwrap().clone()
        }
    }

    impl ErrorDisplay for FakeDisplay {
        fn is_available(&self) -> bool {
            self.available
        }

        fn can_show(&self) -> bool {
            self.polls.fetch_add(1, Ordering::SeqCst) + 1 >= self.ready_after
        }

        fn show(&self, message: &str, exit_host: bool) {
            self.shown
                .lock()
                .unwrap()
                .push((message.to_string(), exit_host));
        }
    }

    fn reporter(display: &Arc<FakeDisplay>, attempts: u32) -> StartupErrorReporter<FakeDisplay> {
        StartupErrorReporter::with_polling(Arc::clone(display), attempts, Duration::from_millis(1))
    }

    #[test]
    fn test_immediate_report() {
        let display = FakeDisplay::new(true, 0);
        let outcome = reporter(&display, 10).report("boom", false, true).unwrap();
        assert!(matches!(outcome, ReportOutcome::Shown));
        assert_eq!(display.shown(), vec![("boom".to_string(), true)]);
    }

    #[test]
    fn test_unavailable_display_only_logs() {
        let display = FakeDisplay::new(false, 0);
        let outcome = reporter(&display, 10).report("boom", true, false).unwrap();
        assert!(matches!(outcome, ReportOutcome::Unavailable));
        assert!(display.shown().is_empty());
        assert_eq!(display.polls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_deferred_report_waits_for_host() {
        let display = FakeDisplay::new(true, 3);
        let outcome = reporter(&display, 10).report("late", true, false).unwrap();
        let ReportOutcome::Deferred(handle) = outcome else {
            panic!("expected a deferred report");
        };
        assert!(handle.join().unwrap());
        assert_eq!(display.shown(), vec![("late".to_string(), false)]);
        assert_eq!(display.polls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_deferred_report_gives_up() {
        let display = FakeDisplay::new(true, u32::MAX);
        let outcome = reporter(&display, 5).report("never", true, true).unwrap();
        let ReportOutcome::Deferred(handle) = outcome else {
            panic!("expected a deferred report");
        };
        assert!(!handle.join().unwrap());
        assert!(display.shown().is_empty());
        assert_eq!(display.polls.load(Ordering::SeqCst), 5);
    }
}
