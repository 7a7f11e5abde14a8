//! Bounded waiting on locally observable state.
//!
//! Every blocking point (handshake completion, `server_ready`, flag waits)
//! polls with tiered backoff: spin for 1000 iterations, then sleep 10µs for
//! 4000 iterations, then sleep 100µs until the deadline or a stop request.

use crate::error::{RdsmError, Result};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// First unrecoverable failure observed by a background thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    /// Work request that failed, when the fault is a completion error.
    pub wr_id: Option<u64>,
    pub message: String,
}

impl Fault {
    pub fn from_error(err: &RdsmError) -> Self {
        match err {
            RdsmError::Completion { wr_id, status } => Self {
                wr_id: Some(*wr_id),
                message: status.clone(),
            },
            other => Self {
                wr_id: None,
                message: other.to_string(),
            },
        }
    }

    pub fn to_error(&self) -> RdsmError {
        match self.wr_id {
            Some(wr_id) => RdsmError::Completion {
                wr_id,
                status: self.message.clone(),
            },
            None => RdsmError::device(self.message.clone()),
        }
    }
}

/// External stop request and fault record shared by a cluster's threads
/// and waiters.
#[derive(Debug, Default)]
pub struct StopSignal {
    stopped: AtomicBool,
    fault: OnceLock<Fault>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Record a fault. Only the first one is kept.
    pub fn fail(&self, fault: Fault) {
        let _ = self.fault.set(fault);
    }

    pub fn fault(&self) -> Option<&Fault> {
        self.fault.get()
    }

    /// `Err` if a fault was recorded or a stop was requested.
    pub fn check(&self) -> Result<()> {
        if let Some(f) = self.fault() {
            return Err(f.to_error());
        }
        if self.is_stopped() {
            return Err(RdsmError::Cancelled);
        }
        Ok(())
    }
}

/// Tiered spin-then-sleep backoff.
#[derive(Debug, Default)]
pub(crate) struct Backoff {
    iter: u32,
}

impl Backoff {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn snooze(&mut self) {
        if self.iter < 1000 {
            std::hint::spin_loop();
        } else if self.iter < 5000 {
            std::thread::sleep(Duration::from_micros(10));
        } else {
            std::thread::sleep(Duration::from_micros(100));
        }
        self.iter = self.iter.saturating_add(1);
    }
}

/// Poll `probe` until it yields a value, the deadline passes or `stop` fires.
///
/// `probe` errors end the wait immediately. On expiry the error built by
/// `on_timeout` is returned; on a recorded fault, that fault; on a stop
/// request, `Cancelled`.
pub(crate) fn wait_until<T>(
    timeout: Duration,
    stop: &StopSignal,
    mut probe: impl FnMut() -> Result<Option<T>>,
    on_timeout: impl FnOnce() -> RdsmError,
) -> Result<T> {
    let start = Instant::now();
    let mut backoff = Backoff::new();
    loop {
        if let Some(v) = probe()? {
            return Ok(v);
        }
        stop.check()?;
        if start.elapsed() > timeout {
            return Err(on_timeout());
        }
        backoff.snooze();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_wait_returns_value() {
        let stop = StopSignal::new();
        let calls = AtomicU32::new(0);
        let v = wait_until(
            Duration::from_secs(1),
            &stop,
            || {
                let n = calls.fetch_add(1, Ordering::Relaxed);
                Ok((n == 3).then_some(n))
            },
            || RdsmError::Cancelled,
        )
        .unwrap();
        assert_eq!(v, 3);
    }

    #[test]
    fn test_wait_times_out() {
        let stop = StopSignal::new();
        let err = wait_until::<()>(
            Duration::from_millis(5),
            &stop,
            || Ok(None),
            || RdsmError::SyncTimeout {
                flag: 1,
                timeout_ms: 5,
            },
        )
        .unwrap_err();
        assert!(matches!(err, RdsmError::SyncTimeout { flag: 1, .. }));
    }

    #[test]
    fn test_wait_cancelled_by_stop() {
        let stop = Arc::new(StopSignal::new());
        let stopper = Arc::clone(&stop);
        let h = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            stopper.stop();
        });
        let err = wait_until::<()>(
            Duration::from_secs(30),
            &stop,
            || Ok(None),
            || RdsmError::Cancelled,
        )
        .unwrap_err();
        h.join().unwrap();
        assert!(matches!(err, RdsmError::Cancelled));
    }

    #[test]
    fn test_fault_wins_over_timeout() {
        let stop = StopSignal::new();
        stop.fail(Fault {
            wr_id: Some(0x42),
            message: "remote access error".into(),
        });
        stop.fail(Fault {
            wr_id: None,
            message: "second".into(),
        });
        let err = wait_until::<()>(
            Duration::from_secs(30),
            &stop,
            || Ok(None),
            || RdsmError::Cancelled,
        )
        .unwrap_err();
        assert!(matches!(err, RdsmError::Completion { wr_id: 0x42, .. }));
    }

    #[test]
    fn test_probe_error_propagates() {
        let stop = StopSignal::new();
        let err = wait_until::<()>(
            Duration::from_secs(1),
            &stop,
            || Err(RdsmError::device("boom")),
            || RdsmError::Cancelled,
        )
        .unwrap_err();
        assert!(err.to_string().contains("boom"));
    }
}
