//! Worker termination outcome.

/// Result of the two-step kill policy: a graceful stop through the local
/// handle, then, if that was impossible or failed, a kill by recorded pid.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KillReport {
    /// Outcome of terminating the local handle, `None` without a handle.
    pub graceful: Option<Result<(), String>>,
    /// Outcome of killing by pid, `None` when not attempted.
    pub by_pid: Option<Result<(), String>>,
}

impl KillReport {
    pub fn graceful_succeeded(&self) -> bool {
        matches!(self.graceful, Some(Ok(())))
    }

    /// True when either step reported success.
    pub fn succeeded(&self) -> bool {
        self.graceful_succeeded() || matches!(self.by_pid, Some(Ok(())))
    }

    /// True when no step could be attempted at all.
    pub fn nothing_attempted(&self) -> bool {
        self.graceful.is_none() && self.by_pid.is_none()
    }

    pub(crate) fn log(&self, model_key: &str, pid: Option<u32>) {
        if self.succeeded() {
            tracing::info!(
                model_key,
                pid = ?pid,
                graceful = ?self.graceful,
                by_pid = ?self.by_pid,
                "Worker terminated"
            );
        } else if self.nothing_attempted() {
            tracing::warn!(model_key, "No handle or pid to terminate, forgetting worker");
        } else {
            tracing::error!(
                model_key,
                pid = ?pid,
                graceful = ?self.graceful,
                by_pid = ?self.by_pid,
                "Failed to terminate worker, forgetting it anyway"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graceful_success() {
        let report = KillReport {
            graceful: Some(Ok(())),
            by_pid: None,
        };
        assert!(report.succeeded());
        assert!(report.graceful_succeeded());
    }

    #[test]
    fn test_fallback_success() {
        let report = KillReport {
            graceful: Some(Err("wait failed".to_string())),
            by_pid: Some(Ok(())),
        };
        assert!(report.succeeded());
        assert!(!report.graceful_succeeded());
    }

    #[test]
    fn test_both_failed() {
        let report = KillReport {
            graceful: None,
            by_pid: Some(Err("ESRCH".to_string())),
        };
        assert!(!report.succeeded());
        assert!(!report.nothing_attempted());
        assert!(KillReport::default().nothing_attempted());
    }
}
