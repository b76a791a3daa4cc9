//! At most one current resolve operation
//!
//! Starting a new run cancels the previous run's token. Results from a
//! superseded run are dropped by checking [`RunGuard::is_current`].

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Handle for one resolve run
#[derive(Debug, Clone)]
pub struct RunTicket {
    pub id: u64,
    pub token: CancellationToken,
}

#[derive(Debug, Default)]
struct GuardState {
    generation: u64,
    current: Option<CancellationToken>,
}

#[derive(Debug, Default)]
pub struct RunGuard {
    state: Mutex<GuardState>,
}

impl RunGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the current run and start a new one
    pub fn begin(&self) -> RunTicket {
        let mut state = self.state.lock();
        if let Some(previous) = state.current.take() {
            previous.cancel();
            debug!("Run {} superseded", state.generation);
        }

        state.generation += 1;
        let token = CancellationToken::new();
        state.current = Some(token.clone());

        RunTicket {
            id: state.generation,
            token,
        }
    }

    pub fn is_current(&self, id: u64) -> bool {
        let state = self.state.lock();
        state.generation == id && state.current.as_ref().is_some_and(|t| !t.is_cancelled())
    }

    /// Cancel whatever is running without starting a new run
    pub fn cancel_all(&self) {
        let mut state = self.state.lock();
        if let Some(current) = state.current.take() {
            current.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_begin_invalidates_previous() {
        let guard = RunGuard::new();
        let first = guard.begin();
        assert!(guard.is_current(first.id));

        let second = guard.begin();
        assert!(!guard.is_current(first.id));
        assert!(first.token.is_cancelled());
        assert!(guard.is_current(second.id));
        assert!(second.id > first.id);
    }

    #[test]
    fn test_cancel_all() {
        let guard = RunGuard::new();
        let ticket = guard.begin();
        guard.cancel_all();
        assert!(ticket.token.is_cancelled());
        assert!(!guard.is_current(ticket.id));
    }

    #[tokio::test]
    async fn test_pending_work_stops_on_supersede() {
        let guard = RunGuard::new();
        let first = guard.begin();

        let token = first.token.clone();
        let work = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => "cancelled",
                _ = tokio::time::sleep(Duration::from_secs(30)) => "finished",
            }
        });

        guard.begin();
        assert_eq!(work.await.unwrap(), "cancelled");
    }
}
