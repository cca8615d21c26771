use std::sync::{Mutex, MutexGuard};

type Cleanup = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupToken(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("interrupt already requested")]
pub struct AlreadyInterrupted;

#[derive(Default)]
struct InterruptState {
    interrupted: bool,
    cleanups: Vec<(u64, Cleanup)>,
    next_token: u64,
}

/// The one piece of shared mutable state in a run. Setting the flag and
/// taking the composed cleanup happen under a single lock acquisition.
#[derive(Default)]
pub struct InterruptCell {
    state: Mutex<InterruptState>,
}

impl std::fmt::Debug for InterruptCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("InterruptCell")
            .field("interrupted", &state.interrupted)
            .field("cleanups", &state.cleanups.len())
            .finish()
    }
}

impl InterruptCell {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, InterruptState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_interrupted(&self) -> bool {
        self.lock().interrupted
    }

    /// Adds `cleanup` to the composed teardown. When the cell is already
    /// interrupted the cleanup runs immediately and the caller must not start
    /// its operation.
    pub fn compose(
        &self,
        cleanup: impl FnOnce() + Send + 'static,
    ) -> Result<CleanupToken, AlreadyInterrupted> {
        let mut state = self.lock();
        if state.interrupted {
            drop(state);
            cleanup();
            return Err(AlreadyInterrupted);
        }
        let token = state.next_token;
        state.next_token = state.next_token.wrapping_add(1);
        state.cleanups.push((token, Box::new(cleanup)));
        Ok(CleanupToken(token))
    }

    /// Drops the cleanup of an operation that finished on its own.
    pub fn release(&self, token: CleanupToken) {
        self.lock().cleanups.retain(|(id, _)| *id != token.0);
    }

    /// Returns `true` for the call that performed the interrupt; later calls
    /// are no-ops.
    pub fn interrupt(&self) -> bool {
        let cleanups = {
            let mut state = self.lock();
            if state.interrupted {
                return false;
            }
            state.interrupted = true;
            std::mem::take(&mut state.cleanups)
        };
        for (_, cleanup) in cleanups {
            cleanup();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn interrupt_runs_every_composed_cleanup_exactly_once() {
        let cell = InterruptCell::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let count = count.clone();
            cell.compose(move || {
                count.fetch_add(1, Ordering::SeqCst);
            })
            .expect("compose");
        }

        assert!(cell.interrupt());
        assert!(!cell.interrupt());
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(cell.is_interrupted());
    }

    #[test]
    fn released_cleanups_do_not_run() {
        let cell = InterruptCell::new();
        let count = Arc::new(AtomicUsize::new(0));
        let first = {
            let count = count.clone();
            cell.compose(move || {
                count.fetch_add(10, Ordering::SeqCst);
            })
            .expect("compose")
        };
        {
            let count = count.clone();
            cell.compose(move || {
                count.fetch_add(1, Ordering::SeqCst);
            })
            .expect("compose");
        }
        cell.release(first);
        cell.interrupt();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn composing_after_interrupt_runs_cleanup_immediately() {
        let cell = InterruptCell::new();
        cell.interrupt();
        let count = Arc::new(AtomicUsize::new(0));
        let result = {
            let count = count.clone();
            cell.compose(move || {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        assert_eq!(result, Err(AlreadyInterrupted));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
