use tokio::sync::watch;
use tracing::debug;

/// Lifecycle of a watcher. States only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    Running,
    Draining,
    Stopping,
}

/// Shared, observable watcher state.
pub struct WatcherState {
    tx: watch::Sender<State>,
}

impl Default for WatcherState {
    fn default() -> Self {
        Self::new()
    }
}

impl WatcherState {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(State::Running);
        Self { tx }
    }

    /// Moves to `next` if it is later in the lifecycle than the current state.
    /// Returns whether a transition happened.
    pub fn transition(&self, next: State) -> bool {
        self.tx.send_if_modified(|current| {
            if next <= *current {
                return false;
            }
            debug!(from = ?*current, to = ?next, "Watcher state transition");
            *current = next;
            true
        })
    }

    pub fn get(&self) -> State {
        *self.tx.borrow()
    }

    pub fn is_draining(&self) -> bool {
        self.get() == State::Draining
    }

    pub fn is_stopping(&self) -> bool {
        self.get() == State::Stopping
    }

    /// Resolves once the state reaches `Stopping`.
    pub async fn wait_for_stopping(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|state| *state == State::Stopping).await;
    }
}
