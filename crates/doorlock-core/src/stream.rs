// ── Reactive state stream ──
//
// Subscription handle over the engine's published lock state.

use tokio::sync::watch;

use crate::model::LockState;

/// A subscription to the published lock state.
///
/// Provides point-in-time access and change notification through
/// [`changed()`](Self::changed).
pub struct StateStream {
    current: LockState,
    receiver: watch::Receiver<LockState>,
}

impl StateStream {
    pub(crate) fn new(receiver: watch::Receiver<LockState>) -> Self {
        let current = *receiver.borrow();
        Self { current, receiver }
    }

    /// The state captured at creation (or at the last `changed()`).
    pub fn current(&self) -> LockState {
        self.current
    }

    /// The latest published state.
    pub fn latest(&self) -> LockState {
        *self.receiver.borrow()
    }

    /// Wait for the next published change.
    /// Returns `None` once the engine has been dropped.
    pub async fn changed(&mut self) -> Option<LockState> {
        self.receiver.changed().await.ok()?;
        let state = *self.receiver.borrow_and_update();
        self.current = state;
        Some(state)
    }

    /// Wait until the published state satisfies `predicate`.
    pub async fn wait_for(&mut self, predicate: impl FnMut(&LockState) -> bool) -> Option<LockState> {
        let state = *self.receiver.wait_for(predicate).await.ok()?;
        self.current = state;
        Some(state)
    }
}
