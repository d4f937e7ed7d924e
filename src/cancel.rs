use std::sync::Arc;

use tokio::sync::watch;

/// Cooperative cancellation flag shared between a request scope and every
/// await point beneath it. Cancelling is sticky and idempotent.
#[derive(Clone, Debug)]
pub struct CancelToken {
    state: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (state, _) = watch::channel(false);
        Self {
            state: Arc::new(state),
        }
    }

    pub fn cancel(&self) {
        self.state.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.state.borrow()
    }

    pub async fn cancelled(&self) {
        let mut changes = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = changes.wait_for(|cancelled| *cancelled).await;
    }

    pub fn child(&self) -> CancelToken {
        let child = CancelToken::new();
        if self.is_cancelled() {
            child.cancel();
            return child;
        }

        let parent = self.clone();
        let linked = child.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = parent.cancelled() => linked.cancel(),
                _ = linked.cancelled() => {}
            }
        });
        child
    }
}

#[derive(Debug)]
pub struct CancelOnDrop(CancelToken);

impl CancelOnDrop {
    pub fn new(token: CancelToken) -> Self {
        Self(token)
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}
