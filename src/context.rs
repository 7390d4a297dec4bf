//! Parent-child cancellation contexts for track lifecycles
//!
//! Contexts form a tree mirroring ownership: client → track → remote
//! track(s). Cancelling a node cancels all of its descendants; a child
//! cancelling itself never cancels its parent.

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct TrackContext {
    token: CancellationToken,
}

impl TrackContext {
    #[must_use]
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Derive a child context cancelled together with this one
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Suspend until this context is cancelled
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}
