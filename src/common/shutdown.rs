use std::future::Future;

use tokio::sync::watch;
use tracing::debug;

use crate::error::{AuthError, AuthResult};

/// Broadcast side of the teardown signal
#[derive(Debug)]
pub struct Shutdown {
    sender: watch::Sender<bool>,
}

/// Cloneable receiving side handed to every component that makes remote calls
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self { sender }
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            receiver: self.sender.subscribe(),
        }
    }

    /// Returns false if shutdown had already been triggered
    pub fn trigger(&self) -> bool {
        let was_running = !*self.sender.borrow();
        self.sender.send_replace(true);
        was_running
    }

    pub fn is_triggered(&self) -> bool {
        *self.sender.borrow()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once shutdown is triggered
    pub async fn triggered(&mut self) {
        // An Err means the sender is gone, which counts as shutdown too
        let _ = self.receiver.wait_for(|stopped| *stopped).await;
    }

    /// Race `fut` against shutdown
    pub async fn run<T, F>(&self, operation: &str, fut: F) -> AuthResult<T>
    where
        F: Future<Output = AuthResult<T>>,
    {
        if self.is_triggered() {
            return Err(AuthError::Cancelled);
        }

        let mut signal = self.clone();
        tokio::select! {
            result = fut => result,
            _ = signal.triggered() => {
                debug!(operation, "Remote call cancelled by shutdown");
                Err(AuthError::Cancelled)
            }
        }
    }
}
