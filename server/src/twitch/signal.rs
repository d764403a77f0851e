use tokio::sync::watch;

/// Single-slot "credentials were refreshed" flag shared by the token
/// refresher (setter) and the connection supervisor (waiter/clearer).
///
/// Repeated `set` calls before the flag is cleared collapse into one wakeup.
#[derive(Clone, Debug)]
pub struct RefreshSignal {
    tx: watch::Sender<bool>,
}

impl Default for RefreshSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl RefreshSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn set(&self) {
        self.tx.send_replace(true);
    }

    pub fn clear(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the flag is set. Returns immediately if it already is.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|set| *set).await;
    }
}
