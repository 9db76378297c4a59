//! Cancellable push feed handed out by the stores.

use std::fmt;
use tokio::sync::mpsc;

type CancelHook = Box<dyn FnOnce() + Send + Sync>;

/// Ordered change feed. Dropping it releases the listener on the store side.
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
    on_cancel: Option<CancelHook>,
}

impl<T> Subscription<T> {
    pub fn new(rx: mpsc::UnboundedReceiver<T>) -> Self {
        Self {
            rx,
            on_cancel: None,
        }
    }

    /// Runs `hook` exactly once when the subscription is cancelled or dropped.
    pub fn with_cancel(
        rx: mpsc::UnboundedReceiver<T>,
        hook: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            rx,
            on_cancel: Some(Box::new(hook)),
        }
    }

    /// Next change, or None once the store closed the feed. Cancel safe.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn cancel(self) {}
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.rx.close();
        if let Some(hook) = self.on_cancel.take() {
            hook();
        }
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("closed", &self.rx.is_closed())
            .finish()
    }
}

/// Awaits the next item of an optional subscription; pends forever on None.
pub(crate) async fn next_or_pending<T>(sub: &mut Option<Subscription<T>>) -> Option<T> {
    match sub {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}
