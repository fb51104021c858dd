use tokio::sync::watch;

/// Sending half of the shutdown signal, held by whoever owns the listener
#[derive(Debug)]
pub struct ShutdownTrigger(watch::Sender<bool>);

/// Receiving half of the shutdown signal, cloned into every task that must stop with the listener
#[derive(Debug, Clone)]
pub struct Shutdown(watch::Receiver<bool>);

/// Create a linked trigger/signal pair
pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (sender, receiver) = watch::channel(false);
    (ShutdownTrigger(sender), Shutdown(receiver))
}

impl ShutdownTrigger {
    /// Signal every linked [`Shutdown`]. Repeated calls are no-ops.
    pub fn trigger(&self) {
        self.0.send_replace(true);
    }

    pub fn subscribe(&self) -> Shutdown {
        Shutdown(self.0.subscribe())
    }
}

impl Shutdown {
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolve once shutdown has been triggered, or once the trigger has been dropped.
    ///
    /// Cancel-safe, so it can sit in a `select!` next to I/O.
    pub async fn cancelled(&mut self) {
        while !*self.0.borrow_and_update() {
            if self.0.changed().await.is_err() {
                return;
            }
        }
    }
}
