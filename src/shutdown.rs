use tokio::sync::broadcast;

/// Listens for the connection being torn down.
///
/// Both pumps hold one and `select!` on [`Shutdown::recv`] next to their
/// blocking operation, so a teardown interrupts them promptly.
#[derive(Debug)]
pub struct Shutdown {
    shutdown: bool,
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    /// `closed` marks a listener created after the notification was sent,
    /// which would otherwise wait forever.
    pub fn new(notify: broadcast::Receiver<()>, closed: bool) -> Shutdown {
        Shutdown {
            shutdown: closed,
            notify,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    pub async fn recv(&mut self) {
        if self.shutdown {
            return;
        }

        // a send and a dropped sender both count as shutdown
        let _ = self.notify.recv().await;

        self.shutdown = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn ts_on_recv() {
        let (tx, rx) = broadcast::channel(1);
        let mut shutdown = Shutdown::new(rx, false);
        assert!(!shutdown.is_shutdown());

        tx.send(()).unwrap();
        shutdown.recv().await;
        assert!(shutdown.is_shutdown());

        // already shut down, returns at once
        tokio::time::timeout(Duration::from_secs(1), shutdown.recv())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn ts_on_late_listener() {
        let (tx, _) = broadcast::channel::<()>(1);
        let mut shutdown = Shutdown::new(tx.subscribe(), true);
        tokio::time::timeout(Duration::from_secs(1), shutdown.recv())
            .await
            .unwrap();
    }
}
