//! Interrupt handling for active tunnels.

use std::future::Future;
use std::io;

use tokio::task::JoinHandle;

use crate::tunnel::SessionHandle;

/// Closes a session when the process receives an interrupt.
///
/// One watcher is armed per session. It disarms itself after closing the
/// session, and also when the session closes for any other reason, so a later
/// interrupt never reaches a session that is already gone. Dropping the watcher
/// disarms it.
#[derive(Debug)]
pub struct SignalWatcher {
    task: JoinHandle<()>,
}

impl SignalWatcher {
    /// Arms a watcher for Ctrl-C / `SIGINT`.
    #[must_use]
    pub fn arm(session: SessionHandle) -> Self {
        Self::arm_with(session, tokio::signal::ctrl_c())
    }

    /// Arms a watcher that closes `session` once `signal` completes.
    #[must_use]
    pub fn arm_with<F>(session: SessionHandle, signal: F) -> Self
    where
        F: Future<Output = io::Result<()>> + Send + 'static,
    {
        let task = tokio::spawn(async move {
            tokio::select! {
                received = signal => match received {
                    Ok(()) => {
                        tracing::info!("Closing port forward on interrupt");
                        session.close();
                    }

                    Err(e) => {
                        tracing::warn!("failed to listen for interrupt: {e}");
                    }
                },

                () = session.closed() => {
                    tracing::debug!("session closed, disarming interrupt watcher");
                }
            }
        });

        Self { task }
    }

    /// Whether the watcher is still listening.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stops listening without touching the session.
    pub fn disarm(self) {
        self.task.abort();
    }
}

impl Drop for SignalWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::oneshot;

    use super::*;
    use crate::tunnel::tests::{EchoDialer, web_target};
    use crate::tunnel::{PortPair, TunnelManager, TunnelState};

    fn signal_from(rx: oneshot::Receiver<()>) -> impl Future<Output = io::Result<()>> + Send {
        async move {
            rx.await.map_err(io::Error::other)
        }
    }

    async fn wait_disarmed(watcher: &SignalWatcher) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while watcher.is_armed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn signal_closes_session_and_disarms() {
        let manager = TunnelManager::new(EchoDialer::default());
        let mut session = manager
            .start(web_target(), PortPair::new(None, 8080))
            .await
            .unwrap();

        let (tx, rx) = oneshot::channel();
        let watcher = SignalWatcher::arm_with(session.handle(), signal_from(rx));
        assert!(watcher.is_armed());

        tx.send(()).unwrap();
        session.wait().await.unwrap();

        assert_eq!(session.state(), TunnelState::Closed);
        wait_disarmed(&watcher).await;
    }

    #[tokio::test]
    async fn explicit_close_disarms_watcher() {
        let manager = TunnelManager::new(EchoDialer::default());
        let session = manager
            .start(web_target(), PortPair::new(None, 8080))
            .await
            .unwrap();

        let (_tx, rx) = oneshot::channel();
        let watcher = SignalWatcher::arm_with(session.handle(), signal_from(rx));

        session.close();
        wait_disarmed(&watcher).await;
    }

    #[tokio::test]
    async fn signal_after_close_is_harmless() {
        let manager = TunnelManager::new(EchoDialer::default());
        let session = manager
            .start(web_target(), PortPair::new(None, 8080))
            .await
            .unwrap();

        let (tx, rx) = oneshot::channel();
        let watcher = SignalWatcher::arm_with(session.handle(), signal_from(rx));

        session.close();
        wait_disarmed(&watcher).await;

        // Receiver is gone with the disarmed task.
        assert!(tx.send(()).is_err());
        assert_eq!(session.state(), TunnelState::Closed);
    }

    #[tokio::test]
    async fn each_session_gets_its_own_watcher() {
        let manager = TunnelManager::new(EchoDialer::default());
        let first = manager
            .start(web_target(), PortPair::new(None, 8080))
            .await
            .unwrap();
        let second = manager
            .start(web_target(), PortPair::new(None, 8080))
            .await
            .unwrap();

        let (first_tx, first_rx) = oneshot::channel();
        let (_second_tx, second_rx) = oneshot::channel();
        let first_watcher = SignalWatcher::arm_with(first.handle(), signal_from(first_rx));
        let second_watcher = SignalWatcher::arm_with(second.handle(), signal_from(second_rx));

        first_tx.send(()).unwrap();
        first.handle().closed().await;
        wait_disarmed(&first_watcher).await;

        assert_eq!(second.state(), TunnelState::Forwarding);
        assert!(second_watcher.is_armed());

        second_watcher.disarm();
        second.close();
    }
}
