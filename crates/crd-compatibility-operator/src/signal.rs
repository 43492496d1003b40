use snafu::{ResultExt, Snafu};
use tokio::{
    signal::unix::{SignalKind, signal},
    sync::watch,
};

#[derive(Debug, Snafu)]
#[snafu(display("failed to construct signal watcher"))]
pub struct SignalError {
    source: std::io::Error,
}

/// Fans a termination signal out to every acquired handle.
pub struct SignalWatcher {
    watch_rx: watch::Receiver<()>,
}

impl SignalWatcher {
    /// Watches `SIGTERM` and `SIGINT`, whichever arrives first.
    pub fn termination() -> Result<Self, SignalError> {
        let mut sigterm = signal(SignalKind::terminate()).context(SignalSnafu)?;
        let mut sigint = signal(SignalKind::interrupt()).context(SignalSnafu)?;
        let (watch_tx, watch_rx) = watch::channel(());

        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => tracing::debug!("received SIGTERM"),
                _ = sigint.recv() => tracing::debug!("received SIGINT"),
            }
            watch_tx.send(())
        });

        Ok(Self { watch_rx })
    }

    /// Acquires a handle which completes once a termination signal is received.
    pub fn handle(&self) -> impl Future<Output = ()> + use<> {
        let mut watch_rx = self.watch_rx.clone();

        async move {
            watch_rx.changed().await.ok();
        }
    }
}
