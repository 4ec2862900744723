use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

pub(crate) fn spawn_shutdown_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(signal) => signal,
            Err(err) => {
                tracing::warn!(error = %err, "failed to register SIGINT handler");
                return;
            }
        };
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(err) => {
                tracing::warn!(error = %err, "failed to register SIGTERM handler");
                return;
            }
        };
        let mut sighup = match signal(SignalKind::hangup()) {
            Ok(signal) => signal,
            Err(err) => {
                tracing::warn!(error = %err, "failed to register SIGHUP handler");
                return;
            }
        };
        let mut sigquit = match signal(SignalKind::quit()) {
            Ok(signal) => signal,
            Err(err) => {
                tracing::warn!(error = %err, "failed to register SIGQUIT handler");
                return;
            }
        };

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = sigint.recv() => {
                tracing::info!("received SIGINT, cancelling running tasks");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, cancelling running tasks");
            }
            _ = sighup.recv() => {
                tracing::info!("received SIGHUP, cancelling running tasks");
            }
            _ = sigquit.recv() => {
                tracing::info!("received SIGQUIT, cancelling running tasks");
            }
        }

        shutdown.cancel();
    });
}
