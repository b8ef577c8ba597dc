use tokio_util::sync::CancellationToken;
use tracing::info;

/// Cancel the returned token on SIGINT, SIGTERM or SIGQUIT.
///
/// Handlers are registered before this returns, so a signal arriving right after start-up is not lost.
#[cfg(unix)]
pub fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    use tokio::signal::unix::{SignalKind, signal};

    let token = CancellationToken::new();
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    let cancel = token.clone();
    tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
            _ = sigquit.recv() => "SIGQUIT",
        };
        info!(target: "ibex.agentd", signal = name, "shutdown requested");
        cancel.cancel();
    });

    Ok(token)
}

#[cfg(not(unix))]
pub fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!(target: "ibex.agentd", signal = "ctrl-c", "shutdown requested");
            cancel.cancel();
        }
    });
    Ok(token)
}
