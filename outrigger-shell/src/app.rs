// ---------------------------------------------------------------------------
// Host application lifecycle
// ---------------------------------------------------------------------------
//
// The shell owns no window of its own; it stands in for the desktop host and
// produces the two lifecycle signals the supervisor reacts to:
//
// - Ready:    once the runtime is up
// - WillQuit: on Ctrl-C, or SIGTERM on Unix

use outrigger_core::{LifecycleSignal, NativeLauncher, ShellConfig, Supervisor};

pub async fn run(config: ShellConfig) -> Result<(), String> {
    let sidecar_path = config.sidecar_path()?;
    log::info!("Running in {:?} mode", config.run_mode());

    let supervisor = Supervisor::new(NativeLauncher, sidecar_path);
    supervisor.handle_signal(LifecycleSignal::Ready);

    wait_for_quit().await;
    log::info!("Quit requested, shutting down");
    supervisor.handle_signal(LifecycleSignal::WillQuit);

    if let Some(wait) = config.shutdown_wait() {
        if !supervisor.wait_until_idle(wait).await {
            log::warn!(
                "Sidecar still running after {}ms, exiting anyway",
                wait.as_millis()
            );
        }
    }
    Ok(())
}

async fn wait_for_quit() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
                return;
            }
            Err(e) => log::warn!("Failed to install SIGTERM handler: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for Ctrl-C: {}", e);
    }
}
