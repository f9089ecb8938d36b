#![cfg_attr(not(debug_assertions), windows_subsystem = "windows")]

mod app;

use outrigger_core::ShellConfig;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log::info!("Outrigger starting...");

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Failed to start async runtime: {}", e);
            std::process::exit(1);
        }
    };

    let config = ShellConfig::load();
    if let Err(e) = runtime.block_on(app::run(config)) {
        log::error!("{}", e);
        std::process::exit(1);
    }

    // Dropping the runtime abandons the sidecar watcher; the child itself is
    // left to honour the termination request.
    drop(runtime);
    log::info!("Outrigger exited");
}
