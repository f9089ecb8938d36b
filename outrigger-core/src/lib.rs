pub mod config;
pub mod launcher;
pub mod supervisor;

pub use config::ShellConfig;
pub use launcher::{
    resolve_path, ExitInfo, NativeLauncher, ProcessLauncher, RunMode, SidecarHandle,
    SidecarOutcome,
};
pub use supervisor::{LifecycleSignal, Supervisor, SupervisorEvent, SupervisorState};
