use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::launcher::{resolve_path, RunMode};

const CONFIG_DIR: &str = "outrigger";
const CONFIG_FILE: &str = "shell.json";

const ENV_MODE: &str = "OUTRIGGER_MODE";
const ENV_PROJECT_ROOT: &str = "OUTRIGGER_PROJECT_ROOT";
const ENV_RESOURCES_ROOT: &str = "OUTRIGGER_RESOURCES_ROOT";
const ENV_SHUTDOWN_WAIT_MS: &str = "OUTRIGGER_SHUTDOWN_WAIT_MS";

/// Shell settings, read from `~/.config/outrigger/shell.json` and then
/// overridden by `OUTRIGGER_*` environment variables.
///
/// Every field is optional; missing roots fall back to the working directory
/// (development) or the directory the executable was installed into
/// (packaged).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    pub mode: Option<RunMode>,
    pub project_root: Option<PathBuf>,
    pub resources_root: Option<PathBuf>,
    /// How long the shell lingers after asking the sidecar to quit, so its
    /// exit gets logged. Zero means don't wait.
    pub shutdown_wait_ms: u64,
}

impl ShellConfig {
    pub fn load() -> Self {
        let mut cfg = Self::default();
        if let Some(path) = config_path() {
            cfg.apply_file(&path);
        }
        cfg.apply_overrides(|key| std::env::var(key).ok());
        cfg
    }

    fn apply_file(&mut self, path: &Path) {
        let contents = match std::fs::read_to_string(path) {
            Ok(s) => s,
            Err(_) => return,
        };
        match serde_json::from_str::<ShellConfig>(&contents) {
            Ok(file_cfg) => *self = file_cfg,
            Err(e) => log::warn!("Invalid shell config at {}: {}", path.display(), e),
        }
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(mode) = get(ENV_MODE) {
            match mode.parse::<RunMode>() {
                Ok(mode) => self.mode = Some(mode),
                Err(e) => log::warn!("Ignoring {}: {}", ENV_MODE, e),
            }
        }
        if let Some(root) = get(ENV_PROJECT_ROOT) {
            self.project_root = Some(PathBuf::from(root));
        }
        if let Some(root) = get(ENV_RESOURCES_ROOT) {
            self.resources_root = Some(PathBuf::from(root));
        }
        if let Some(ms) = get(ENV_SHUTDOWN_WAIT_MS) {
            match ms.trim().parse::<u64>() {
                Ok(ms) => self.shutdown_wait_ms = ms,
                Err(e) => log::warn!("Ignoring {}='{}': {}", ENV_SHUTDOWN_WAIT_MS, ms, e),
            }
        }
    }

    pub fn run_mode(&self) -> RunMode {
        self.mode.unwrap_or_else(RunMode::from_build)
    }

    pub fn shutdown_wait(&self) -> Option<Duration> {
        (self.shutdown_wait_ms > 0).then(|| Duration::from_millis(self.shutdown_wait_ms))
    }

    /// Absolute location of the sidecar executable for this run. Only the root
    /// the current mode needs is looked up.
    pub fn sidecar_path(&self) -> Result<PathBuf, String> {
        let mode = self.run_mode();
        let (project_root, resources_root) = match mode {
            RunMode::Development => {
                let root = match &self.project_root {
                    Some(root) => root.clone(),
                    None => std::env::current_dir()
                        .map_err(|e| format!("Failed to determine working directory: {}", e))?,
                };
                (root, PathBuf::new())
            }
            RunMode::Packaged => {
                let root = match &self.resources_root {
                    Some(root) => root.clone(),
                    None => default_resources_root()?,
                };
                (PathBuf::new(), root)
            }
        };
        Ok(resolve_path(mode, &project_root, &resources_root))
    }
}

pub fn config_path() -> Option<PathBuf> {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        if !xdg.is_empty() {
            return Some(PathBuf::from(xdg).join(CONFIG_DIR).join(CONFIG_FILE));
        }
    }
    dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
}

fn default_resources_root() -> Result<PathBuf, String> {
    let exe = std::env::current_exe()
        .map_err(|e| format!("Failed to locate the running executable: {}", e))?;
    Ok(resources_root_for_exe(&exe))
}

/// Resources directory for an installed executable: `Contents/Resources` for
/// a macOS bundle, otherwise the directory holding the executable.
pub fn resources_root_for_exe(exe: &Path) -> PathBuf {
    let exe_dir = exe.parent().unwrap_or_else(|| Path::new("."));
    if exe_dir.file_name().is_some_and(|name| name == "MacOS") {
        if let Some(contents) = exe_dir
            .parent()
            .filter(|dir| dir.file_name().is_some_and(|name| name == "Contents"))
        {
            return contents.join("Resources");
        }
    }
    exe_dir.to_path_buf()
}
