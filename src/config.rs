use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

const ENV_PREFIX: &str = "SWWW_SYNC_";

pub const DEFAULT_SCHEME: &str = "scheme-tonal-spot";

pub const SYSTEM_CONFIG_PATH: &str = "/etc/swww-sync/config.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: General,
    pub dms: Dms,
    pub outputs: Outputs,
    pub wallpaper: WallpaperCommand,
    pub theme: ThemeCommand,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct General {
    pub log_level: String,
    /// Quiet window used to collapse bursts of file events.
    pub debounce_ms: u64,
    /// Upper bound for every external command before it is killed.
    pub command_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Dms {
    pub session_file: PathBuf,
    pub settings_file: PathBuf,
    pub state_dir: PathBuf,
    pub shell_dir: PathBuf,
    pub default_scheme: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Auto,
    Niri,
    Hyprland,
    Command,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Outputs {
    pub backend: BackendKind,
    pub auto_detect: bool,
    /// Explicit output names used when auto-detection is unavailable.
    pub names: Vec<String>,
    /// Program for the `command` backend.
    pub program: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WallpaperCommand {
    pub enabled: bool,
    pub program: String,
    /// Argument template for a named output.
    pub args: Vec<String>,
    /// Argument template when no output could be named.
    pub default_output_args: Vec<String>,
    pub extra_args: Vec<String>,
    pub max_parallel: usize,
    pub verify_paths: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThemeCommand {
    pub enabled: bool,
    pub program: String,
    pub args: Vec<String>,
    pub extra_args: Vec<String>,
    /// Regenerate the theme whenever the seeding wallpaper changes, not only
    /// on mode or scheme flips.
    pub on_wallpaper_change: bool,
}

impl Default for General {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            debounce_ms: 100,
            command_timeout_ms: 30_000,
        }
    }
}

impl Default for Dms {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_default();
        let state = dirs::state_dir().unwrap_or_else(|| home.join(".local/state"));
        let config = dirs::config_dir().unwrap_or_else(|| home.join(".config"));
        let cache = dirs::cache_dir().unwrap_or_else(|| home.join(".cache"));

        Self {
            session_file: state.join("DankMaterialShell/session.json"),
            settings_file: config.join("DankMaterialShell/settings.json"),
            state_dir: cache.join("DankMaterialShell"),
            shell_dir: PathBuf::from("/usr/share/quickshell/dms"),
            default_scheme: DEFAULT_SCHEME.to_string(),
        }
    }
}

impl Default for Outputs {
    fn default() -> Self {
        Self {
            backend: BackendKind::Auto,
            auto_detect: true,
            names: Vec::new(),
            program: String::new(),
            args: Vec::new(),
        }
    }
}

impl Default for WallpaperCommand {
    fn default() -> Self {
        Self {
            enabled: true,
            program: "awww".to_string(),
            args: ["img", "--outputs", "{output}", "{path}"].map(String::from).to_vec(),
            default_output_args: ["img", "{path}"].map(String::from).to_vec(),
            extra_args: Vec::new(),
            max_parallel: 8,
            verify_paths: true,
        }
    }
}

impl Default for ThemeCommand {
    fn default() -> Self {
        Self {
            enabled: true,
            program: "dms".to_string(),
            args: [
                "matugen",
                "queue",
                "--state-dir",
                "{state_dir}",
                "--shell-dir",
                "{shell_dir}",
                "--config-dir",
                "{config_dir}",
                "--kind",
                "image",
                "--value",
                "{path}",
                "--mode",
                "{mode}",
                "--matugen-type",
                "{scheme}",
                "--wait",
            ]
            .map(String::from)
            .to_vec(),
            extra_args: Vec::new(),
            on_wallpaper_change: false,
        }
    }
}

impl Config {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("swww-sync/config.toml"))
    }

    /// Defaults, then the config file, then `SWWW_SYNC_*` variables.
    ///
    /// Without an explicit path the user file is tried first, then the
    /// system-wide one.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let candidates: Vec<PathBuf> = Self::default_path()
            .into_iter()
            .chain([PathBuf::from(SYSTEM_CONFIG_PATH)])
            .collect();

        let mut config = match locate(path, &candidates) {
            Some(path) if path.exists() => {
                let content = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                    path: path.clone(),
                    source,
                })?;
                info!("Loading config from {:?}", path);
                Self::from_toml_str(&content).map_err(|source| ConfigError::Parse { path, source })?
            }
            Some(path) => {
                info!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
            None => {
                info!("No config file in {:?}, using defaults", candidates);
                Self::default()
            }
        };

        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.expand_paths();
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |suffix: &str| lookup(&format!("{}{}", ENV_PREFIX, suffix));

        if let Some(level) = get("LOG_LEVEL") {
            self.general.log_level = level;
        }
        if let Some(ms) = get("DEBOUNCE_MS").and_then(|v| parse_env("DEBOUNCE_MS", &v)) {
            self.general.debounce_ms = ms;
        }
        if let Some(ms) = get("COMMAND_TIMEOUT_MS").and_then(|v| parse_env("COMMAND_TIMEOUT_MS", &v)) {
            self.general.command_timeout_ms = ms;
        }
        if let Some(path) = get("SESSION_FILE") {
            self.dms.session_file = PathBuf::from(path);
        }
        if let Some(path) = get("SETTINGS_FILE") {
            self.dms.settings_file = PathBuf::from(path);
        }
        if let Some(scheme) = get("SCHEME") {
            self.dms.default_scheme = scheme;
        }
        if let Some(outputs) = get("OUTPUTS") {
            self.outputs.names = split_names(&outputs);
        }
        if let Some(backend) = get("OUTPUT_BACKEND") {
            match backend.to_lowercase().as_str() {
                "auto" => self.outputs.backend = BackendKind::Auto,
                "niri" => self.outputs.backend = BackendKind::Niri,
                "hyprland" => self.outputs.backend = BackendKind::Hyprland,
                "command" => self.outputs.backend = BackendKind::Command,
                other => warn!("Ignoring unknown {}OUTPUT_BACKEND '{}'", ENV_PREFIX, other),
            }
        }
        if let Some(enabled) = get("WALLPAPER_ENABLED").and_then(|v| parse_env("WALLPAPER_ENABLED", &v)) {
            self.wallpaper.enabled = enabled;
        }
        if let Some(enabled) = get("THEME_ENABLED").and_then(|v| parse_env("THEME_ENABLED", &v)) {
            self.theme.enabled = enabled;
        }
    }

    /// Expands `~` and `$VAR` in every configured path.
    pub fn expand_paths(&mut self) {
        self.dms.session_file = expand_path(&self.dms.session_file);
        self.dms.settings_file = expand_path(&self.dms.settings_file);
        self.dms.state_dir = expand_path(&self.dms.state_dir);
        self.dms.shell_dir = expand_path(&self.dms.shell_dir);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str, reason: String| ConfigError::Invalid {
            key: key.to_string(),
            reason,
        };

        match self.general.log_level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => return Err(invalid("general.log_level", format!("unknown level '{}'", other))),
        }
        if self.general.debounce_ms == 0 {
            return Err(invalid("general.debounce_ms", "must be greater than zero".to_string()));
        }
        if self.general.command_timeout_ms == 0 {
            return Err(invalid("general.command_timeout_ms", "must be greater than zero".to_string()));
        }
        if self.dms.session_file.file_name().is_none() {
            return Err(invalid(
                "dms.session_file",
                format!("{:?} does not name a file", self.dms.session_file),
            ));
        }
        if self.wallpaper.enabled && self.wallpaper.program.trim().is_empty() {
            return Err(invalid("wallpaper.program", "must not be empty".to_string()));
        }
        if self.wallpaper.max_parallel == 0 {
            return Err(invalid("wallpaper.max_parallel", "must be greater than zero".to_string()));
        }
        if self.theme.enabled && self.theme.program.trim().is_empty() {
            return Err(invalid("theme.program", "must not be empty".to_string()));
        }
        if self.outputs.backend == BackendKind::Command && self.outputs.program.trim().is_empty() {
            return Err(invalid(
                "outputs.program",
                "required when outputs.backend = \"command\"".to_string(),
            ));
        }

        if let Some(parent) = self.dms.session_file.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                warn!("Session file directory does not exist yet: {:?}", parent);
            }
        }

        Ok(())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.general.debounce_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.general.command_timeout_ms)
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

/// An explicit path is used as is; otherwise the first existing candidate.
fn locate(explicit: Option<&Path>, candidates: &[PathBuf]) -> Option<PathBuf> {
    match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => candidates.iter().find(|p| p.exists()).cloned(),
    }
}

pub fn expand_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    match shellexpand::full(&raw) {
        Ok(expanded) => PathBuf::from(expanded.into_owned()),
        Err(e) => {
            debug!("Could not expand {:?}: {}", path, e);
            path.to_path_buf()
        }
    }
}

pub fn split_names(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_env<T: std::str::FromStr>(suffix: &str, value: &str) -> Option<T> {
    match value.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Ignoring invalid {}{}='{}'", ENV_PREFIX, suffix, value);
            None
        }
    }
}
