use crate::config::{Config, ThemeCommand, WallpaperCommand};
use crate::detector::ResolvedChange;
use crate::error::{exit_code, stderr_excerpt, Stage};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use which::which;

/// Result of one external command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed { code: Option<i32>, stderr: String },
    TimedOut(Duration),
    SpawnFailed(String),
    MissingFile(String),
    Skipped(&'static str),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded | Outcome::Skipped(_))
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Succeeded => f.write_str("succeeded"),
            Outcome::Failed { code, stderr } if stderr.is_empty() => {
                write!(f, "failed with {}", exit_code(code))
            }
            Outcome::Failed { code, stderr } => {
                write!(f, "failed with {}: {}", exit_code(code), stderr)
            }
            Outcome::TimedOut(limit) => write!(f, "killed after {:?}", limit),
            Outcome::SpawnFailed(reason) => write!(f, "could not be started: {}", reason),
            Outcome::MissingFile(path) => write!(f, "image {} does not exist", path),
            Outcome::Skipped(reason) => write!(f, "skipped ({})", reason),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    /// Per output, sorted by output name.
    pub wallpapers: Vec<(String, Outcome)>,
    /// `None` when the theme did not need regenerating.
    pub theme: Option<Outcome>,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.wallpapers.iter().all(|(_, o)| o.is_success())
            && self.theme.as_ref().is_none_or(Outcome::is_success)
    }

    pub fn failures(&self) -> usize {
        self.wallpapers.iter().filter(|(_, o)| !o.is_success()).count()
            + usize::from(self.theme.as_ref().is_some_and(|o| !o.is_success()))
    }
}

struct Vars<'a> {
    output: &'a str,
    path: &'a str,
    scheme: &'a str,
    mode: &'a str,
    state_dir: &'a str,
    shell_dir: &'a str,
    config_dir: &'a str,
}

impl<'a> Vars<'a> {
    fn lookup(&self, name: &str) -> Option<&'a str> {
        let value = match name {
            "output" => self.output,
            "path" => self.path,
            "scheme" => self.scheme,
            "mode" => self.mode,
            "state_dir" => self.state_dir,
            "shell_dir" => self.shell_dir,
            "config_dir" => self.config_dir,
            _ => return None,
        };
        Some(value)
    }
}

/// Substitutes `{name}` placeholders in one pass, so substituted values are
/// never expanded again. Unknown names are kept literally.
fn render_arg(arg: &str, vars: &Vars<'_>) -> String {
    let mut out = String::with_capacity(arg.len());
    let mut rest = arg;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        let placeholder = tail
            .find('}')
            .and_then(|end| vars.lookup(&tail[1..end]).map(|value| (end, value)));

        match placeholder {
            Some((end, value)) => {
                out.push_str(value);
                rest = &tail[end + 1..];
            }
            None => {
                out.push('{');
                rest = &tail[1..];
            }
        }
    }

    out.push_str(rest);
    out
}

fn render(template: &[String], vars: &Vars<'_>) -> Vec<String> {
    template.iter().map(|arg| render_arg(arg, vars)).collect()
}

async fn invoke(program: &str, args: &[String], limit: Duration) -> Outcome {
    debug!("Running {} {:?}", program, args);

    let cmd = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    // Dropping the future on timeout kills the child.
    match timeout(limit, cmd).await {
        Ok(Ok(output)) if output.status.success() => Outcome::Succeeded,
        Ok(Ok(output)) => Outcome::Failed {
            code: output.status.code(),
            stderr: stderr_excerpt(&output.stderr),
        },
        Ok(Err(e)) => Outcome::SpawnFailed(format!("{}: {}", program, e)),
        Err(_) => Outcome::TimedOut(limit),
    }
}

async fn image_exists(path: &str) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Looks up every enabled tool at startup and returns the missing ones.
///
/// A missing tool is logged, not fatal: it may be installed while the daemon
/// runs, and every invocation reports its own failure anyway.
pub fn check_tools(config: &Config) -> Vec<String> {
    let tools = [
        (config.wallpaper.enabled, "wallpaper", &config.wallpaper.program),
        (config.theme.enabled, "theme", &config.theme.program),
    ];

    let mut missing = Vec::new();
    for (enabled, role, program) in tools {
        if !enabled {
            continue;
        }
        match which(program) {
            Ok(path) => debug!("{} command {} found at {:?}", role, program, path),
            Err(e) => {
                error!(
                    stage = %Stage::Execute,
                    "{} command '{}' not found ({}); set {}.program or {}.enabled = false",
                    role,
                    program,
                    e,
                    role,
                    role
                );
                missing.push(program.clone());
            }
        }
    }
    missing
}

/// Runs the wallpaper setter per output and then the theme generator.
pub struct Executor {
    wallpaper: Arc<WallpaperCommand>,
    theme: ThemeCommand,
    timeout: Duration,
    state_dir: String,
    shell_dir: String,
    config_dir: String,
    permits: Arc<Semaphore>,
}

impl Executor {
    pub fn new(config: &Config) -> Self {
        let config_dir = dirs::config_dir()
            .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
            .unwrap_or_else(|| PathBuf::from("~/.config"));

        Self {
            wallpaper: Arc::new(config.wallpaper.clone()),
            theme: config.theme.clone(),
            timeout: config.command_timeout(),
            state_dir: config.dms.state_dir.to_string_lossy().into_owned(),
            shell_dir: config.dms.shell_dir.to_string_lossy().into_owned(),
            config_dir: config_dir.to_string_lossy().into_owned(),
            permits: Arc::new(Semaphore::new(config.wallpaper.max_parallel.max(1))),
        }
    }

    pub async fn apply(&self, change: &ResolvedChange) -> ExecutionResult {
        let wallpapers = self.apply_wallpapers(change).await;

        // Only after every setter finished, so the UI never recolours ahead
        // of the image.
        let theme = if change.theme_changed {
            Some(self.apply_theme(change).await)
        } else {
            None
        };

        let result = ExecutionResult { wallpapers, theme };
        self.report(&result);
        result
    }

    async fn apply_wallpapers(&self, change: &ResolvedChange) -> Vec<(String, Outcome)> {
        if change.per_output_wallpaper.is_empty() {
            return Vec::new();
        }

        if !self.wallpaper.enabled {
            debug!("Wallpaper command disabled, skipping");
            return change
                .per_output_wallpaper
                .keys()
                .map(|name| (name.clone(), Outcome::Skipped("wallpaper command disabled")))
                .collect();
        }

        let mut tasks = JoinSet::new();
        let mut pending: BTreeSet<String> = BTreeSet::new();

        for (output, path) in &change.per_output_wallpaper {
            let template = if output.is_empty() {
                &self.wallpaper.default_output_args
            } else {
                &self.wallpaper.args
            };
            let mut args = self.wallpaper.extra_args.clone();
            args.extend(render(template, &self.vars(output, path, change)));

            let output = output.clone();
            let path = path.clone();
            let command = Arc::clone(&self.wallpaper);
            let permits = Arc::clone(&self.permits);
            let limit = self.timeout;
            pending.insert(output.clone());

            tasks.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return (output, Outcome::SpawnFailed("worker pool closed".to_string()));
                };

                if command.verify_paths && !image_exists(&path).await {
                    return (output, Outcome::MissingFile(path));
                }

                info!("Setting wallpaper {} on {}", path, display_output(&output));
                let outcome = invoke(&command.program, &args, limit).await;
                (output, outcome)
            });
        }

        let mut outcomes = Vec::with_capacity(pending.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((output, outcome)) => {
                    pending.remove(&output);
                    outcomes.push((output, outcome));
                }
                Err(e) => error!("Wallpaper task aborted: {}", e),
            }
        }
        outcomes.extend(
            pending
                .into_iter()
                .map(|output| (output, Outcome::SpawnFailed("task aborted".to_string()))),
        );

        outcomes.sort_by(|a, b| a.0.cmp(&b.0));
        outcomes
    }

    async fn apply_theme(&self, change: &ResolvedChange) -> Outcome {
        if !self.theme.enabled {
            debug!("Theme command disabled, skipping");
            return Outcome::Skipped("theme command disabled");
        }

        let Some(source) = change.theme_source.as_deref() else {
            warn!("Theme changed but no wallpaper image is available to seed it, skipping");
            return Outcome::Skipped("no wallpaper image");
        };

        if self.wallpaper.verify_paths && !image_exists(source).await {
            return Outcome::MissingFile(source.to_string());
        }

        info!(
            "Regenerating theme: scheme {}, {} mode",
            change.scheme_name,
            change.mode_name()
        );

        let mut args = self.theme.extra_args.clone();
        args.extend(render(&self.theme.args, &self.vars("", source, change)));
        invoke(&self.theme.program, &args, self.timeout).await
    }

    fn vars<'a>(&'a self, output: &'a str, path: &'a str, change: &'a ResolvedChange) -> Vars<'a> {
        Vars {
            output,
            path,
            scheme: &change.scheme_name,
            mode: change.mode_name(),
            state_dir: &self.state_dir,
            shell_dir: &self.shell_dir,
            config_dir: &self.config_dir,
        }
    }

    fn report(&self, result: &ExecutionResult) {
        for (output, outcome) in &result.wallpapers {
            if outcome.is_success() {
                debug!("Wallpaper on {} {}", display_output(output), outcome);
            } else {
                error!(
                    stage = %Stage::Execute,
                    output = %display_output(output),
                    "{} {}",
                    self.wallpaper.program,
                    outcome
                );
            }
        }

        if let Some(outcome) = &result.theme {
            if outcome.is_success() {
                debug!("Theme generation {}", outcome);
            } else {
                error!(stage = %Stage::Execute, "{} {}", self.theme.program, outcome);
            }
        }
    }
}

fn display_output(name: &str) -> &str {
    if name.is_empty() { "<default output>" } else { name }
}
