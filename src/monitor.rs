//! Output discovery through the compositor.
//!
//! Each compositor reports its outputs differently, so the query is a
//! [`OutputBackend`] with one implementation per compositor. The
//! [`MonitorResolver`] wraps the active backend and never fails: when the
//! query is unusable it degrades to the configured output names, then to a
//! single default output.

use crate::config::{BackendKind, Config};
use crate::error::{stderr_excerpt, QueryError};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct OutputDescriptor {
    pub name: String,
    pub enabled: bool,
    pub position: Option<(i32, i32)>,
    pub size: Option<(u32, u32)>,
    pub scale: Option<f64>,
}

impl OutputDescriptor {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            position: None,
            size: None,
            scale: None,
        }
    }

    /// Stand-in used when no output can be named. The wallpaper tool is then
    /// invoked without an output selector.
    pub fn default_output() -> Self {
        Self::named("")
    }

    pub fn is_default(&self) -> bool {
        self.name.is_empty()
    }
}

impl fmt::Display for OutputDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_default() {
            f.write_str("<default output>")
        } else {
            f.write_str(&self.name)
        }
    }
}

/// Something that can list the compositor's outputs.
pub trait OutputBackend: Send + Sync {
    fn name(&self) -> &str;

    fn list_outputs(&self) -> BoxFuture<'_, Result<Vec<OutputDescriptor>, QueryError>>;
}

async fn run_query(program: &str, args: &[String], limit: Duration) -> Result<Vec<u8>, QueryError> {
    debug!("Querying outputs: {} {:?}", program, args);

    let cmd = Command::new(program).args(args).kill_on_drop(true).output();

    let output = match timeout(limit, cmd).await {
        Ok(Ok(output)) => output,
        Ok(Err(source)) => {
            return Err(QueryError::Spawn {
                program: program.to_string(),
                source,
            });
        }
        Err(_) => {
            return Err(QueryError::TimedOut {
                program: program.to_string(),
                timeout: limit,
            });
        }
    };

    if !output.status.success() {
        return Err(QueryError::Failed {
            program: program.to_string(),
            code: output.status.code(),
            stderr: stderr_excerpt(&output.stderr),
        });
    }

    Ok(output.stdout)
}

/// Niri: `niri msg -j outputs`.
pub struct NiriBackend {
    timeout: Duration,
}

impl NiriBackend {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl OutputBackend for NiriBackend {
    fn name(&self) -> &str {
        "niri"
    }

    fn list_outputs(&self) -> BoxFuture<'_, Result<Vec<OutputDescriptor>, QueryError>> {
        async move {
            let json = ["msg", "-j", "outputs"].map(String::from);
            let unusable = match run_query("niri", &json, self.timeout).await {
                Ok(stdout) => match parse_outputs(&stdout) {
                    Ok(outputs) => return Ok(outputs),
                    Err(e) => e,
                },
                Err(e @ (QueryError::Spawn { .. } | QueryError::TimedOut { .. })) => return Err(e),
                Err(e) => e,
            };

            // Older niri builds have no JSON output.
            debug!("niri JSON listing unusable ({}), trying the text listing", unusable);
            let plain = ["msg", "outputs"].map(String::from);
            let stdout = run_query("niri", &plain, self.timeout).await?;
            parse_outputs(&stdout).or_else(|_| parse_niri_text(&stdout))
        }
        .boxed()
    }
}

/// Human-readable `niri msg outputs` listing:
///
/// ```text
/// Output "Samsung Electric Company C27F390 H4ZN" (HDMI-A-1)
///   Disabled
/// ```
pub fn parse_niri_text(stdout: &[u8]) -> Result<Vec<OutputDescriptor>, QueryError> {
    let text = String::from_utf8_lossy(stdout);
    let mut outputs: Vec<OutputDescriptor> = Vec::new();

    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("Output ") {
            let name = rest.rfind('(').and_then(|start| {
                let inner = &rest[start + 1..];
                inner.find(')').map(|end| inner[..end].trim().to_string())
            });
            match name {
                Some(name) if !name.is_empty() => outputs.push(OutputDescriptor::named(name)),
                _ => warn!("Unrecognised niri output line: {}", line),
            }
        } else if line.trim() == "Disabled" {
            if let Some(last) = outputs.last_mut() {
                last.enabled = false;
            }
        }
    }

    if outputs.is_empty() {
        return Err(QueryError::Parse("no outputs in niri listing".to_string()));
    }
    Ok(outputs)
}

#[derive(Debug, Deserialize)]
struct HyprMonitor {
    name: String,
    #[serde(default)]
    disabled: bool,
    #[serde(default)]
    x: Option<i32>,
    #[serde(default)]
    y: Option<i32>,
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
    #[serde(default)]
    scale: Option<f64>,
}

/// Hyprland: `hyprctl monitors all -j`.
pub struct HyprlandBackend {
    timeout: Duration,
}

impl HyprlandBackend {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl OutputBackend for HyprlandBackend {
    fn name(&self) -> &str {
        "hyprland"
    }

    fn list_outputs(&self) -> BoxFuture<'_, Result<Vec<OutputDescriptor>, QueryError>> {
        async move {
            let args = ["monitors", "all", "-j"].map(String::from);
            let stdout = run_query("hyprctl", &args, self.timeout).await?;
            parse_hyprland(&stdout)
        }
        .boxed()
    }
}

pub fn parse_hyprland(stdout: &[u8]) -> Result<Vec<OutputDescriptor>, QueryError> {
    let monitors: Vec<HyprMonitor> =
        serde_json::from_slice(stdout).map_err(|e| QueryError::Parse(e.to_string()))?;

    Ok(monitors
        .into_iter()
        .map(|m| OutputDescriptor {
            name: m.name,
            enabled: !m.disabled,
            position: m.x.zip(m.y),
            size: m.width.zip(m.height),
            scale: m.scale,
        })
        .collect())
}

/// Any program that prints a JSON output list.
pub struct CommandBackend {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandBackend {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }
}

impl OutputBackend for CommandBackend {
    fn name(&self) -> &str {
        &self.program
    }

    fn list_outputs(&self) -> BoxFuture<'_, Result<Vec<OutputDescriptor>, QueryError>> {
        async move {
            let stdout = run_query(&self.program, &self.args, self.timeout).await?;
            parse_outputs(&stdout)
        }
        .boxed()
    }
}

/// Parses either a JSON array of outputs or an object keyed by output name.
///
/// The enabled state is read from `enabled`, `active`, `disabled` or, as niri
/// does it, from whether a `logical` layout is present.
pub fn parse_outputs(stdout: &[u8]) -> Result<Vec<OutputDescriptor>, QueryError> {
    let value: Value = serde_json::from_slice(stdout).map_err(|e| QueryError::Parse(e.to_string()))?;

    let entries: Vec<(Option<String>, Value)> = match value {
        Value::Array(items) => items.into_iter().map(|v| (None, v)).collect(),
        Value::Object(map) => map.into_iter().map(|(k, v)| (Some(k), v)).collect(),
        other => {
            return Err(QueryError::Parse(format!(
                "expected an array or object of outputs, got {}",
                json_kind(&other)
            )));
        }
    };

    entries
        .into_iter()
        .map(|(key, entry)| describe(key, &entry))
        .collect()
}

fn describe(key: Option<String>, entry: &Value) -> Result<OutputDescriptor, QueryError> {
    let name = entry
        .get("name")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or(key)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| QueryError::Parse("output entry without a name".to_string()))?;

    let flag = |field: &str| entry.get(field).and_then(Value::as_bool);
    let enabled = flag("enabled")
        .or_else(|| flag("active"))
        .or_else(|| flag("disabled").map(|d| !d))
        .or_else(|| entry.get("logical").map(|l| !l.is_null()))
        .unwrap_or(true);

    let logical = entry.get("logical").filter(|l| !l.is_null()).unwrap_or(entry);
    let int = |v: &Value, field: &str| v.get(field).and_then(Value::as_i64);
    let position = int(logical, "x")
        .zip(int(logical, "y"))
        .map(|(x, y)| (x as i32, y as i32));
    let size = int(logical, "width")
        .zip(int(logical, "height"))
        .map(|(w, h)| (w as u32, h as u32));
    let scale = logical.get("scale").and_then(Value::as_f64);

    Ok(OutputDescriptor {
        name,
        enabled,
        position,
        size,
        scale,
    })
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Picks the backend named in the config, probing the session environment
/// for `auto`.
pub fn backend_from_config<F>(config: &Config, env: F) -> Box<dyn OutputBackend>
where
    F: Fn(&str) -> Option<String>,
{
    let limit = config.command_timeout();
    let kind = match config.outputs.backend {
        BackendKind::Auto if env("NIRI_SOCKET").is_some() => BackendKind::Niri,
        BackendKind::Auto if env("HYPRLAND_INSTANCE_SIGNATURE").is_some() => BackendKind::Hyprland,
        BackendKind::Auto => BackendKind::Niri,
        kind => kind,
    };

    match kind {
        BackendKind::Hyprland => Box::new(HyprlandBackend::new(limit)),
        BackendKind::Command => Box::new(CommandBackend::new(
            config.outputs.program.clone(),
            config.outputs.args.clone(),
            limit,
        )),
        _ => Box::new(NiriBackend::new(limit)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSource {
    Detected,
    Configured,
    Fallback,
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub outputs: Vec<OutputDescriptor>,
    pub source: OutputSource,
}

pub struct MonitorResolver {
    backend: Box<dyn OutputBackend>,
    auto_detect: bool,
    configured: Vec<String>,
}

impl MonitorResolver {
    pub fn new(backend: Box<dyn OutputBackend>, auto_detect: bool, configured: Vec<String>) -> Self {
        Self {
            backend,
            auto_detect,
            configured,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let backend = backend_from_config(config, |key| std::env::var(key).ok());
        Self::new(backend, config.outputs.auto_detect, config.outputs.names.clone())
    }

    /// Enabled outputs for this cycle.
    pub async fn resolve(&self) -> Resolution {
        if self.auto_detect {
            match self.detect().await {
                Ok(outputs) => {
                    debug!("Detected outputs via {}: {:?}", self.backend.name(), names(&outputs));
                    return Resolution {
                        outputs,
                        source: OutputSource::Detected,
                    };
                }
                Err(e) => {
                    warn!(
                        stage = %e.stage(),
                        self_resolving = e.self_resolving(),
                        "Output detection via {} failed: {}",
                        self.backend.name(),
                        e
                    );
                }
            }
        }

        if !self.configured.is_empty() {
            info!("Using configured outputs: {:?}", self.configured);
            return Resolution {
                outputs: self.configured.iter().map(OutputDescriptor::named).collect(),
                source: OutputSource::Configured,
            };
        }

        warn!("No outputs known, targeting the default output");
        Resolution {
            outputs: vec![OutputDescriptor::default_output()],
            source: OutputSource::Fallback,
        }
    }

    async fn detect(&self) -> Result<Vec<OutputDescriptor>, QueryError> {
        let outputs: Vec<OutputDescriptor> = self
            .backend
            .list_outputs()
            .await?
            .into_iter()
            .filter(|o| o.enabled)
            .collect();

        if outputs.is_empty() {
            return Err(QueryError::NoEnabledOutputs);
        }
        Ok(outputs)
    }
}

fn names(outputs: &[OutputDescriptor]) -> Vec<&str> {
    outputs.iter().map(|o| o.name.as_str()).collect()
}
