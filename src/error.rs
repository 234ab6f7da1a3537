use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Pipeline stage an error originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Config,
    Watch,
    Parse,
    Resolve,
    Execute,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Config => "config",
            Stage::Watch => "watch",
            Stage::Parse => "parse",
            Stage::Resolve => "resolve",
            Stage::Execute => "execute",
        };
        f.write_str(name)
    }
}

/// Watch registration or event stream failure. Always fatal: the watcher is
/// the only trigger source of the daemon.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("state file path {0:?} has no parent directory or file name")]
    InvalidPath(PathBuf),

    #[error("state directory {path:?} is not accessible: {source}")]
    DirectoryInaccessible {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to initialise inotify: {0}")]
    Init(#[source] io::Error),

    #[error("failed to watch {path:?}: {source}")]
    Register {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("inotify event stream failed: {0}")]
    Stream(#[source] io::Error),

    #[error("watched directory {0:?} was removed or moved")]
    DirectoryRemoved(PathBuf),
}

impl WatchError {
    pub fn stage(&self) -> Stage {
        Stage::Watch
    }
}

/// State or settings document could not be turned into a snapshot.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("session file {0:?} does not exist")]
    NotFound(PathBuf),

    #[error("failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("session document is empty")]
    Empty,

    #[error("malformed session document: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("missing required field '{0}' in single wallpaper mode")]
    MissingField(&'static str),

    #[error("per-monitor mode enabled but 'monitorWallpapers' has no entries and no 'wallpaperPath' fallback")]
    NoMonitorWallpapers,
}

impl ParseError {
    pub fn stage(&self) -> Stage {
        Stage::Parse
    }

    /// Whether the condition usually clears once the shell finishes writing
    /// the file.
    pub fn self_resolving(&self) -> bool {
        matches!(self, ParseError::NotFound(_) | ParseError::Empty)
    }
}

/// Output query failure. Never fatal, the resolver degrades instead.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("failed to run '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("'{program}' exited with {}: {stderr}", exit_code(.code))]
    Failed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("'{program}' did not answer within {timeout:?}")]
    TimedOut { program: String, timeout: Duration },

    #[error("unparsable output list: {0}")]
    Parse(String),

    #[error("compositor reported no enabled outputs")]
    NoEnabledOutputs,
}

impl QueryError {
    pub fn stage(&self) -> Stage {
        Stage::Resolve
    }

    pub fn self_resolving(&self) -> bool {
        matches!(self, QueryError::TimedOut { .. } | QueryError::NoEnabledOutputs)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration value for '{key}': {reason}")]
    Invalid { key: String, reason: String },
}

impl ConfigError {
    pub fn stage(&self) -> Stage {
        Stage::Config
    }
}

pub(crate) fn exit_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "a signal".to_string(),
    }
}

/// Keeps the tail of a command's stderr, which is where tools put the reason.
pub(crate) fn stderr_excerpt(raw: &[u8]) -> String {
    const LIMIT: usize = 512;

    let text = String::from_utf8_lossy(raw);
    let text = text.trim();
    if text.len() <= LIMIT {
        return text.to_string();
    }

    let mut start = text.len() - LIMIT;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}
