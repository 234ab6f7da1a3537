pub mod config;
pub mod daemon;
pub mod detector;
pub mod error;
pub mod executor;
pub mod monitor;
pub mod session;
pub mod watcher;

pub use config::Config;
pub use daemon::{CycleReport, Daemon};
pub use detector::{AppliedState, ResolvedChange};
pub use executor::{ExecutionResult, Executor, Outcome};
pub use monitor::{MonitorResolver, OutputDescriptor};
pub use session::WallpaperState;
pub use watcher::FileWatcher;
