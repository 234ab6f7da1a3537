//! Event loop tying the watcher, parser, resolver, detector and executor
//! together.

use crate::config::Config;
use crate::detector::{self, AppliedState, Diff, DiffOptions};
use crate::error::{ParseError, WatchError};
use crate::executor::{ExecutionResult, Executor};
use crate::monitor::{MonitorResolver, OutputSource};
use crate::session;
use crate::watcher::{Debouncer, FileWatcher, Signal};
use std::future::Future;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Anything that yields debounced change signals.
pub trait SignalSource {
    /// `None` once the source is exhausted.
    fn next_signal(&mut self) -> impl Future<Output = Option<Result<Signal, WatchError>>>;
}

impl SignalSource for Debouncer {
    fn next_signal(&mut self) -> impl Future<Output = Option<Result<Signal, WatchError>>> {
        self.next()
    }
}

impl SignalSource for FileWatcher {
    fn next_signal(&mut self) -> impl Future<Output = Option<Result<Signal, WatchError>>> {
        self.next()
    }
}

/// What a single cycle ended with.
#[derive(Debug)]
pub enum CycleReport {
    /// The session could not be read; the applied state is untouched.
    ParseFailed(ParseError),
    NoChange,
    Applied {
        source: OutputSource,
        result: ExecutionResult,
    },
}

impl CycleReport {
    pub fn is_success(&self) -> bool {
        match self {
            CycleReport::ParseFailed(_) => false,
            CycleReport::NoChange => true,
            CycleReport::Applied { result, .. } => result.is_success(),
        }
    }
}

pub struct Daemon {
    session_file: PathBuf,
    settings_file: PathBuf,
    default_scheme: String,
    options: DiffOptions,
    resolver: MonitorResolver,
    executor: Executor,
    applied: AppliedState,
    cycles: u64,
}

impl Daemon {
    pub fn new(config: &Config) -> Self {
        Self::with_resolver(config, MonitorResolver::from_config(config))
    }

    pub fn with_resolver(config: &Config, resolver: MonitorResolver) -> Self {
        Self {
            session_file: config.dms.session_file.clone(),
            settings_file: config.dms.settings_file.clone(),
            default_scheme: config.dms.default_scheme.clone(),
            options: DiffOptions {
                theme_follows_wallpaper: config.theme.on_wallpaper_change,
            },
            resolver,
            executor: Executor::new(config),
            applied: AppliedState::empty(&config.dms.default_scheme),
            cycles: 0,
        }
    }

    /// Cycles run so far.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn applied(&self) -> &AppliedState {
        &self.applied
    }

    /// Read, resolve, diff, execute. Never fails; every problem is logged
    /// and reported.
    pub async fn run_cycle(&mut self) -> CycleReport {
        self.cycles += 1;
        debug!("Cycle {} started", self.cycles);

        let state = match session::read_state(&self.session_file) {
            Ok(state) => state,
            Err(e) => {
                if e.self_resolving() {
                    warn!(stage = %e.stage(), self_resolving = true, "Session not usable yet: {}", e);
                } else {
                    error!(stage = %e.stage(), self_resolving = false, "Cannot parse session: {}", e);
                }
                return CycleReport::ParseFailed(e);
            }
        };
        if state.is_empty() {
            info!("Session holds no wallpaper image (solid colour), nothing to set");
        }

        let resolution = self.resolver.resolve().await;
        let scheme = session::resolve_scheme(&self.settings_file, &self.default_scheme);

        match detector::diff(&self.applied, &state, &resolution.outputs, &scheme, self.options) {
            Diff::NoChange => {
                debug!("Nothing changed since the last applied state");
                CycleReport::NoChange
            }
            Diff::Changed { change, next } => {
                info!(
                    "Applying: {} output(s) changed, {} removed, theme {}",
                    change.per_output_wallpaper.len(),
                    change.removed_outputs.len(),
                    if change.theme_changed { "changed" } else { "unchanged" }
                );
                for output in &change.removed_outputs {
                    debug!("Output {} no longer has a wallpaper assignment", output);
                }

                let result = self.executor.apply(&change).await;
                // Commit even on partial failure so a broken command does not
                // retry on every unrelated write.
                self.applied = next;

                CycleReport::Applied {
                    source: resolution.source,
                    result,
                }
            }
        }
    }

    /// A single cycle without watching, for `--once`.
    pub async fn run_once(&mut self) -> CycleReport {
        let report = self.run_cycle().await;
        match &report {
            CycleReport::ParseFailed(_) => warn!("Single run could not read the session"),
            CycleReport::NoChange => info!("Single run: nothing to apply"),
            CycleReport::Applied { result, .. } if result.is_success() => info!("Single run applied"),
            CycleReport::Applied { result, .. } => {
                warn!("Single run applied with {} failure(s)", result.failures())
            }
        }
        report
    }

    /// Runs cycles until the signal source ends, shutdown is requested, or
    /// the source fails. Signals arriving mid-cycle collapse into one
    /// follow-up cycle. An in-flight cycle always completes.
    pub async fn run<S: SignalSource>(
        &mut self,
        signals: &mut S,
        shutdown: CancellationToken,
    ) -> Result<(), WatchError> {
        let mut source_open = true;
        let mut fatal: Option<WatchError> = None;

        while source_open && !shutdown.is_cancelled() {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = signals.next_signal() => next,
            };

            match next {
                None => {
                    info!("Change notifications ended");
                    break;
                }
                Some(Err(e)) => {
                    error!(stage = %e.stage(), "Watching failed: {}", e);
                    return Err(e);
                }
                Some(Ok(signal)) => {
                    debug!("Change signal ({} raw events)", signal.events);
                }
            }

            let mut pending = true;
            while pending {
                pending = false;

                let cycle = self.run_cycle();
                tokio::pin!(cycle);
                let mut draining = false;

                loop {
                    tokio::select! {
                        biased;
                        next = signals.next_signal(), if source_open && fatal.is_none() => match next {
                            Some(Ok(_)) => pending = true,
                            Some(Err(e)) => fatal = Some(e),
                            None => source_open = false,
                        },
                        _ = shutdown.cancelled(), if !draining => {
                            info!("Shutdown requested, finishing the current cycle");
                            draining = true;
                        }
                        report = &mut cycle => {
                            if !report.is_success() {
                                debug!("Cycle ended with problems: {:?}", report);
                            }
                            break;
                        }
                    }
                }

                if fatal.is_some() || shutdown.is_cancelled() {
                    break;
                }
                if pending {
                    debug!("Changes arrived during the cycle, running again");
                }
            }

            if let Some(e) = fatal.take() {
                error!(stage = %e.stage(), "Watching failed: {}", e);
                return Err(e);
            }
        }

        info!("Stopped after {} cycle(s)", self.cycles);
        Ok(())
    }
}

/// Watches the session file, runs an initial cycle, then reacts to changes
/// until `shutdown` fires.
pub async fn serve(config: &Config, shutdown: CancellationToken) -> Result<(), WatchError> {
    // Subscribe first so writes during the initial cycle are not missed.
    let mut watcher = FileWatcher::spawn(&config.dms.session_file, config.debounce())?;
    let mut daemon = Daemon::new(config);

    let report = daemon.run_cycle().await;
    debug!("Initial cycle: {:?}", report);

    let result = daemon.run(&mut watcher, shutdown).await;
    watcher.shutdown();
    result
}
