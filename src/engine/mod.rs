//! The pipeline runtime: metadata, nodes, forks, job managers and the
//! pipestance scheduling loop.

pub mod fork;
pub mod job;
pub mod metadata;
pub mod node;
pub mod pipestance;

use std::path::PathBuf;
use std::time::Duration;

use miette::Diagnostic;
use thiserror::Error;

use crate::engine::job::{
    ClusterJobManager,
    JobManager,
    JobManagerConfig,
    LocalJobManager,
};
use crate::engine::metadata::MetadataState;
use crate::engine::pipestance::Pipestance;

/// An error encountered while materializing or driving a pipestance.
#[derive(Debug, Error, Diagnostic)]
pub enum RuntimeError {
    /// A filesystem operation failed.
    #[error("io error: {0}")]
    #[diagnostic(code(engine::io))]
    Io(#[from] std::io::Error),

    /// A metadata record failed to (de)serialize.
    #[error("metadata serialization error: {0}")]
    #[diagnostic(code(engine::json))]
    Json(#[from] serde_json::Error),

    /// A required metadata file is absent.
    #[error("missing metadata file {}", file.display())]
    #[diagnostic(code(engine::missing_metadata))]
    MissingMetadata {
        /// The absent file.
        file: PathBuf,
    },

    /// The configured job mode has no entry in the configuration document.
    #[error("unknown job mode '{mode}'")]
    #[diagnostic(code(engine::unknown_job_mode))]
    #[diagnostic(help("add the mode to the jobmodes section of the job manager configuration"))]
    UnknownJobMode {
        /// The unconfigured mode.
        mode: String,
    },

    /// A job could not be handed to its manager.
    #[error("{fq_name}: job submission failed: {message}")]
    #[diagnostic(code(engine::submit_failed))]
    SubmitFailed {
        /// The node whose job failed to submit.
        fq_name: String,
        /// What went wrong.
        message: String,
    },

    /// Another controller holds the pipestance lock.
    #[error("pipestance '{psid}' is locked by another controller at {}", path.display())]
    #[diagnostic(code(engine::pipestance_locked))]
    #[diagnostic(help("if no controller is running, delete the _lock file and retry"))]
    PipestanceLocked {
        /// The contested instance.
        psid: String,
        /// Its directory.
        path: PathBuf,
    },

    /// Reattaching under a different job mode than the pipestance was
    /// created with.
    #[error(
        "pipestance '{psid}' was created with job mode '{persisted}' but '{requested}' was requested"
    )]
    #[diagnostic(code(engine::job_mode_mismatch))]
    JobModeMismatch {
        /// The instance being reattached.
        psid: String,
        /// The persisted mode.
        persisted: String,
        /// The requested mode.
        requested: String,
    },

    /// The pipestance directory is out of disk space.
    #[error(
        "out of disk space on {}: {available_mb} MB available, {required_mb} MB required",
        path.display()
    )]
    #[diagnostic(code(engine::disk_space))]
    DiskSpace {
        /// The filesystem that ran out.
        path: PathBuf,
        /// Space left, in MB.
        available_mb: u64,
        /// The enforced floor, in MB.
        required_mb: u64,
    },

    /// A mutating operation was attempted without holding the lock.
    #[error("pipestance is in read only mode")]
    #[diagnostic(code(engine::read_only))]
    ReadOnly,

    /// Pipestance construction failed.
    #[error("pipestance construction failed: {message}")]
    #[diagnostic(code(engine::construction))]
    Construction {
        /// What could not be built.
        message: String,
    },

    /// Execution was interrupted by a signal.
    #[error("execution interrupted by signal")]
    #[diagnostic(code(engine::interrupted))]
    Interrupted,

    /// Unhandled internal error.
    #[error("INTERNAL ERROR - this is a bug, please report it.\n{0}")]
    #[diagnostic(code(engine::internal_error))]
    InternalError(String),
}

impl RuntimeError {
    /// Create a `RuntimeError::InternalError`, but panic in debug mode instead
    pub(crate) fn internal(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        debug_assert!(false, "{msg}");
        Self::InternalError(msg)
    }
}

/// Configuration for one controlling process.
pub struct RuntimeConfig {
    /// `local` or a cluster mode from the job-manager configuration.
    pub job_mode: String,
    /// Extra search paths for includes and stage code.
    pub mro_paths: Vec<PathBuf>,
    /// Cap on local threads.
    pub max_cores: Option<usize>,
    /// Cap on local memory, in GB.
    pub max_mem_gb: Option<usize>,
    /// Override for the job-manager configuration document.
    pub jobmanager_config: Option<PathBuf>,
    /// Cluster submission-script template.
    pub submit_template: Option<PathBuf>,
    /// Handler invoked when the pipestance reaches a terminal state.
    pub on_finish: Option<String>,
    /// How long the loop idles when no node made progress.
    pub idle_wait: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            job_mode: "local".to_owned(),
            mro_paths: Vec::new(),
            max_cores: None,
            max_mem_gb: None,
            jobmanager_config: None,
            submit_template: None,
            on_finish: None,
            idle_wait: Duration::from_millis(200),
        }
    }
}

/// The explicit runtime context: configuration plus the job managers.
///
/// Everything that would otherwise be process-global lives here and is
/// passed to the components that need it.
pub struct RuntimeContext {
    /// The configuration this controller was started with.
    pub config: RuntimeConfig,
    /// Local subprocess execution; always available.
    pub local_jm: Box<dyn JobManager>,
    /// Cluster submission, when the job mode names one.
    pub cluster_jm: Option<Box<dyn JobManager>>,
}

impl RuntimeContext {
    /// Build a context for `config`, instantiating the job managers.
    pub fn new(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        let jm_config = match &config.jobmanager_config {
            Some(path) => JobManagerConfig::load(path)?,
            None => JobManagerConfig::builtin()?,
        };
        let local_jm = LocalJobManager::new(
            jm_config.settings.clone(),
            config.max_cores,
            config.max_mem_gb,
        );
        let cluster_jm: Option<Box<dyn JobManager>> = if config.job_mode == "local" {
            None
        } else {
            let template = match &config.submit_template {
                Some(path) => std::fs::read_to_string(path)?,
                None => default_submit_template().to_owned(),
            };
            Some(Box::new(ClusterJobManager::new(
                &jm_config,
                &config.job_mode,
                template,
            )?))
        };
        Ok(Self {
            config,
            local_jm: Box::new(local_jm),
            cluster_jm,
        })
    }
}

/// The submission script used when no site template is configured.
fn default_submit_template() -> &'static str {
    "#!/usr/bin/env bash\n\
     #__MRO_JOB_NAME__ threads=__MRO_THREADS__ mem_gb=__MRO_MEM_GB__\n\
     __RESOURCES__\n\
     exec __MRO_CMD__ > __MRO_STDOUT__ 2> __MRO_STDERR__\n"
}

/// Drive a pipestance until it reaches a terminal state.
///
/// The loop is cooperative and single-threaded: each iteration steps the
/// frontier, checks liveness, and idles briefly when nothing moved.
pub async fn drive(
    pipestance: &mut Pipestance,
    rt: &mut RuntimeContext,
) -> Result<MetadataState, RuntimeError> {
    loop {
        let progress = match pipestance.step_nodes(rt).await {
            Ok(progress) => progress,
            Err(error @ RuntimeError::DiskSpace { .. }) => {
                pipestance.kill_with_message(&error.to_string());
                return Err(error);
            }
            Err(error) => return Err(error),
        };
        let state = pipestance.get_state();
        if state.is_terminal() {
            log::info!("pipestance {}: {}", pipestance.get_psid(), state.as_str());
            return Ok(state);
        }
        pipestance.check_heartbeats(rt);
        if progress {
            // Let spawned job monitors run even on busy iterations.
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(rt.config.idle_wait).await;
        }
    }
}

/// Run a pipestance to completion on a current-thread runtime, handling
/// signals and the onfinish hook.
pub fn run(
    pipestance: &mut Pipestance,
    rt: &mut RuntimeContext,
) -> Result<MetadataState, RuntimeError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|error| RuntimeError::internal(format!("failed to start tokio: {error}")))?;

    let result = runtime.block_on(async {
        tokio::select!(
            result = drive(pipestance, rt) => result,
            _ = tokio::signal::ctrl_c() => {
                log::warn!("execution interrupted by user");
                Err(RuntimeError::Interrupted)
            }
        )
    });

    match &result {
        Ok(state) => {
            let state = *state;
            if state == MetadataState::Complete {
                if let Err(error) = pipestance.post_process() {
                    log::error!("post-processing failed: {error}");
                }
            }
            run_on_finish(pipestance, rt, state);
        }
        Err(RuntimeError::Interrupted) => {
            // In-flight critical sections are synchronous, so reaching this
            // point means the archive is not half-written; release the lock
            // and go.
            debug_assert!(!pipestance.in_critical_section());
        }
        Err(_) => {}
    }
    pipestance.unlock();
    result
}

/// Invoke the configured onfinish handler with the pipestance path, the
/// terminal state, the pipestance id, and (when failed) the first error
/// file's relative path.
fn run_on_finish(pipestance: &Pipestance, rt: &RuntimeContext, state: MetadataState) {
    let Some(handler) = &rt.config.on_finish else {
        return;
    };
    log::info!("running onfinish handler {handler}");
    let mut command = std::process::Command::new(handler);
    command
        .arg(pipestance.get_path())
        .arg(state.as_str())
        .arg(pipestance.get_psid());
    if state == MetadataState::Failed
        && let Some(error) = pipestance.get_fatal_error()
        && let Some(first) = error.paths.first()
    {
        let relative = std::path::Path::new(first)
            .strip_prefix(pipestance.get_path())
            .map_or_else(|_| first.clone(), |path| path.display().to_string());
        command.arg(relative);
    }
    match command.status() {
        Ok(status) if status.success() => {}
        Ok(status) => log::warn!("onfinish handler exited with {status}"),
        Err(error) => log::warn!("could not run onfinish handler: {error}"),
    }
}
