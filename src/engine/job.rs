//! The job manager abstraction: local subprocess execution and cluster
//! submission behind one contract.
//!
//! The scheduler reserves resources, submits jobs, and probes liveness only
//! through [`JobManager`]; tests drive the whole engine with a stub
//! implementation. The local manager owns the thread/memory budget of the
//! controlling host; cluster managers instantiate a submission-script
//! template and hand the job to the site scheduler.

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use crate::engine::RuntimeError;
use crate::engine::metadata::{Metadata, MetadataFile, timestamp};
use crate::mro::ast::ResourceHints;

/// The resources reserved for one job.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, Deserialize)]
pub struct JobResources {
    /// Threads the job may use.
    pub threads: usize,
    /// Memory the job may use, in GB.
    pub mem_gb: usize,
    /// Scheduler-special tag passed through to cluster templates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub special: Option<String>,
}

/// A fully resolved request to run one job.
#[derive(Debug, Clone)]
pub struct JobRequest {
    /// The owning node/fork/chunk's fully-qualified name.
    pub fq_name: String,
    /// Program and arguments.
    pub command: Vec<String>,
    /// Extra environment entries, applied over the inherited environment.
    pub env: Vec<(String, String)>,
    /// The reserved resources.
    pub resources: JobResources,
}

/// `settings` section of the job-manager configuration document.
#[derive(Debug, Clone, Deserialize)]
pub struct JobManagerSettings {
    /// Default threads per job when a stage declares none.
    #[serde(default = "default_threads")]
    pub threads_per_job: usize,
    /// Default memory per job in GB when a stage declares none.
    #[serde(default = "default_mem_gb")]
    pub memgb_per_job: usize,
    /// Environment variables set to the job's thread count.
    #[serde(default = "default_thread_envs")]
    pub thread_envs: Vec<String>,
}

fn default_threads() -> usize {
    1
}

fn default_mem_gb() -> usize {
    4
}

fn default_thread_envs() -> Vec<String> {
    [
        "GOMAXPROCS",
        "MKL_NUM_THREADS",
        "NUMEXPR_NUM_THREADS",
        "OMP_NUM_THREADS",
    ]
    .into_iter()
    .map(str::to_owned)
    .collect()
}

impl Default for JobManagerSettings {
    fn default() -> Self {
        Self {
            threads_per_job: default_threads(),
            memgb_per_job: default_mem_gb(),
            thread_envs: default_thread_envs(),
        }
    }
}

/// One entry of the `jobmodes` section.
#[derive(Debug, Clone, Deserialize)]
pub struct JobModeConfig {
    /// The submit command.
    pub cmd: String,
    /// Arguments always passed to the submit command.
    #[serde(default)]
    pub args: Vec<String>,
    /// Bulk queue-inspection command, if the scheduler has one.
    #[serde(default)]
    pub queue_query: Option<String>,
    /// How long after submission a job may be missing from the queue
    /// without being declared dead.
    #[serde(default)]
    pub queue_query_grace_secs: u64,
    /// Per-job resource line template; `__MRO_SPECIAL__` is substituted.
    #[serde(default)]
    pub resopt: Option<String>,
    /// Environment variables the mode requires to be set.
    #[serde(default)]
    pub envs: Vec<String>,
}

/// The job-manager configuration document.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct JobManagerConfig {
    /// Global defaults.
    #[serde(default)]
    pub settings: JobManagerSettings,
    /// Cluster mode name to configuration.
    #[serde(default)]
    pub jobmodes: HashMap<String, JobModeConfig>,
}

/// The configuration compiled into the binary; a user-provided document
/// replaces it wholesale.
const DEFAULT_CONFIG: &str = r##"{
    "settings": {
        "threads_per_job": 1,
        "memgb_per_job": 4,
        "thread_envs": [
            "GOMAXPROCS",
            "MKL_NUM_THREADS",
            "NUMEXPR_NUM_THREADS",
            "OMP_NUM_THREADS"
        ]
    },
    "jobmodes": {
        "sge": {
            "cmd": "qsub",
            "queue_query": "qstat -j",
            "queue_query_grace_secs": 60,
            "resopt": "#$ -l __MRO_SPECIAL__",
            "envs": ["SGE_ROOT"]
        },
        "lsf": {
            "cmd": "bsub",
            "queue_query": "bjobs -noheader -o jobid",
            "queue_query_grace_secs": 60,
            "envs": ["LSF_ENVDIR"]
        },
        "slurm": {
            "cmd": "sbatch",
            "queue_query": "squeue -h -o %i -j",
            "queue_query_grace_secs": 120,
            "resopt": "#SBATCH --gres=__MRO_SPECIAL__"
        }
    }
}"##;

impl JobManagerConfig {
    /// The compiled-in configuration.
    pub fn builtin() -> Result<Self, RuntimeError> {
        Ok(serde_json::from_str(DEFAULT_CONFIG)?)
    }

    /// Load a user-provided configuration document.
    pub fn load(path: &std::path::Path) -> Result<Self, RuntimeError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// A cloneable handle for probing a cluster scheduler's queue.
///
/// The probe runs on a background task, decoupled from the manager that
/// configured it, so it carries everything it needs by value.
#[derive(Debug, Clone)]
pub struct QueueQuery {
    /// The inspection command; job ids are appended as arguments.
    pub cmd: String,
    /// Jobs submitted within this window are never declared missing.
    pub grace_secs: u64,
}

impl QueueQuery {
    /// Probe the scheduler for `ids`.
    ///
    /// Returns the subset of ids the scheduler still knows about, plus the
    /// raw output for logging. A probe that fails to run reports every id
    /// as still queued; a broken `qstat` must not fail jobs.
    pub async fn check_queue(&self, ids: &[String]) -> (Vec<String>, String) {
        let words = match shell_words::split(&self.cmd) {
            Ok(words) if !words.is_empty() => words,
            _ => {
                log::warn!("unusable queue query command: {:?}", self.cmd);
                return (ids.to_vec(), String::new());
            }
        };
        let output = Command::new(&words[0])
            .args(&words[1..])
            .args(ids)
            .stdin(Stdio::null())
            .output()
            .await;
        match output {
            Ok(output) => {
                let raw = format!(
                    "{}{}",
                    String::from_utf8_lossy(&output.stdout),
                    String::from_utf8_lossy(&output.stderr)
                );
                let still_queued = ids
                    .iter()
                    .filter(|id| raw.contains(id.as_str()))
                    .cloned()
                    .collect();
                (still_queued, raw)
            }
            Err(error) => {
                log::warn!("queue query failed to launch: {error}");
                (ids.to_vec(), String::new())
            }
        }
    }
}

/// The contract the scheduler drives jobs through.
#[async_trait(?Send)]
pub trait JobManager {
    /// Recompute the available resource budgets.
    fn refresh_resources(&mut self) -> Result<(), RuntimeError>;

    /// Global defaults and the thread-environment list.
    fn settings(&self) -> &JobManagerSettings;

    /// Try to reserve `resources`; a refusal leaves the caller Ready until
    /// the next iteration.
    fn reserve(&mut self, resources: &JobResources) -> bool;

    /// Return a reservation made by [`JobManager::reserve`].
    fn release(&mut self, resources: &JobResources);

    /// Whether the backend supports bulk queue inspection.
    fn has_queue_check(&self) -> bool {
        false
    }

    /// The queue-probe handle, for backends that support it.
    fn queue_query(&self) -> Option<QueueQuery> {
        None
    }

    /// Submit a job, recording its id in the node's `JobId` metadata.
    async fn submit(&mut self, request: &JobRequest, metadata: &Metadata)
    -> Result<(), RuntimeError>;

    /// Whether a submitted job can still be found on this host.
    ///
    /// Cluster jobs are not locally observable; their liveness comes from
    /// the queue probe instead, so cluster managers report `true`.
    fn job_alive(&self, job_id: &str) -> bool;

    /// Resolve a stage's hints against the configured defaults.
    fn resolve_resources(&self, hints: Option<&ResourceHints>) -> JobResources {
        let settings = self.settings();
        JobResources {
            threads: hints
                .and_then(|hints| hints.threads)
                .unwrap_or(settings.threads_per_job),
            mem_gb: hints
                .and_then(|hints| hints.mem_gb)
                .unwrap_or(settings.memgb_per_job),
            special: hints.and_then(|hints| hints.special.clone()),
        }
    }
}

/// Environment entries setting every thread-control variable to `threads`.
#[must_use]
pub fn thread_env(settings: &JobManagerSettings, threads: usize) -> Vec<(String, String)> {
    settings
        .thread_envs
        .iter()
        .map(|name| (name.clone(), threads.to_string()))
        .collect()
}

/// Runs jobs as child processes of the controlling host.
pub struct LocalJobManager {
    /// Configured defaults.
    settings: JobManagerSettings,
    /// Thread budget.
    max_threads: usize,
    /// Memory budget in GB.
    max_mem_gb: usize,
    /// Threads currently reserved.
    reserved_threads: usize,
    /// Memory currently reserved, in GB.
    reserved_mem_gb: usize,
    /// User-imposed caps, kept so refresh does not widen past them.
    user_max_threads: Option<usize>,
    /// See `user_max_threads`.
    user_max_mem_gb: Option<usize>,
}

impl LocalJobManager {
    /// Create a manager sized to the host, clamped to the user's caps.
    #[must_use]
    pub fn new(
        settings: JobManagerSettings,
        user_max_threads: Option<usize>,
        user_max_mem_gb: Option<usize>,
    ) -> Self {
        let mut manager = Self {
            settings,
            max_threads: 1,
            max_mem_gb: 1,
            reserved_threads: 0,
            reserved_mem_gb: 0,
            user_max_threads,
            user_max_mem_gb,
        };
        if let Err(error) = manager.refresh_resources() {
            log::warn!("failed to size local job manager: {error}");
        }
        manager
    }

    /// Threads not currently reserved.
    #[must_use]
    pub fn available_threads(&self) -> usize {
        self.max_threads.saturating_sub(self.reserved_threads)
    }

    /// Memory (GB) not currently reserved.
    #[must_use]
    pub fn available_mem_gb(&self) -> usize {
        self.max_mem_gb.saturating_sub(self.reserved_mem_gb)
    }
}

#[async_trait(?Send)]
impl JobManager for LocalJobManager {
    fn refresh_resources(&mut self) -> Result<(), RuntimeError> {
        let host_threads = std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1);
        let host_mem_gb = host_mem_gb().unwrap_or(16);
        self.max_threads = self
            .user_max_threads
            .map_or(host_threads, |cap| cap.min(host_threads));
        self.max_mem_gb = self
            .user_max_mem_gb
            .map_or(host_mem_gb, |cap| cap.min(host_mem_gb));
        log::debug!(
            "local resources: {} threads, {} GB (reserved {}/{})",
            self.max_threads,
            self.max_mem_gb,
            self.reserved_threads,
            self.reserved_mem_gb
        );
        Ok(())
    }

    fn settings(&self) -> &JobManagerSettings {
        &self.settings
    }

    fn reserve(&mut self, resources: &JobResources) -> bool {
        if resources.threads <= self.available_threads()
            && resources.mem_gb <= self.available_mem_gb()
        {
            self.reserved_threads = self.reserved_threads.saturating_add(resources.threads);
            self.reserved_mem_gb = self.reserved_mem_gb.saturating_add(resources.mem_gb);
            true
        } else {
            false
        }
    }

    fn release(&mut self, resources: &JobResources) {
        self.reserved_threads = self.reserved_threads.saturating_sub(resources.threads);
        self.reserved_mem_gb = self.reserved_mem_gb.saturating_sub(resources.mem_gb);
    }

    async fn submit(
        &mut self,
        request: &JobRequest,
        metadata: &Metadata,
    ) -> Result<(), RuntimeError> {
        let Some((program, args)) = request.command.split_first() else {
            return Err(RuntimeError::internal("empty job command"));
        };
        let stdout = std::fs::File::create(metadata.file_path(MetadataFile::Stdout))?;
        let stderr = std::fs::File::create(metadata.file_path(MetadataFile::Stderr))?;
        let mut child = Command::new(program)
            .args(args)
            .envs(request.env.iter().map(|(key, value)| (key, value)))
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|error| RuntimeError::SubmitFailed {
                fq_name: request.fq_name.clone(),
                message: format!("failed to spawn {program}: {error}"),
            })?;

        let pid = child.id().map_or_else(|| "?".to_owned(), |pid| pid.to_string());
        metadata.write_raw(MetadataFile::JobId, &pid)?;
        // A local child is running the moment it spawns.
        metadata.write_raw(
            MetadataFile::Log,
            &format!("{} started local job {pid}\n", timestamp()),
        )?;
        log::info!("{}: spawned local job {pid}", request.fq_name);

        // The monitor owns only paths, never node state: it records the
        // implicit failure when a child dies without leaving a terminal
        // file, and the loop picks the marker up on its next read.
        let complete = metadata.file_path(MetadataFile::Complete);
        let errors = metadata.file_path(MetadataFile::Errors);
        let fq_name = request.fq_name.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            if errors.exists() || complete.exists() {
                return;
            }
            match status {
                Ok(status) if status.success() => {
                    // An exec stage with no adapter: success is the exit
                    // status.
                    if let Err(error) = std::fs::write(&complete, timestamp()) {
                        log::error!("{fq_name}: failed to write completion: {error}");
                    }
                }
                Ok(status) => {
                    let message = format!("{fq_name} exited with {status}");
                    log::warn!("{message}");
                    let _ = std::fs::write(&errors, message);
                }
                Err(error) => {
                    let _ = std::fs::write(&errors, format!("{fq_name} wait failed: {error}"));
                }
            }
        });
        Ok(())
    }

    fn job_alive(&self, job_id: &str) -> bool {
        let Ok(pid) = job_id.trim().parse::<i32>() else {
            return false;
        };
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
    }
}

/// Submits jobs to a site scheduler through a templated script.
pub struct ClusterJobManager {
    /// The mode name, for logging.
    mode: String,
    /// The mode's configuration.
    config: JobModeConfig,
    /// Shared defaults.
    settings: JobManagerSettings,
    /// The submission-script template.
    template: String,
}

impl ClusterJobManager {
    /// Create a manager for `mode` from the configuration document.
    pub fn new(
        config: &JobManagerConfig,
        mode: &str,
        template: String,
    ) -> Result<Self, RuntimeError> {
        let mode_config = config
            .jobmodes
            .get(mode)
            .ok_or_else(|| RuntimeError::UnknownJobMode {
                mode: mode.to_owned(),
            })?
            .clone();
        for env in &mode_config.envs {
            if std::env::var_os(env).is_none() {
                log::warn!("job mode {mode} expects ${env} to be set");
            }
        }
        Ok(Self {
            mode: mode.to_owned(),
            config: mode_config,
            settings: config.settings.clone(),
            template,
        })
    }

    /// Fill the template's placeholder tokens for one job.
    fn instantiate_template(&self, request: &JobRequest, metadata: &Metadata) -> String {
        let resources = match (&self.config.resopt, &request.resources.special) {
            (Some(resopt), Some(special)) => resopt.replace("__MRO_SPECIAL__", special),
            _ => String::new(),
        };
        self.template
            .replace("__MRO_JOB_NAME__", &request.fq_name)
            .replace("__MRO_THREADS__", &request.resources.threads.to_string())
            .replace("__MRO_MEM_GB__", &request.resources.mem_gb.to_string())
            .replace(
                "__MRO_STDOUT__",
                &metadata.file_path(MetadataFile::Stdout).display().to_string(),
            )
            .replace(
                "__MRO_STDERR__",
                &metadata.file_path(MetadataFile::Stderr).display().to_string(),
            )
            .replace("__MRO_CMD__", &shell_words::join(&request.command))
            .replace("__RESOURCES__", &resources)
    }
}

#[async_trait(?Send)]
impl JobManager for ClusterJobManager {
    fn refresh_resources(&mut self) -> Result<(), RuntimeError> {
        // The site scheduler owns the budget; submission is never throttled
        // here.
        Ok(())
    }

    fn settings(&self) -> &JobManagerSettings {
        &self.settings
    }

    fn reserve(&mut self, _resources: &JobResources) -> bool {
        true
    }

    fn release(&mut self, _resources: &JobResources) {}

    fn has_queue_check(&self) -> bool {
        self.config.queue_query.is_some()
    }

    fn queue_query(&self) -> Option<QueueQuery> {
        self.config.queue_query.as_ref().map(|cmd| QueueQuery {
            cmd: cmd.clone(),
            grace_secs: self.config.queue_query_grace_secs,
        })
    }

    async fn submit(
        &mut self,
        request: &JobRequest,
        metadata: &Metadata,
    ) -> Result<(), RuntimeError> {
        let script = self.instantiate_template(request, metadata);
        let script_path = metadata.file_path(MetadataFile::JobScript);
        std::fs::write(&script_path, &script)?;

        let output = Command::new(&self.config.cmd)
            .args(&self.config.args)
            .arg(&script_path)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|error| RuntimeError::SubmitFailed {
                fq_name: request.fq_name.clone(),
                message: format!("failed to run {}: {error}", self.config.cmd),
            })?;
        if !output.status.success() {
            return Err(RuntimeError::SubmitFailed {
                fq_name: request.fq_name.clone(),
                message: format!(
                    "{} rejected the job: {}",
                    self.config.cmd,
                    String::from_utf8_lossy(&output.stderr)
                ),
            });
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let job_id = parse_job_id(&stdout).unwrap_or_else(|| stdout.trim().to_owned());
        metadata.write_raw(MetadataFile::JobId, &job_id)?;
        log::info!("{}: submitted {} job {job_id}", request.fq_name, self.mode);
        Ok(())
    }

    fn job_alive(&self, _job_id: &str) -> bool {
        true
    }
}

/// Pull the scheduler's job id out of its submission banner.
///
/// Handles the common shapes: `Your job 12345 ("name") has been submitted`
/// and `Submitted batch job 12345`.
#[must_use]
fn parse_job_id(banner: &str) -> Option<String> {
    banner
        .split_whitespace()
        .find(|token| !token.is_empty() && token.bytes().all(|byte| byte.is_ascii_digit()))
        .map(str::to_owned)
}

/// Total host memory in GB, from `/proc/meminfo`.
fn host_mem_gb() -> Option<usize> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let kb: usize = meminfo
        .lines()
        .find(|line| line.starts_with("MemTotal:"))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()?;
    Some((kb / 1024 / 1024).max(1))
}

#[cfg(test)]
#[expect(clippy::expect_used, reason = "tests")]
mod tests {
    use super::*;

    #[test]
    fn builtin_config_parses() {
        let config = JobManagerConfig::builtin().expect("builtin config");
        assert_eq!(config.settings.threads_per_job, 1);
        assert!(config.jobmodes.contains_key("sge"));
        assert!(config.jobmodes.contains_key("slurm"));
        let slurm = &config.jobmodes["slurm"];
        assert_eq!(slurm.cmd, "sbatch");
        assert!(slurm.queue_query.is_some());
    }

    #[test]
    fn local_reservations_are_bookkept() {
        let mut manager = LocalJobManager::new(JobManagerSettings::default(), Some(4), Some(8));
        let job = JobResources {
            threads: 3,
            mem_gb: 6,
            special: None,
        };
        assert!(manager.reserve(&job));
        assert_eq!(manager.available_threads(), 1);
        assert_eq!(manager.available_mem_gb(), 2);
        // A second identical job does not fit; the caller stays Ready.
        assert!(!manager.reserve(&job));
        manager.release(&job);
        assert!(manager.reserve(&job));
    }

    #[test]
    fn refresh_respects_user_caps() {
        let mut manager = LocalJobManager::new(JobManagerSettings::default(), Some(1), Some(1));
        manager.refresh_resources().expect("refresh");
        assert_eq!(manager.available_threads(), 1);
        assert_eq!(manager.available_mem_gb(), 1);
    }

    #[test]
    fn resolve_resources_applies_defaults() {
        let manager = LocalJobManager::new(JobManagerSettings::default(), None, None);
        let defaulted = manager.resolve_resources(None);
        assert_eq!(defaulted.threads, 1);
        assert_eq!(defaulted.mem_gb, 4);
        let hinted = manager.resolve_resources(Some(&ResourceHints {
            threads: Some(8),
            mem_gb: None,
            special: Some("gpu".to_owned()),
            strict_volatile: false,
        }));
        assert_eq!(hinted.threads, 8);
        assert_eq!(hinted.mem_gb, 4);
        assert_eq!(hinted.special.as_deref(), Some("gpu"));
    }

    #[test]
    fn thread_env_sets_every_variable() {
        let env = thread_env(&JobManagerSettings::default(), 6);
        assert_eq!(env.len(), 4);
        assert!(env.iter().all(|(_, value)| value == "6"));
        assert!(env.iter().any(|(name, _)| name == "OMP_NUM_THREADS"));
    }

    #[test]
    fn templates_substitute_every_token() {
        let config = JobManagerConfig::builtin().expect("config");
        let manager = ClusterJobManager::new(
            &config,
            "sge",
            "#$ -N __MRO_JOB_NAME__\n#$ -pe threads __MRO_THREADS__\n\
             #$ -o __MRO_STDOUT__\n#$ -e __MRO_STDERR__\n__RESOURCES__\n__MRO_CMD__\n"
                .to_owned(),
        )
        .expect("sge mode");
        let dir = tempfile::tempdir().expect("tempdir");
        let metadata = Metadata::new("ID.ps.node", dir.path().to_owned());
        let request = JobRequest {
            fq_name: "ID.ps.node.fork0".to_owned(),
            command: vec!["bin/stage".to_owned(), "main".to_owned()],
            env: Vec::new(),
            resources: JobResources {
                threads: 2,
                mem_gb: 4,
                special: Some("gpu=1".to_owned()),
            },
        };
        let script = manager.instantiate_template(&request, &metadata);
        assert!(script.contains("#$ -N ID.ps.node.fork0"));
        assert!(script.contains("#$ -pe threads 2"));
        assert!(script.contains("#$ -l gpu=1"));
        assert!(script.contains("bin/stage main"));
        assert!(!script.contains("__MRO_"));
        assert!(!script.contains("__RESOURCES__"));
    }

    #[test]
    fn job_ids_parse_from_scheduler_banners() {
        assert_eq!(
            parse_job_id("Your job 12345 (\"x\") has been submitted").as_deref(),
            Some("12345")
        );
        assert_eq!(
            parse_job_id("Submitted batch job 987\n").as_deref(),
            Some("987")
        );
        assert_eq!(parse_job_id("no id here"), None);
    }

    #[test]
    fn unknown_job_mode_is_an_error() {
        let config = JobManagerConfig::builtin().expect("config");
        let result = ClusterJobManager::new(&config, "nonesuch", String::new());
        assert!(matches!(
            result,
            Err(RuntimeError::UnknownJobMode { .. })
        ));
    }
}
