//! Forks and chunks: the parametric instances of a stage.
//!
//! A fork is one assignment of a stage's sweep parameters. A plain stage
//! runs one job per fork; a split stage runs a split job that emits chunk
//! definitions, one job per chunk, and a join job that merges the chunk
//! outputs into the fork's outputs.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::engine::RuntimeError;
use crate::engine::job::{JobManager, JobRequest, JobResources, thread_env};
use crate::engine::metadata::{Metadata, MetadataFile, MetadataState};

/// One chunk's definition, as emitted by a split.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkDef {
    /// Chunk-specific arguments, merged over the fork's arguments.
    #[serde(default)]
    pub args: serde_json::Value,
    /// A chunk-specific resource request, overriding the stage's.
    #[serde(default)]
    pub resources: Option<JobResources>,
}

/// One parallel unit inside a split stage's fork.
pub struct Chunk {
    /// Position in the split's chunk list.
    pub index: usize,
    /// The chunk's metadata directory.
    pub metadata: Metadata,
    /// The chunk's definition.
    pub def: ChunkDef,
}

/// The sub-jobs a fork can have in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubJob {
    /// The single job of a non-split stage.
    Main,
    /// The split phase.
    Split,
    /// One chunk, by index.
    Chunk(usize),
    /// The join phase.
    Join,
}

/// Everything a fork needs to issue one step's worth of jobs.
pub struct ForkStepSpec<'a> {
    /// The owning node's fully-qualified name.
    pub fq_name: &'a str,
    /// Program plus fixed arguments for the stage's code.
    pub stagecode: &'a [String],
    /// The stage-level resolved resource request.
    pub resources: JobResources,
    /// Whether the stage splits into chunks.
    pub split: bool,
    /// The fork's resolved argument record.
    pub args: serde_json::Value,
    /// Thread-control environment variables for the stage-level request.
    pub thread_envs: &'a [(String, String)],
    /// The pipestance tmp directory advertised to jobs.
    pub tmp_path: &'a Path,
}

/// One parametric instantiation of a stage.
pub struct Fork {
    /// The fork index; also names the on-disk directory.
    pub index: usize,
    /// The fork directory.
    pub path: PathBuf,
    /// Fork-level metadata; for plain stages this is also the job metadata.
    pub metadata: Metadata,
    /// Metadata of the split phase.
    pub split_metadata: Metadata,
    /// Metadata of the join phase.
    pub join_metadata: Metadata,
    /// Chunks, created once the split completes. Empty until then.
    pub chunks: Vec<Chunk>,
    /// The chosen index into each sweep dimension, in binding order.
    pub sweep_choice: SmallVec<[usize; 2]>,
    /// The journal directory chunk metadata inherits.
    journal_path: PathBuf,
    /// Reservations for submitted, not-yet-terminal sub-jobs.
    in_flight: Vec<(SubJob, JobResources)>,
}

impl Fork {
    /// Create the fork at `node_path/fork{index}`.
    #[must_use]
    pub fn new(
        node_fq_name: &str,
        node_path: &Path,
        index: usize,
        sweep_choice: SmallVec<[usize; 2]>,
        journal_path: &Path,
    ) -> Self {
        let path = node_path.join(format!("fork{index}"));
        let fq = format!("{node_fq_name}.fork{index}");
        Self {
            index,
            metadata: Metadata::new(fq.clone(), path.clone())
                .with_journal(journal_path.to_owned()),
            split_metadata: Metadata::new(format!("{fq}.split"), path.join("split"))
                .with_journal(journal_path.to_owned()),
            join_metadata: Metadata::new(format!("{fq}.join"), path.join("join"))
                .with_journal(journal_path.to_owned()),
            chunks: Vec::new(),
            sweep_choice,
            path,
            journal_path: journal_path.to_owned(),
            in_flight: Vec::new(),
        }
    }

    /// Create the directories for the fork and its fixed sub-phases.
    pub fn make_dirs(&self, split: bool) -> Result<(), RuntimeError> {
        self.metadata.make_dirs()?;
        if split {
            self.split_metadata.make_dirs()?;
            self.join_metadata.make_dirs()?;
        }
        Ok(())
    }

    /// Every metadata handle the fork currently owns.
    pub fn metadatas(&self) -> impl Iterator<Item = &Metadata> {
        std::iter::once(&self.metadata)
            .chain(std::iter::once(&self.split_metadata))
            .chain(std::iter::once(&self.join_metadata))
            .chain(self.chunks.iter().map(|chunk| &chunk.metadata))
    }

    /// Whether any sub-phase has failed.
    #[must_use]
    pub fn failed(&self) -> bool {
        self.metadatas()
            .any(|metadata| metadata.get_state() == Some(MetadataState::Failed))
    }

    /// Derive the fork's state from its sub-phases.
    #[must_use]
    pub fn get_state(&self, split: bool) -> Option<MetadataState> {
        if self.failed() {
            return Some(MetadataState::Failed);
        }
        if self.metadata.get_state() == Some(MetadataState::Complete) {
            return Some(MetadataState::Complete);
        }
        if !split {
            return self.metadata.get_state();
        }
        // Split stages are "running" from the first submitted sub-phase
        // until the join's results are folded into the fork.
        let busy = self
            .metadatas()
            .any(|metadata| metadata.get_state().is_some());
        busy.then_some(MetadataState::Running)
    }

    /// Advance the fork: issue whatever sub-job is due, observe terminal
    /// sub-phases, and fold completed results into the fork metadata.
    ///
    /// Returns whether anything changed.
    pub async fn step(
        &mut self,
        spec: &ForkStepSpec<'_>,
        jm: &mut dyn JobManager,
    ) -> Result<bool, RuntimeError> {
        let mut progress = self.reap_in_flight(jm);
        if self.failed() || self.metadata.get_state() == Some(MetadataState::Complete) {
            return Ok(progress);
        }
        if spec.split {
            progress = self.step_split_stage(spec, jm).await? || progress;
        } else if self.metadata.get_state().is_none() {
            progress = self
                .submit_sub_job(SubJob::Main, spec, jm, spec.args.clone(), None)
                .await?
                || progress;
        }
        Ok(progress)
    }

    /// Drive the split -> chunks -> join sequence, in strict order.
    async fn step_split_stage(
        &mut self,
        spec: &ForkStepSpec<'_>,
        jm: &mut dyn JobManager,
    ) -> Result<bool, RuntimeError> {
        match self.split_metadata.get_state() {
            None => {
                return self
                    .submit_sub_job(SubJob::Split, spec, jm, spec.args.clone(), None)
                    .await;
            }
            Some(MetadataState::Complete) => {}
            _ => return Ok(false),
        }

        let mut progress = false;
        if self.chunks.is_empty() {
            if let Err(error) = self.load_chunks(spec.fq_name) {
                // A split that completed without usable chunk definitions
                // fails the fork like any other sub-phase failure.
                log::error!("{}.fork{}: {error}", spec.fq_name, self.index);
                self.split_metadata
                    .write_raw(MetadataFile::Errors, &error.to_string())?;
                return Ok(true);
            }
            progress = true;
        }

        let mut all_complete = true;
        for index in 0..self.chunks.len() {
            match self.chunks[index].metadata.get_state() {
                Some(MetadataState::Complete) => {}
                Some(_) => all_complete = false,
                None => {
                    all_complete = false;
                    let def = self.chunks[index].def.clone();
                    let mut args = spec.args.clone();
                    merge_args(&mut args, &def.args);
                    progress = self
                        .submit_sub_job(SubJob::Chunk(index), spec, jm, args, def.resources)
                        .await?
                        || progress;
                }
            }
        }
        if !all_complete {
            return Ok(progress);
        }

        match self.join_metadata.get_state() {
            None => {
                // Hand the join every chunk's outputs alongside the fork
                // arguments.
                let chunk_outs: Vec<serde_json::Value> = self
                    .chunks
                    .iter()
                    .map(|chunk| read_outs(&chunk.metadata))
                    .collect();
                self.join_metadata
                    .write_json(MetadataFile::ChunkOuts, &chunk_outs)?;
                self.submit_sub_job(SubJob::Join, spec, jm, spec.args.clone(), None)
                    .await
            }
            Some(MetadataState::Complete) => {
                let outs = read_outs(&self.join_metadata);
                self.metadata.write_json(MetadataFile::Outs, &outs)?;
                self.metadata.write_time(MetadataFile::Complete)?;
                Ok(true)
            }
            _ => Ok(progress),
        }
    }

    /// Materialize chunks from the split's chunk definitions.
    ///
    /// Also used on reattach, when a completed split's chunks must be
    /// rediscovered from disk.
    pub fn load_chunks(&mut self, node_fq_name: &str) -> Result<(), RuntimeError> {
        let defs: Vec<ChunkDef> = self.split_metadata.read_json(MetadataFile::ChunkDefs)?;
        self.chunks = defs
            .into_iter()
            .enumerate()
            .map(|(index, def)| {
                let metadata = Metadata::new(
                    format!("{node_fq_name}.fork{}.chnk{index}", self.index),
                    self.path.join(format!("chnk{index}")),
                )
                .with_journal(self.journal_path.clone());
                metadata.make_dirs()?;
                Ok(Chunk {
                    index,
                    metadata,
                    def,
                })
            })
            .collect::<Result<_, RuntimeError>>()?;
        log::info!(
            "{node_fq_name}.fork{}: split produced {} chunks",
            self.index,
            self.chunks.len()
        );
        Ok(())
    }

    /// Submit one sub-job if its resources can be reserved right now.
    async fn submit_sub_job(
        &mut self,
        which: SubJob,
        spec: &ForkStepSpec<'_>,
        jm: &mut dyn JobManager,
        args: serde_json::Value,
        resources_override: Option<JobResources>,
    ) -> Result<bool, RuntimeError> {
        let resources = resources_override.unwrap_or_else(|| spec.resources.clone());
        if !jm.reserve(&resources) {
            // Out of budget: stay put and retry next iteration.
            return Ok(false);
        }

        let (metadata, phase) = match which {
            SubJob::Main => (&self.metadata, "main"),
            SubJob::Split => (&self.split_metadata, "split"),
            SubJob::Chunk(index) => (&self.chunks[index].metadata, "main"),
            SubJob::Join => (&self.join_metadata, "join"),
        };
        metadata.make_dirs()?;
        metadata.write_json(MetadataFile::Args, &args)?;

        let mut command: Vec<String> = spec.stagecode.to_vec();
        command.push(phase.to_owned());
        command.push(metadata.path().display().to_string());

        let mut env: Vec<(String, String)> = if resources.threads == spec.resources.threads {
            spec.thread_envs.to_vec()
        } else {
            thread_env(jm.settings(), resources.threads)
        };
        env.push(("TMPDIR".to_owned(), spec.tmp_path.display().to_string()));

        let request = JobRequest {
            fq_name: metadata.fq_name().to_owned(),
            command,
            env,
            resources: resources.clone(),
        };
        match jm.submit(&request, metadata).await {
            Ok(()) => {
                self.in_flight.push((which, resources));
                Ok(true)
            }
            Err(error) => {
                jm.release(&resources);
                // A submission failure is a job failure, not a scheduler
                // failure: record it and let the loop observe it.
                log::error!("{}: {error}", metadata.fq_name());
                metadata.write_raw(MetadataFile::Errors, &error.to_string())?;
                Ok(true)
            }
        }
    }

    /// Release every outstanding reservation.
    ///
    /// Called when the owning node reaches a terminal state, where the fork
    /// will no longer be stepped and [`Fork::reap_in_flight`] cannot run.
    pub fn release_in_flight(&mut self, jm: &mut dyn JobManager) {
        for (_, resources) in self.in_flight.drain(..) {
            jm.release(&resources);
        }
    }

    /// Release reservations whose sub-jobs have reached a terminal state.
    fn reap_in_flight(&mut self, jm: &mut dyn JobManager) -> bool {
        let mut progress = false;
        let mut index = 0;
        while index < self.in_flight.len() {
            let (which, _) = &self.in_flight[index];
            let metadata = match which {
                SubJob::Main => &self.metadata,
                SubJob::Split => &self.split_metadata,
                SubJob::Chunk(chunk) => match self.chunks.get(*chunk) {
                    Some(chunk) => &chunk.metadata,
                    None => {
                        index = index.saturating_add(1);
                        continue;
                    }
                },
                SubJob::Join => &self.join_metadata,
            };
            if metadata.get_state().is_some_and(MetadataState::is_terminal) {
                let (_, resources) = self.in_flight.swap_remove(index);
                jm.release(&resources);
                progress = true;
            } else {
                index = index.saturating_add(1);
            }
        }
        progress
    }

    /// Mark every queued or running sub-phase as killed.
    pub fn kill(&self, message: &str) {
        for metadata in self.metadatas() {
            if matches!(
                metadata.get_state(),
                Some(MetadataState::Queued | MetadataState::Running)
            ) {
                let _ = metadata.write_raw(MetadataFile::KillMarker, message);
                let _ = metadata.write_raw(MetadataFile::Errors, message);
            }
        }
    }

    /// Clear all run state so the fork can be scheduled again.
    pub fn reset(&mut self) -> Result<(), RuntimeError> {
        for metadata in self.metadatas() {
            for file in [
                MetadataFile::Errors,
                MetadataFile::Assert,
                MetadataFile::Complete,
                MetadataFile::JobId,
                MetadataFile::Log,
                MetadataFile::Heartbeat,
                MetadataFile::KillMarker,
                MetadataFile::Outs,
                MetadataFile::ChunkOuts,
            ] {
                metadata.remove(file)?;
            }
            metadata.clear_read_cache();
        }
        self.chunks.clear();
        self.in_flight.clear();
        Ok(())
    }

    /// The first error message recorded anywhere in the fork, with the path
    /// of the file it came from.
    #[must_use]
    pub fn error_message(&self) -> Option<(String, std::rc::Rc<str>)> {
        self.metadatas().find_map(|metadata| {
            for file in [MetadataFile::Errors, MetadataFile::Assert] {
                if let Some(message) = metadata.read_raw(file) {
                    return Some((metadata.file_path(file).display().to_string(), message));
                }
            }
            None
        })
    }

    /// Forget cached reads on every owned metadata handle.
    pub fn clear_read_caches(&self) {
        for metadata in self.metadatas() {
            metadata.clear_read_cache();
        }
    }
}

/// Read an `Outs` record, defaulting to an empty object.
#[must_use]
pub fn read_outs(metadata: &Metadata) -> serde_json::Value {
    metadata
        .read_raw(MetadataFile::Outs)
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_else(|| serde_json::Value::Object(serde_json::Map::new()))
}

/// Overlay `extra`'s keys onto the object `base`.
fn merge_args(base: &mut serde_json::Value, extra: &serde_json::Value) {
    if let (serde_json::Value::Object(base), serde_json::Value::Object(extra)) = (base, extra) {
        for (key, value) in extra {
            base.insert(key.clone(), value.clone());
        }
    }
}

#[cfg(test)]
#[expect(clippy::expect_used, reason = "tests")]
mod tests {
    use super::*;

    #[test]
    fn chunk_defs_round_trip_through_json() {
        let defs = vec![
            ChunkDef {
                args: serde_json::json!({"shard": 0}),
                resources: None,
            },
            ChunkDef {
                args: serde_json::json!({"shard": 1}),
                resources: Some(JobResources {
                    threads: 2,
                    mem_gb: 8,
                    special: None,
                }),
            },
        ];
        let text = serde_json::to_string(&defs).expect("serialize");
        let parsed: Vec<ChunkDef> = serde_json::from_str(&text).expect("parse");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1].resources.as_ref().expect("resources").mem_gb, 8);
    }

    #[test]
    fn merge_args_overlays_chunk_keys() {
        let mut base = serde_json::json!({"value": 1, "kept": true});
        merge_args(&mut base, &serde_json::json!({"value": 2, "shard": 7}));
        assert_eq!(base, serde_json::json!({"value": 2, "kept": true, "shard": 7}));
    }

    #[test]
    fn fork_state_derives_from_sub_phases() {
        let dir = tempfile::tempdir().expect("tempdir");
        let journal = dir.path().join("journal");
        std::fs::create_dir_all(&journal).expect("mkdirs");
        let fork = Fork::new(
            "ID.ps.STAGE",
            dir.path(),
            0,
            SmallVec::new(),
            &journal,
        );
        fork.make_dirs(true).expect("mkdirs");
        assert_eq!(fork.get_state(true), None);

        fork.split_metadata
            .write_raw(MetadataFile::JobId, "1")
            .expect("write");
        assert_eq!(fork.get_state(true), Some(MetadataState::Running));

        fork.split_metadata
            .write_raw(MetadataFile::Errors, "split failed")
            .expect("write");
        assert_eq!(fork.get_state(true), Some(MetadataState::Failed));
        let (_path, message) = fork.error_message().expect("error message");
        assert_eq!(&*message, "split failed");
    }

    #[test]
    fn reset_clears_run_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let journal = dir.path().join("journal");
        std::fs::create_dir_all(&journal).expect("mkdirs");
        let mut fork = Fork::new("ID.ps.STAGE", dir.path(), 0, SmallVec::new(), &journal);
        fork.make_dirs(false).expect("mkdirs");
        fork.metadata
            .write_raw(MetadataFile::Errors, "boom")
            .expect("write");
        assert_eq!(fork.get_state(false), Some(MetadataState::Failed));
        fork.reset().expect("reset");
        assert_eq!(fork.get_state(false), None);
    }
}
