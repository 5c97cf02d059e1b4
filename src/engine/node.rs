//! Nodes: the runtime's unit of execution.
//!
//! A node is either a stage (leaf, owns forks and issues jobs) or a
//! pipeline (owns subnodes and aggregates their states). The node tree is
//! the ownership structure; prerequisite edges are id lookups overlaid on
//! it, so the graph stays a tree plus a DAG of weak references.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Serialize;
use smallvec::SmallVec;

use crate::engine::RuntimeError;
use crate::engine::fork::{Fork, ForkStepSpec, read_outs};
use crate::engine::job::{JobManager, thread_env};
use crate::engine::metadata::{
    Metadata,
    MetadataFile,
    MetadataState,
    transient_marker_line,
};
use crate::mro::ast::{Modifiers, ResourceHints};

/// Index of a node in the pipestance's node store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub usize);

/// A heartbeat older than this, for a job that is also invisible to the
/// process table, marks the job as dead.
pub const HEARTBEAT_STALE: Duration = Duration::from_secs(600);

/// Where a stage input's value comes from at run time, flattened through
/// every enclosing pipeline binding at construction.
#[derive(Debug, Clone)]
pub enum FlatSource {
    /// A literal value.
    Value(serde_json::Value),
    /// A sweep: one value per fork along this dimension.
    Sweep(Vec<serde_json::Value>),
    /// An output of a producing stage node, read from its fork metadata.
    StageOuts {
        /// The producer's node directory.
        node_path: PathBuf,
        /// The producer's fully-qualified name, for dependency edges.
        fq_name: String,
        /// How many forks the producer has.
        fork_count: usize,
        /// The referenced output.
        output: Arc<str>,
    },
    /// The producer is disabled; consumers observe null.
    Disabled,
}

impl FlatSource {
    /// Resolve this source for one consumer fork.
    ///
    /// `fork` carries the consumer's (index, count); `sweep_digit` yields
    /// the chosen index for each sweep dimension in encounter order. With no
    /// consumer fork context (pipeline outputs), a multi-fork producer
    /// resolves to the array of its per-fork values.
    fn resolve(
        &self,
        fork: Option<(usize, usize)>,
        sweep_digit: &mut impl FnMut(usize) -> usize,
    ) -> serde_json::Value {
        match self {
            Self::Value(value) => value.clone(),
            Self::Disabled => serde_json::Value::Null,
            Self::Sweep(values) => {
                let digit = sweep_digit(values.len());
                values.get(digit).cloned().unwrap_or(serde_json::Value::Null)
            }
            Self::StageOuts {
                node_path,
                fork_count,
                output,
                ..
            } => match fork {
                Some((index, count)) => {
                    // Swept producers line up with swept consumers fork by
                    // fork; otherwise every consumer reads the sole fork.
                    let producer_fork = if *fork_count == count { index } else { 0 };
                    read_fork_output(node_path, producer_fork, output)
                }
                None => {
                    if *fork_count == 1 {
                        read_fork_output(node_path, 0, output)
                    } else {
                        serde_json::Value::Array(
                            (0..*fork_count)
                                .map(|fork| read_fork_output(node_path, fork, output))
                                .collect(),
                        )
                    }
                }
            },
        }
    }
}

/// Read one output field from a producer fork's `Outs`.
fn read_fork_output(node_path: &Path, fork: usize, output: &str) -> serde_json::Value {
    let metadata = Metadata::new(String::new(), node_path.join(format!("fork{fork}")));
    read_outs(&metadata)
        .get(output)
        .cloned()
        .unwrap_or(serde_json::Value::Null)
}

/// The stage-specific half of a node.
pub struct StageNode {
    /// Resolved program plus fixed arguments for the stage's code.
    pub stagecode: Vec<String>,
    /// Declared resource hints.
    pub hints: Option<ResourceHints>,
    /// Input name to flattened source, in declared binding order.
    pub args_sources: Vec<(Arc<str>, FlatSource)>,
    /// The forks, one per point of the sweep product.
    pub forks: Vec<Fork>,
    /// Whether the stage splits into chunks.
    pub split: bool,
    /// Outputs that must survive volatile deletion.
    pub retain: HashSet<Arc<str>>,
    /// Apply volatile deletion per fork rather than per stage.
    pub strict_volatile: bool,
    /// Whether volatile deletion already ran for this node.
    pub vdr_done: bool,
    /// Bytes reclaimed by volatile deletion, for the perf summary.
    pub vdr_bytes: u64,
}

/// The variant payload of a node.
pub enum NodeKind {
    /// A pipeline: aggregates subnodes and forwards outputs.
    Pipeline {
        /// Output name to flattened source for the return bindings.
        ret_sources: Vec<(Arc<str>, FlatSource)>,
    },
    /// A stage: issues jobs through its forks.
    Stage(StageNode),
}

/// A runnable node of the pipestance tree.
pub struct Node {
    /// The call instance id.
    pub name: Arc<str>,
    /// Dotted fully-qualified name, rooted at the pipestance id.
    pub fq_name: String,
    /// The node's directory.
    pub path: PathBuf,
    /// The owning pipeline node.
    pub parent: Option<NodeId>,
    /// Child nodes, keyed by call instance id.
    pub subnodes: BTreeMap<Arc<str>, NodeId>,
    /// Nodes that must be done before this node runs.
    pub prenodes: Vec<NodeId>,
    /// Reverse edges: nodes that consume this node's outputs.
    pub postnodes: Vec<NodeId>,
    /// Current state.
    pub state: MetadataState,
    /// Node-level metadata.
    pub metadata: Metadata,
    /// The call's modifier set.
    pub modifiers: Modifiers,
    /// Stage- or pipeline-specific payload.
    pub kind: NodeKind,
}

/// Shared context handed to every node step.
pub struct StepContext<'a> {
    /// The local job manager; always present.
    pub local_jm: &'a mut (dyn JobManager + 'static),
    /// The cluster job manager, in cluster modes.
    pub cluster_jm: Option<&'a mut (dyn JobManager + 'static)>,
    /// The pipestance tmp directory advertised to jobs.
    pub tmp_path: &'a Path,
}

impl StepContext<'_> {
    /// The manager a job should go to, honoring the `local` modifier.
    pub fn manager_for(&mut self, local: bool) -> &mut dyn JobManager {
        if local {
            return self.local_jm;
        }
        match self.cluster_jm.as_deref_mut() {
            Some(cluster) => cluster,
            None => self.local_jm,
        }
    }
}

/// Aggregate child states per the pipeline rules: failure dominates,
/// activity next, then disabled, complete, and finally "still waiting".
pub fn aggregate_states(states: impl IntoIterator<Item = MetadataState>) -> MetadataState {
    let mut any = false;
    let mut any_running = false;
    let mut all_disabled = true;
    let mut all_done = true;
    for state in states {
        any = true;
        match state {
            MetadataState::Failed => return MetadataState::Failed,
            // Queued is not Running: a submitted job that has not been
            // confirmed started leaves the aggregate waiting.
            MetadataState::Running => {
                any_running = true;
                all_disabled = false;
                all_done = false;
            }
            MetadataState::DisabledState => {}
            MetadataState::Complete => all_disabled = false,
            _ => {
                all_disabled = false;
                all_done = false;
            }
        }
    }
    if !any {
        return MetadataState::Complete;
    }
    if any_running {
        MetadataState::Running
    } else if all_disabled {
        MetadataState::DisabledState
    } else if all_done {
        MetadataState::Complete
    } else {
        MetadataState::ForkWaiting
    }
}

/// One node's entry in the final state digest.
#[derive(Debug, Serialize)]
pub struct NodeInfo {
    /// Fully-qualified name.
    pub fqname: String,
    /// Call instance name.
    pub name: String,
    /// Terminal (or last observed) state.
    pub state: &'static str,
    /// Per-fork states.
    pub forks: Vec<ForkInfo>,
}

/// One fork's entry in the final state digest.
#[derive(Debug, Serialize)]
pub struct ForkInfo {
    /// Fork index.
    pub index: usize,
    /// Last observed state.
    pub state: &'static str,
}

/// A failed node's user-facing summary.
#[derive(Debug, Clone)]
pub struct FatalError {
    /// The failed node.
    pub fq_name: String,
    /// One-line summary.
    pub summary: String,
    /// Full error text.
    pub message: String,
    /// Paths of the error files behind the summary.
    pub paths: Vec<String>,
}

impl Node {
    /// The stage payload, if this is a stage node.
    #[must_use]
    pub fn stage(&self) -> Option<&StageNode> {
        match &self.kind {
            NodeKind::Stage(stage) => Some(stage),
            NodeKind::Pipeline { .. } => None,
        }
    }

    /// Mutable access to the stage payload.
    pub fn stage_mut(&mut self) -> Option<&mut StageNode> {
        match &mut self.kind {
            NodeKind::Stage(stage) => Some(stage),
            NodeKind::Pipeline { .. } => None,
        }
    }

    /// Advance a stage node one step.
    ///
    /// `pre_states` are the current states of this node's prerequisites, in
    /// `prenodes` order.
    pub async fn step_stage(
        &mut self,
        pre_states: &[MetadataState],
        ctx: &mut StepContext<'_>,
    ) -> Result<bool, RuntimeError> {
        if self.state.is_terminal() {
            return Ok(false);
        }
        if self.state == MetadataState::Waiting {
            if pre_states.iter().all(|state| state.is_done()) {
                self.state = MetadataState::Ready;
                self.mkdirs()?;
                log::debug!("{}: ready", self.fq_name);
                return Ok(true);
            }
            return Ok(false);
        }

        // Ready, Queued or Running: drive the forks.
        let NodeKind::Stage(stage) = &mut self.kind else {
            return Err(RuntimeError::internal("step_stage on a pipeline node"));
        };
        let local = self.modifiers.local;
        let tmp_path = ctx.tmp_path;
        let jm = ctx.manager_for(local);
        let resources = jm.resolve_resources(stage.hints.as_ref());
        let envs = thread_env(jm.settings(), resources.threads);

        let mut progress = false;
        let fork_count = stage.forks.len().max(1);
        for index in 0..stage.forks.len() {
            // Resolve args before borrowing the fork mutably.
            let args = {
                let fork = &stage.forks[index];
                let mut sweep_slot = 0_usize;
                let mut map = serde_json::Map::new();
                for (id, source) in &stage.args_sources {
                    let mut digit = |_cardinality: usize| {
                        let value = fork.sweep_choice.get(sweep_slot).copied().unwrap_or(0);
                        sweep_slot = sweep_slot.saturating_add(1);
                        value
                    };
                    map.insert(
                        id.to_string(),
                        source.resolve(Some((fork.index, fork_count)), &mut digit),
                    );
                }
                serde_json::Value::Object(map)
            };
            let spec = ForkStepSpec {
                fq_name: &self.fq_name,
                stagecode: &stage.stagecode,
                resources: resources.clone(),
                split: stage.split,
                args,
                thread_envs: &envs,
                tmp_path,
            };
            progress = stage.forks[index].step(&spec, jm).await? || progress;
        }

        let new_state = stage_state_from_forks(stage);
        if new_state != self.state {
            log::info!("{}: {}", self.fq_name, new_state.as_str());
            self.state = new_state;
            progress = true;
            if new_state.is_terminal() {
                // The node leaves the frontier now; hand back whatever its
                // forks still hold.
                for fork in &mut stage.forks {
                    fork.release_in_flight(jm);
                }
            }
        }
        Ok(progress)
    }

    /// Advance a pipeline node: aggregate child states and forward outputs
    /// on completion.
    pub fn step_pipeline(&mut self, sub_states: &[MetadataState]) -> Result<bool, RuntimeError> {
        if self.state.is_terminal() {
            return Ok(false);
        }
        let new_state = aggregate_states(sub_states.iter().copied());
        let changed = new_state != self.state;
        self.state = new_state;
        if self.state == MetadataState::Complete {
            let NodeKind::Pipeline { ret_sources } = &self.kind else {
                return Err(RuntimeError::internal("step_pipeline on a stage node"));
            };
            let mut outs = serde_json::Map::new();
            for (id, source) in ret_sources {
                let mut digit = |_| 0;
                outs.insert(id.to_string(), source.resolve(None, &mut digit));
            }
            self.metadata.make_dirs()?;
            self.metadata
                .write_json(MetadataFile::Outs, &serde_json::Value::Object(outs))?;
            self.metadata.write_time(MetadataFile::Complete)?;
            log::info!("{}: complete", self.fq_name);
        }
        Ok(changed)
    }

    /// Create the node's directories (and its forks' on first use).
    pub fn mkdirs(&mut self) -> Result<(), RuntimeError> {
        self.metadata.make_dirs()?;
        if let NodeKind::Stage(stage) = &self.kind {
            for fork in &stage.forks {
                fork.make_dirs(stage.split)?;
            }
        }
        Ok(())
    }

    /// Recompute this node's state from metadata alone (stage nodes).
    ///
    /// Used on reattach, before any job is issued.
    #[must_use]
    pub fn compute_state_from_disk(&self) -> MetadataState {
        match &self.kind {
            NodeKind::Stage(stage) => {
                if self.modifiers.disabled {
                    return MetadataState::DisabledState;
                }
                let states: Vec<MetadataState> = stage
                    .forks
                    .iter()
                    .map(|fork| fork.get_state(stage.split).unwrap_or(MetadataState::Waiting))
                    .collect();
                if states.iter().any(|state| *state == MetadataState::Failed) {
                    MetadataState::Failed
                } else if !states.is_empty()
                    && states.iter().all(|state| *state == MetadataState::Complete)
                {
                    MetadataState::Complete
                } else if states.iter().any(|state| {
                    matches!(state, MetadataState::Running | MetadataState::Queued)
                }) {
                    MetadataState::Running
                } else {
                    MetadataState::Waiting
                }
            }
            NodeKind::Pipeline { .. } => MetadataState::Waiting,
        }
    }

    /// Every metadata handle under this node.
    pub fn collect_metadatas(&self) -> Vec<&Metadata> {
        let mut metadatas = vec![&self.metadata];
        if let NodeKind::Stage(stage) = &self.kind {
            for fork in &stage.forks {
                metadatas.extend(fork.metadatas());
            }
        }
        metadatas
    }

    /// Check liveness of this node's submitted jobs.
    ///
    /// A job whose heartbeat is stale beyond `stale_after` and which the
    /// job manager cannot see locally gets the "not running" marker; the
    /// next step observes it as a failure.
    pub fn check_heartbeats(&self, jm: &dyn JobManager, stale_after: Duration, now: SystemTime) {
        let NodeKind::Stage(stage) = &self.kind else {
            return;
        };
        for fork in &stage.forks {
            for metadata in fork.metadatas() {
                if !matches!(
                    metadata.get_state(),
                    Some(MetadataState::Queued | MetadataState::Running)
                ) {
                    continue;
                }
                let Some(job_id) = metadata.read_raw(MetadataFile::JobId) else {
                    continue;
                };
                let reference = metadata
                    .heartbeat_mtime()
                    .or_else(|| file_mtime(&metadata.file_path(MetadataFile::JobId)));
                let stale = reference.is_none_or(|mtime| {
                    now.duration_since(mtime)
                        .map_or(false, |age| age > stale_after)
                });
                if stale && !jm.job_alive(&job_id) {
                    log::warn!(
                        "{}: heartbeat stale and job {job_id} not found",
                        metadata.fq_name()
                    );
                    metadata.fail_not_running(&job_id);
                }
            }
        }
    }

    /// Mark the node killed: stops nothing that already runs, but records
    /// the message so completions are ignored and state reads Failed.
    pub fn kill(&mut self, message: &str) {
        if self.state.is_terminal() {
            return;
        }
        if let NodeKind::Stage(stage) = &self.kind {
            for fork in &stage.forks {
                fork.kill(message);
            }
        }
    }

    /// Clear a failed node back to Waiting, removing its failure markers.
    pub fn reset(&mut self) -> Result<(), RuntimeError> {
        log::info!("{}: reset", self.fq_name);
        if let NodeKind::Stage(stage) = &mut self.kind {
            for fork in &mut stage.forks {
                fork.reset()?;
            }
            stage.vdr_done = false;
        }
        for file in [
            MetadataFile::Errors,
            MetadataFile::Complete,
            MetadataFile::Outs,
        ] {
            self.metadata.remove(file)?;
        }
        self.state = if self.modifiers.disabled {
            MetadataState::DisabledState
        } else {
            MetadataState::Waiting
        };
        Ok(())
    }

    /// Clear every read cache under this node.
    pub fn clear_read_caches(&self) {
        self.metadata.clear_read_cache();
        if let NodeKind::Stage(stage) = &self.kind {
            for fork in &stage.forks {
                fork.clear_read_caches();
            }
        }
    }

    /// The failure summary for a failed node, if any error was recorded.
    #[must_use]
    pub fn get_fatal_error(&self) -> Option<FatalError> {
        let NodeKind::Stage(stage) = &self.kind else {
            return None;
        };
        for fork in &stage.forks {
            if let Some((path, message)) = fork.error_message() {
                let summary = message.lines().next().unwrap_or("unknown error").to_owned();
                return Some(FatalError {
                    fq_name: self.fq_name.clone(),
                    summary,
                    message: message.to_string(),
                    paths: vec![path],
                });
            }
        }
        None
    }

    /// Whether this node's failure (if any) is transient, plus the marker
    /// line that says so.
    #[must_use]
    pub fn is_error_transient(&self) -> (bool, String) {
        match self.get_fatal_error() {
            None => (true, String::new()),
            Some(error) => match transient_marker_line(&error.message) {
                Some(line) => (true, line.to_owned()),
                None => (false, error.summary),
            },
        }
    }

    /// This node's entry in the final state digest.
    #[must_use]
    pub fn serialize_state(&self) -> NodeInfo {
        let forks = match &self.kind {
            NodeKind::Stage(stage) => stage
                .forks
                .iter()
                .map(|fork| ForkInfo {
                    index: fork.index,
                    state: fork
                        .get_state(stage.split)
                        .unwrap_or(MetadataState::Waiting)
                        .as_str(),
                })
                .collect(),
            NodeKind::Pipeline { .. } => Vec::new(),
        };
        NodeInfo {
            fqname: self.fq_name.clone(),
            name: self.name.to_string(),
            state: self.state.as_str(),
            forks,
        }
    }

    /// Delete volatile outputs whose consumers have all completed.
    ///
    /// Outputs named in a retain list survive; everything else that points
    /// into the fork directories is removed. Returns the bytes reclaimed.
    pub fn vdr_kill(&mut self) -> u64 {
        let NodeKind::Stage(stage) = &mut self.kind else {
            return 0;
        };
        if stage.vdr_done || !self.modifiers.volatile {
            return 0;
        }
        stage.vdr_done = true;
        let mut deleted = 0_u64;
        for fork in &stage.forks {
            let outs = read_outs(&fork.metadata);
            let Some(outs) = outs.as_object() else {
                continue;
            };
            for (name, value) in outs {
                if stage.retain.contains(name.as_str()) {
                    continue;
                }
                let serde_json::Value::String(path) = value else {
                    continue;
                };
                let path = Path::new(path);
                // Only files the fork itself produced are candidates.
                if !path.starts_with(&fork.path) {
                    continue;
                }
                if let Ok(meta) = std::fs::metadata(path) {
                    deleted = deleted.saturating_add(meta.len());
                    if let Err(error) = std::fs::remove_file(path) {
                        log::warn!("{}: vdr failed for {}: {error}", self.fq_name, path.display());
                    }
                }
            }
        }
        stage.vdr_bytes = deleted;
        if deleted > 0 {
            log::info!("{}: vdr reclaimed {deleted} bytes", self.fq_name);
        }
        deleted
    }
}

/// Derive a stage node's state from its forks.
fn stage_state_from_forks(stage: &StageNode) -> MetadataState {
    let states: Vec<Option<MetadataState>> = stage
        .forks
        .iter()
        .map(|fork| fork.get_state(stage.split))
        .collect();
    if states.iter().any(|state| *state == Some(MetadataState::Failed)) {
        MetadataState::Failed
    } else if !states.is_empty()
        && states
            .iter()
            .all(|state| *state == Some(MetadataState::Complete))
    {
        MetadataState::Complete
    } else if states
        .iter()
        .any(|state| matches!(state, Some(MetadataState::Running)))
    {
        MetadataState::Running
    } else if states
        .iter()
        .any(|state| matches!(state, Some(MetadataState::Queued)))
    {
        MetadataState::Queued
    } else {
        MetadataState::Ready
    }
}

/// Mtime of a file, if it exists.
fn file_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|meta| meta.modified()).ok()
}

/// Enumerate the sweep choices for `dims`, slowest dimension first.
#[must_use]
pub fn sweep_permutations(dims: &[usize]) -> Vec<SmallVec<[usize; 2]>> {
    let count: usize = dims.iter().copied().map(|dim| dim.max(1)).product();
    (0..count)
        .map(|index| {
            let mut remainder = index;
            let mut choice = SmallVec::with_capacity(dims.len());
            for dim in dims.iter().rev() {
                let dim = (*dim).max(1);
                choice.push(remainder % dim);
                remainder /= dim;
            }
            choice.reverse();
            choice
        })
        .collect()
}

#[cfg(test)]
#[expect(clippy::expect_used, reason = "tests")]
mod tests {
    use super::*;

    #[test]
    fn sweep_permutations_cover_the_product() {
        let permutations = sweep_permutations(&[2, 3]);
        assert_eq!(permutations.len(), 6);
        assert_eq!(permutations[0].as_slice(), [0, 0]);
        assert_eq!(permutations[1].as_slice(), [0, 1]);
        assert_eq!(permutations[3].as_slice(), [1, 0]);
        assert_eq!(permutations[5].as_slice(), [1, 2]);
        assert_eq!(sweep_permutations(&[]).len(), 1);
    }

    #[test]
    fn aggregation_failure_dominates() {
        let state = aggregate_states([
            MetadataState::Complete,
            MetadataState::Failed,
            MetadataState::Running,
        ]);
        assert_eq!(state, MetadataState::Failed);
    }

    #[test]
    fn aggregation_matches_the_prescribed_rules() {
        use MetadataState::{
            Complete,
            DisabledState,
            Failed,
            ForkWaiting,
            Queued,
            Running,
            Waiting,
        };
        assert_eq!(aggregate_states([Running, Complete]), Running);
        assert_eq!(aggregate_states([Queued, Complete]), ForkWaiting);
        assert_eq!(aggregate_states([DisabledState, DisabledState]), DisabledState);
        assert_eq!(aggregate_states([Complete, DisabledState]), Complete);
        assert_eq!(aggregate_states([Complete, Complete]), Complete);
        assert_eq!(aggregate_states([Waiting, Complete]), ForkWaiting);
        assert_eq!(aggregate_states([Failed, Running]), Failed);
    }

    proptest::proptest! {
        /// Property: the aggregate is Failed iff any child failed; Complete
        /// only when every child is done; Disabled only when every child is
        /// disabled.
        #[test]
        fn aggregation_invariants(states in proptest::collection::vec(0_u8..8, 1..20)) {
            let states: Vec<MetadataState> = states
                .into_iter()
                .map(|state| match state {
                    0 => MetadataState::Waiting,
                    1 => MetadataState::Ready,
                    2 => MetadataState::Queued,
                    3 => MetadataState::Running,
                    4 => MetadataState::Complete,
                    5 => MetadataState::Failed,
                    6 => MetadataState::DisabledState,
                    _ => MetadataState::ForkWaiting,
                })
                .collect();
            let aggregate = aggregate_states(states.iter().copied());
            let any_failed = states.contains(&MetadataState::Failed);
            proptest::prop_assert_eq!(aggregate == MetadataState::Failed, any_failed);
            if aggregate == MetadataState::Complete {
                proptest::prop_assert!(states.iter().all(|state| state.is_done()));
            }
            if aggregate == MetadataState::DisabledState {
                proptest::prop_assert!(
                    states.iter().all(|state| *state == MetadataState::DisabledState)
                );
            }
        }
    }

    #[test]
    fn flat_sources_resolve_sweeps_per_fork() {
        let source = FlatSource::Sweep(vec![
            serde_json::json!(10),
            serde_json::json!(20),
        ]);
        let mut digit = |_| 1;
        assert_eq!(source.resolve(Some((1, 2)), &mut digit), serde_json::json!(20));
        let mut digit = |_| 0;
        assert_eq!(source.resolve(Some((0, 2)), &mut digit), serde_json::json!(10));
    }

    #[test]
    fn stage_outs_resolve_from_fork_metadata() {
        let dir = tempfile::tempdir().expect("tempdir");
        let node_path = dir.path().join("STAGE_A");
        let fork0 = Metadata::new("x", node_path.join("fork0"));
        fork0.make_dirs().expect("mkdirs");
        fork0
            .write_raw(MetadataFile::Outs, r#"{"result": "hello"}"#)
            .expect("write");

        let source = FlatSource::StageOuts {
            node_path: node_path.clone(),
            fq_name: "ID.ps.STAGE_A".to_owned(),
            fork_count: 1,
            output: Arc::from("result"),
        };
        let mut digit = |_| 0;
        assert_eq!(
            source.resolve(Some((0, 1)), &mut digit),
            serde_json::json!("hello")
        );
        // A pipeline-level read of a single-fork producer is the scalar.
        let mut digit = |_| 0;
        assert_eq!(source.resolve(None, &mut digit), serde_json::json!("hello"));
    }
}
