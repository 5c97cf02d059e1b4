//! The pipestance: a compiled invocation materialized on disk and driven
//! to a terminal state.
//!
//! Construction turns the top-level call into a tree of pipeline nodes and
//! a DAG of stage nodes (the invocation binder); the scheduling loop
//! advances the frontier, probes liveness, and persists everything needed
//! to reattach after a restart.

use std::cell::Cell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use serde::Serialize;
use smallvec::SmallVec;

use crate::engine::fork::Fork;
use crate::engine::metadata::{
    Metadata,
    MetadataFile,
    MetadataState,
    NOT_RUNNING_MARKER,
    timestamp,
};
use crate::engine::node::{
    FatalError,
    FlatSource,
    Node,
    NodeId,
    NodeKind,
    StageNode,
    StepContext,
    aggregate_states,
    sweep_permutations,
    HEARTBEAT_STALE,
};
use crate::engine::{RuntimeContext, RuntimeError};
use crate::mro::ast::{
    Ast,
    BindStm,
    Bindings,
    CallStm,
    CallableRef,
    Expr,
    Modifiers,
    Params,
    Pipeline,
    RefExpr,
    RefKind,
    Stage,
    StageLang,
};
use crate::mro::loc::SourceLoc;

/// Probes of the cluster queue are spaced at least this far apart.
pub const QUEUE_CHECK_LIMIT: Duration = Duration::from_secs(5 * 60);

/// The pipestance is killed when its directory has less free space.
const MIN_DISK_SPACE_BYTES: u64 = 256 * 1024 * 1024;

/// Index-based storage for the node tree.
#[derive(Default)]
struct NodeStore {
    /// Parents precede their children.
    nodes: Vec<Node>,
}

impl NodeStore {
    fn push(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(node);
        id
    }

    fn get(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    fn get_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    fn ids(&self) -> impl Iterator<Item = NodeId> + use<> {
        (0..self.nodes.len()).map(NodeId)
    }
}

/// State of the rate-limited queue probe.
#[derive(Default)]
struct ProbeState {
    /// Whether a probe task is currently in flight.
    active: bool,
    /// When the last probe finished.
    last: Option<Instant>,
}

/// Decide whether a probe may start now; marks the probe active if so.
fn probe_gate(state: &Mutex<ProbeState>, now: Instant, limit: Duration) -> bool {
    let mut state = state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    if state.active
        || state
            .last
            .is_some_and(|last| now.duration_since(last) < limit)
    {
        return false;
    }
    state.active = true;
    true
}

/// Mark the in-flight probe finished.
fn probe_done(state: &Mutex<ProbeState>, now: Instant) {
    let mut state = state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    state.active = false;
    state.last = Some(now);
}

/// One node's entry in the performance summary.
#[derive(Debug, Serialize)]
struct NodePerfInfo {
    /// Fully-qualified name.
    fqname: String,
    /// Terminal state.
    state: &'static str,
    /// Fork count.
    forks: usize,
    /// Bytes reclaimed by volatile deletion.
    vdr_bytes_reclaimed: u64,
}

/// An instance of a running (or failed, or completed) pipeline.
pub struct Pipestance {
    /// The instance identifier.
    psid: String,
    /// The pipestance root directory.
    path: PathBuf,
    /// Root-level metadata (lock, job mode, uuid, summaries).
    metadata: Metadata,
    /// All nodes; parents precede children.
    nodes: NodeStore,
    /// The top-level pipeline node.
    top: NodeId,
    /// The pipestance UUID, cached once read or set.
    uuid: Cell<Option<uuid::Uuid>>,
    /// Whether this controller holds the lock.
    locked: Cell<bool>,
    /// Guards "a probe is in flight" and "when was the last probe".
    probe: Arc<Mutex<ProbeState>>,
    /// Set while the finalize critical section runs.
    critical: Cell<bool>,
    /// The journal directory for cross-process breadcrumbs.
    journal_path: PathBuf,
    /// The tmp directory advertised to stage processes.
    tmp_path: PathBuf,
}

/// If the top-level call is a stage, wrap it in a synthetic pipeline whose
/// sole call is that stage and whose return bindings forward the stage's
/// outputs, so the root is always a pipeline.
fn wrap_stage_as_pipeline(call: &CallStm, stage: &Stage) -> Pipeline {
    let loc = SourceLoc::synthetic();
    let list: Vec<BindStm> = stage
        .out_params
        .list
        .iter()
        .map(|param| BindStm {
            id: Arc::clone(&param.id),
            expr: Expr::Ref(RefExpr {
                kind: RefKind::Call,
                id: Arc::clone(&call.id),
                output_id: Arc::clone(&param.id),
                loc: loc.clone(),
            }),
            tname: Some(param.ty.clone()),
            loc: loc.clone(),
        })
        .collect();
    let table = list
        .iter()
        .enumerate()
        .map(|(index, bind)| (Arc::clone(&bind.id), index))
        .collect();
    Pipeline {
        id: Arc::clone(&stage.id),
        in_params: Params::default(),
        out_params: stage.out_params.clone(),
        calls: vec![call.clone()],
        call_table: HashMap::from([(Arc::clone(&call.id), 0)]),
        ret: Bindings { list, table },
        retain: Vec::new(),
        loc: stage.loc.clone(),
    }
}

/// A flattened binding source plus the stage nodes it depends on.
type Source = (FlatSource, SmallVec<[NodeId; 2]>);

/// What a call instance looks like to its downstream consumers.
enum Producer {
    /// A stage node; consumers read its fork outputs.
    Stage {
        node_id: NodeId,
        node_path: PathBuf,
        fq_name: String,
        fork_count: usize,
        disabled: bool,
    },
    /// A pipeline node; consumers see through to its return sources.
    Pipeline {
        node_id: NodeId,
        ret: HashMap<Arc<str>, Source>,
        disabled: bool,
    },
}

/// Construction state for the invocation binder.
struct Builder<'a> {
    ast: &'a Ast,
    mro_paths: &'a [PathBuf],
    journal_path: PathBuf,
    nodes: NodeStore,
}

impl Builder<'_> {
    /// Flatten a bound expression into its runtime source.
    fn flatten_expr(
        &self,
        expr: &Expr,
        env: &HashMap<Arc<str>, Source>,
        producers: &HashMap<Arc<str>, Producer>,
    ) -> Result<Source, RuntimeError> {
        match expr {
            Expr::Literal { value, .. } => {
                Ok((FlatSource::Value(value.to_json()), SmallVec::new()))
            }
            Expr::Sweep { values, .. } => {
                let mut swept = Vec::with_capacity(values.len());
                for value in values {
                    let Expr::Literal { value, .. } = value else {
                        return Err(RuntimeError::Construction {
                            message: "sweeps may only range over literal values".to_owned(),
                        });
                    };
                    swept.push(value.to_json());
                }
                Ok((FlatSource::Sweep(swept), SmallVec::new()))
            }
            Expr::Ref(reference) => self.flatten_ref(reference, env, producers),
        }
    }

    /// Flatten a reference through the enclosing pipeline's scope.
    fn flatten_ref(
        &self,
        reference: &RefExpr,
        env: &HashMap<Arc<str>, Source>,
        producers: &HashMap<Arc<str>, Producer>,
    ) -> Result<Source, RuntimeError> {
        match reference.kind {
            RefKind::SelfRef => env.get(&reference.id).cloned().ok_or_else(|| {
                RuntimeError::Construction {
                    message: format!("unbound pipeline input '{}'", reference.id),
                }
            }),
            RefKind::Call => match producers.get(&reference.id) {
                Some(Producer::Stage {
                    node_id,
                    node_path,
                    fq_name,
                    fork_count,
                    disabled,
                }) => {
                    if *disabled {
                        return Ok((FlatSource::Disabled, SmallVec::new()));
                    }
                    Ok((
                        FlatSource::StageOuts {
                            node_path: node_path.clone(),
                            fq_name: fq_name.clone(),
                            fork_count: *fork_count,
                            output: Arc::clone(&reference.output_id),
                        },
                        SmallVec::from_slice(&[*node_id]),
                    ))
                }
                Some(Producer::Pipeline {
                    node_id,
                    ret,
                    disabled,
                }) => {
                    if *disabled {
                        return Ok((FlatSource::Disabled, SmallVec::new()));
                    }
                    let (source, mut deps) = ret
                        .get(&reference.output_id)
                        .cloned()
                        .ok_or_else(|| RuntimeError::Construction {
                            message: format!(
                                "'{}' has no output '{}'",
                                reference.id, reference.output_id
                            ),
                        })?;
                    // Depend on the pipeline node too, so consumers wait for
                    // the whole subtree rather than a single inner stage.
                    if !deps.contains(node_id) {
                        deps.push(*node_id);
                    }
                    Ok((source, deps))
                }
                None => Err(RuntimeError::Construction {
                    message: format!("'{}' is not a call in this pipeline", reference.id),
                }),
            },
        }
    }

    /// Create a stage node for `call`, bound through `env`/`producers`.
    fn build_stage(
        &mut self,
        stage: &Stage,
        call: &CallStm,
        parent: NodeId,
        parent_path: &Path,
        parent_fq: &str,
        env: &HashMap<Arc<str>, Source>,
        producers: &HashMap<Arc<str>, Producer>,
        disabled: bool,
    ) -> Result<NodeId, RuntimeError> {
        let mut args_sources = Vec::with_capacity(call.bindings.list.len());
        let mut prenodes: Vec<NodeId> = Vec::new();
        let mut sweep_dims: SmallVec<[usize; 2]> = SmallVec::new();
        for bind in &call.bindings.list {
            let (source, deps) = self.flatten_expr(&bind.expr, env, producers)?;
            if let FlatSource::Sweep(values) = &source {
                sweep_dims.push(values.len().max(1));
            }
            for dep in deps {
                if !prenodes.contains(&dep) {
                    prenodes.push(dep);
                }
            }
            args_sources.push((Arc::clone(&bind.id), source));
        }

        let fq_name = format!("{parent_fq}.{}", call.id);
        let path = parent_path.join(&*call.id);
        let forks: Vec<Fork> = sweep_permutations(&sweep_dims)
            .into_iter()
            .enumerate()
            .map(|(index, choice)| {
                Fork::new(&fq_name, &path, index, choice, &self.journal_path)
            })
            .collect();

        let modifiers = Modifiers {
            disabled: call.modifiers.disabled || disabled,
            ..call.modifiers
        };
        let node = Node {
            name: Arc::clone(&call.id),
            fq_name: fq_name.clone(),
            metadata: Metadata::new(fq_name, path.clone())
                .with_journal(self.journal_path.clone()),
            path,
            parent: Some(parent),
            subnodes: Default::default(),
            prenodes,
            postnodes: Vec::new(),
            state: if modifiers.disabled {
                MetadataState::DisabledState
            } else {
                MetadataState::Waiting
            },
            modifiers,
            kind: NodeKind::Stage(StageNode {
                stagecode: self.stagecode(stage),
                hints: stage.resources.clone(),
                args_sources,
                forks,
                split: stage.split,
                retain: stage.retain.iter().cloned().collect(),
                strict_volatile: stage
                    .resources
                    .as_ref()
                    .is_some_and(|hints| hints.strict_volatile),
                vdr_done: false,
                vdr_bytes: 0,
            }),
        };
        let id = self.nodes.push(node);
        self.connect_edges(id);
        Ok(id)
    }

    /// Create a pipeline node and, recursively, its children.
    fn build_pipeline(
        &mut self,
        pipeline: &Pipeline,
        call: &CallStm,
        parent: Option<NodeId>,
        parent_path: &Path,
        parent_fq: &str,
        env: HashMap<Arc<str>, Source>,
        disabled: bool,
    ) -> Result<NodeId, RuntimeError> {
        let disabled = disabled || call.modifiers.disabled;
        let fq_name = format!("{parent_fq}.{}", call.id);
        let path = parent_path.join(&*call.id);
        let node = Node {
            name: Arc::clone(&call.id),
            fq_name: fq_name.clone(),
            metadata: Metadata::new(fq_name.clone(), path.clone())
                .with_journal(self.journal_path.clone()),
            path: path.clone(),
            parent,
            subnodes: Default::default(),
            prenodes: Vec::new(),
            postnodes: Vec::new(),
            state: if disabled {
                MetadataState::DisabledState
            } else {
                MetadataState::Waiting
            },
            modifiers: Modifiers {
                disabled,
                ..call.modifiers
            },
            kind: NodeKind::Pipeline {
                ret_sources: Vec::new(),
            },
        };
        let pipeline_id = self.nodes.push(node);

        let mut producers: HashMap<Arc<str>, Producer> = HashMap::new();
        let mut preflight: Vec<NodeId> = Vec::new();
        for sub_call in &pipeline.calls {
            let callee = self
                .ast
                .callable(&sub_call.dec_id)
                .ok_or_else(|| RuntimeError::Construction {
                    message: format!("'{}' is not a declared stage or pipeline", sub_call.dec_id),
                })?;
            let sub_disabled = disabled || sub_call.modifiers.disabled;
            let sub_id = match callee {
                CallableRef::Stage(stage) => self.build_stage(
                    stage, sub_call, pipeline_id, &path, &fq_name, &env, &producers,
                    sub_disabled,
                )?,
                CallableRef::Pipeline(sub_pipeline) => {
                    let mut sub_env = HashMap::new();
                    for bind in &sub_call.bindings.list {
                        let source = self.flatten_expr(&bind.expr, &env, &producers)?;
                        sub_env.insert(Arc::clone(&bind.id), source);
                    }
                    self.build_pipeline(
                        sub_pipeline,
                        sub_call,
                        Some(pipeline_id),
                        &path,
                        &fq_name,
                        sub_env,
                        sub_disabled,
                    )?
                }
            };
            let sub_node = self.nodes.get(sub_id);
            let producer = match &sub_node.kind {
                NodeKind::Stage(stage) => Producer::Stage {
                    node_id: sub_id,
                    node_path: sub_node.path.clone(),
                    fq_name: sub_node.fq_name.clone(),
                    fork_count: stage.forks.len().max(1),
                    disabled: sub_disabled,
                },
                NodeKind::Pipeline { ret_sources } => Producer::Pipeline {
                    node_id: sub_id,
                    ret: ret_sources
                        .iter()
                        .map(|(id, source)| {
                            (
                                Arc::clone(id),
                                (source.clone(), SmallVec::from_slice(&[sub_id])),
                            )
                        })
                        .collect(),
                    disabled: sub_disabled,
                },
            };
            self.nodes
                .get_mut(pipeline_id)
                .subnodes
                .insert(Arc::clone(&sub_call.id), sub_id);
            if sub_call.modifiers.preflight {
                preflight.push(sub_id);
            }
            producers.insert(Arc::clone(&sub_call.id), producer);
        }

        // Preflight calls gate every non-preflight sibling.
        let siblings: Vec<NodeId> = self
            .nodes
            .get(pipeline_id)
            .subnodes
            .values()
            .copied()
            .collect();
        for &gate in &preflight {
            for &sibling in &siblings {
                if sibling == gate || self.nodes.get(sibling).modifiers.preflight {
                    continue;
                }
                if !self.nodes.get(sibling).prenodes.contains(&gate) {
                    self.nodes.get_mut(sibling).prenodes.push(gate);
                    self.nodes.get_mut(gate).postnodes.push(sibling);
                }
            }
        }

        // Attach return bindings and record reverse edges so producers know
        // the pipeline consumes them.
        let mut ret_sources = Vec::with_capacity(pipeline.ret.list.len());
        for bind in &pipeline.ret.list {
            let (source, deps) = self.flatten_expr(&bind.expr, &env, &producers)?;
            for dep in deps {
                if !self.nodes.get(dep).postnodes.contains(&pipeline_id) {
                    self.nodes.get_mut(dep).postnodes.push(pipeline_id);
                }
            }
            ret_sources.push((Arc::clone(&bind.id), source));
        }
        if let NodeKind::Pipeline {
            ret_sources: slot, ..
        } = &mut self.nodes.get_mut(pipeline_id).kind
        {
            *slot = ret_sources;
        }

        // Retained references keep the producing stage's outputs out of
        // volatile deletion.
        for reference in &pipeline.retain {
            if let Some(Producer::Stage { node_id, .. }) = producers.get(&reference.id) {
                if let Some(stage) = self.nodes.get_mut(*node_id).stage_mut() {
                    stage.retain.insert(Arc::clone(&reference.output_id));
                }
            } else {
                log::warn!(
                    "retain of '{}.{}' does not name a stage call; ignored",
                    reference.id,
                    reference.output_id
                );
            }
        }

        Ok(pipeline_id)
    }

    /// Wire this node's prerequisite edges into its producers.
    fn connect_edges(&mut self, id: NodeId) {
        let prenodes = self.nodes.get(id).prenodes.clone();
        for pre in prenodes {
            if !self.nodes.get(pre).postnodes.contains(&id) {
                self.nodes.get_mut(pre).postnodes.push(id);
            }
        }
    }

    /// Resolve a stage's code into the program-plus-arguments prefix of its
    /// job command lines.
    fn stagecode(&self, stage: &Stage) -> Vec<String> {
        let resolved = crate::mro::include::search_paths(&stage.src.path, self.mro_paths)
            .map_or_else(|| stage.src.path.clone(), |path| path.display().to_string());
        let mut command = match stage.src.lang {
            Some(StageLang::Python) => vec!["python".to_owned(), resolved],
            _ => vec![resolved],
        };
        command.extend(stage.src.args.iter().cloned());
        command
    }

}

impl Pipestance {
    /// Materialize a pipestance from a compiled invocation.
    ///
    /// Construction is failure-transparent: an error in any subnode aborts
    /// the whole construction.
    pub fn new(
        ast: &Ast,
        psid: &str,
        path: &Path,
        mro_paths: &[PathBuf],
    ) -> Result<Self, RuntimeError> {
        let call = ast.call.as_ref().ok_or_else(|| RuntimeError::Construction {
            message: "invocation source carries no top-level call".to_owned(),
        })?;
        let callee = ast
            .callable(&call.dec_id)
            .ok_or_else(|| RuntimeError::Construction {
                message: format!("'{}' is not a declared stage or pipeline", call.dec_id),
            })?;

        let journal_path = path.join("journal");
        let tmp_path = path.join("tmp");
        let mut builder = Builder {
            ast,
            mro_paths,
            journal_path: journal_path.clone(),
            nodes: NodeStore::default(),
        };

        // The root environment is the invocation's own bindings.
        let mut env: HashMap<Arc<str>, Source> = HashMap::new();
        for bind in &call.bindings.list {
            let source = builder.flatten_expr(&bind.expr, &HashMap::new(), &HashMap::new())?;
            env.insert(Arc::clone(&bind.id), source);
        }

        let root_fq = format!("ID.{psid}");
        let top = match callee {
            CallableRef::Pipeline(pipeline) => {
                builder.build_pipeline(pipeline, call, None, path, &root_fq, env, false)?
            }
            CallableRef::Stage(stage) => {
                let wrapper = wrap_stage_as_pipeline(call, stage);
                builder.build_pipeline(&wrapper, call, None, path, &root_fq, HashMap::new(), false)?
            }
        };

        Ok(Self {
            psid: psid.to_owned(),
            metadata: Metadata::new(root_fq, path.to_owned()),
            path: path.to_owned(),
            nodes: builder.nodes,
            top,
            uuid: Cell::new(None),
            locked: Cell::new(false),
            probe: Arc::new(Mutex::new(ProbeState::default())),
            critical: Cell::new(false),
            journal_path,
            tmp_path,
        })
    }

    /// Create the on-disk layout and the initial metadata records for a
    /// freshly invoked pipestance.
    pub fn create_dirs(&self, job_mode: &str, invocation: &serde_json::Value) -> Result<(), RuntimeError> {
        std::fs::create_dir_all(&self.path)?;
        std::fs::create_dir_all(&self.journal_path)?;
        std::fs::create_dir_all(&self.tmp_path)?;
        self.metadata
            .write_json(MetadataFile::Invocation, invocation)?;
        self.metadata.write_raw(MetadataFile::JobMode, job_mode)?;
        self.metadata
            .write_raw(MetadataFile::Timestamp, &format!("start: {}", timestamp()))?;
        self.metadata.write_json(
            MetadataFile::Versions,
            &serde_json::json!({ "runtime": crate::VERSION }),
        )?;
        self.set_uuid(uuid::Uuid::new_v4())?;
        Ok(())
    }

    /// The pipestance root directory.
    #[must_use]
    pub fn get_path(&self) -> &Path {
        &self.path
    }

    /// The instance identifier.
    #[must_use]
    pub fn get_psid(&self) -> &str {
        &self.psid
    }

    /// The top-level node's fully-qualified name.
    #[must_use]
    pub fn get_fq_name(&self) -> &str {
        &self.nodes.get(self.top).fq_name
    }

    /// Whether this controller may mutate on-disk state.
    #[must_use]
    pub fn read_only(&self) -> bool {
        !self.locked.get()
    }

    /// Acquire the controller lock.
    ///
    /// Exactly one controller can win; losers observe the locked error.
    pub fn lock(&self) -> Result<(), RuntimeError> {
        std::fs::create_dir_all(&self.path)?;
        let lock_path = self.metadata.file_path(MetadataFile::Lock);
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Ok(_) => {
                self.locked.set(true);
                self.metadata.clear_read_cache();
                Ok(())
            }
            Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(RuntimeError::PipestanceLocked {
                    psid: self.psid.clone(),
                    path: self.path.clone(),
                })
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Release the controller lock.
    pub fn unlock(&self) {
        if self.locked.replace(false) {
            let _ = self.metadata.remove(MetadataFile::Lock);
        }
    }

    /// Whether the finalize critical section is active.
    #[must_use]
    pub fn in_critical_section(&self) -> bool {
        self.critical.get()
    }

    /// Verify the persisted job mode matches the current configuration.
    pub fn verify_job_mode(&self, job_mode: &str) -> Result<(), RuntimeError> {
        if let Some(persisted) = self.metadata.read_raw(MetadataFile::JobMode)
            && persisted.trim() != job_mode
        {
            return Err(RuntimeError::JobModeMismatch {
                psid: self.psid.clone(),
                persisted: persisted.trim().to_owned(),
                requested: job_mode.to_owned(),
            });
        }
        Ok(())
    }

    /// Load every node's metadata and compute states from disk alone.
    pub fn load_metadata(&mut self) {
        for id in self.nodes.ids() {
            self.nodes.get(id).clear_read_caches();
        }
        // Stage nodes first; reattached splits rediscover their chunks.
        for id in self.nodes.ids() {
            let node = self.nodes.get_mut(id);
            let fq_name = node.fq_name.clone();
            if let NodeKind::Stage(stage) = &mut node.kind {
                if stage.split {
                    for fork in &mut stage.forks {
                        if fork.chunks.is_empty()
                            && fork.split_metadata.get_state() == Some(MetadataState::Complete)
                        {
                            if let Err(error) = fork.load_chunks(&fq_name) {
                                log::warn!("{fq_name}: failed to reload chunks: {error}");
                            }
                        }
                    }
                }
                node.state = node.compute_state_from_disk();
            }
        }
        // Pipelines aggregate bottom-up; children always have larger ids.
        for id in self.nodes.ids().collect::<Vec<_>>().into_iter().rev() {
            if matches!(self.nodes.get(id).kind, NodeKind::Pipeline { .. }) {
                let states = self.child_states(id);
                let node = self.nodes.get_mut(id);
                if node.modifiers.disabled {
                    node.state = MetadataState::DisabledState;
                } else {
                    node.state = aggregate_states(states);
                    // Nothing observed on disk yet reads as Waiting, not
                    // Complete.
                    if node.subnodes.is_empty() {
                        node.state = MetadataState::Waiting;
                    }
                }
            }
        }
    }

    /// Current states of a pipeline node's children.
    fn child_states(&self, id: NodeId) -> Vec<MetadataState> {
        self.nodes
            .get(id)
            .subnodes
            .values()
            .map(|child| self.nodes.get(*child).state)
            .collect()
    }

    /// The frontier: failed nodes plus every runnable stage node whose
    /// prerequisites are done.
    fn frontier(&self) -> Vec<NodeId> {
        self.nodes
            .ids()
            .filter(|id| {
                let node = self.nodes.get(*id);
                if node.stage().is_none() {
                    return false;
                }
                if node.state == MetadataState::Failed {
                    return true;
                }
                if node.state.is_terminal() {
                    return false;
                }
                node.prenodes
                    .iter()
                    .all(|pre| self.nodes.get(*pre).state.is_done())
            })
            .collect()
    }

    /// One scheduling iteration. Returns whether any node made progress.
    pub async fn step_nodes(&mut self, rt: &mut RuntimeContext) -> Result<bool, RuntimeError> {
        if self.read_only() {
            return Ok(false);
        }
        check_minimal_space(&self.path)?;

        // A failed refresh is logged, not fatal; the loop proceeds on the
        // previous budget.
        if let Err(error) = rt.local_jm.refresh_resources() {
            log::error!("error refreshing local resources: {error}");
        }
        if let Some(cluster) = rt.cluster_jm.as_mut()
            && let Err(error) = cluster.refresh_resources()
        {
            log::error!("error refreshing cluster resources: {error}");
        }

        let tmp_path = self.tmp_path.clone();
        let mut progress = false;
        let mut ctx = StepContext {
            local_jm: rt.local_jm.as_mut(),
            cluster_jm: rt.cluster_jm.as_deref_mut(),
            tmp_path: &tmp_path,
        };
        for id in self.frontier() {
            let pre_states: Vec<MetadataState> = self
                .nodes
                .get(id)
                .prenodes
                .iter()
                .map(|pre| self.nodes.get(*pre).state)
                .collect();
            progress = self
                .nodes
                .get_mut(id)
                .step_stage(&pre_states, &mut ctx)
                .await?
                || progress;
        }

        // Pipelines aggregate after their children moved.
        for id in self.nodes.ids().collect::<Vec<_>>().into_iter().rev() {
            if matches!(self.nodes.get(id).kind, NodeKind::Pipeline { .. }) {
                let states = self.child_states(id);
                progress = self.nodes.get_mut(id).step_pipeline(&states)? || progress;
            }
        }

        self.run_vdr();

        // Fresh reads next iteration.
        for id in self.nodes.ids() {
            self.nodes.get(id).clear_read_caches();
        }
        Ok(progress)
    }

    /// Delete volatile outputs whose consumers have all completed.
    fn run_vdr(&mut self) {
        let candidates: Vec<NodeId> = self
            .nodes
            .ids()
            .filter(|id| {
                let node = self.nodes.get(*id);
                let Some(stage) = node.stage() else {
                    return false;
                };
                node.modifiers.volatile
                    && !stage.vdr_done
                    && node.state == MetadataState::Complete
                    && node
                        .postnodes
                        .iter()
                        .all(|post| self.nodes.get(*post).state.is_done())
            })
            .collect();
        for id in candidates {
            self.nodes.get_mut(id).vdr_kill();
        }
    }

    /// Aggregate the pipestance state.
    #[must_use]
    pub fn get_state(&self) -> MetadataState {
        let frontier = self.frontier();
        if frontier
            .iter()
            .any(|id| self.nodes.get(*id).state == MetadataState::Failed)
        {
            return MetadataState::Failed;
        }
        if frontier
            .iter()
            .any(|id| self.nodes.get(*id).state == MetadataState::Running)
        {
            return MetadataState::Running;
        }
        let stage_states: Vec<MetadataState> = self
            .nodes
            .ids()
            .filter_map(|id| self.nodes.get(id).stage().map(|_| self.nodes.get(id).state))
            .collect();
        if !stage_states.is_empty()
            && stage_states
                .iter()
                .all(|state| *state == MetadataState::DisabledState)
        {
            return MetadataState::DisabledState;
        }
        if stage_states.iter().all(|state| state.is_done()) {
            return MetadataState::Complete;
        }
        MetadataState::ForkWaiting
    }

    /// Check heartbeats and (rate-limited) the cluster queue.
    pub fn check_heartbeats(&self, rt: &RuntimeContext) {
        if self.read_only() {
            return;
        }
        self.query_queue(rt);
        let now = SystemTime::now();
        for id in self.frontier() {
            let node = self.nodes.get(id);
            if rt.cluster_jm.is_some() && !node.modifiers.local {
                // Cluster jobs are probed through the queue, not the local
                // process table.
                continue;
            }
            node.check_heartbeats(rt.local_jm.as_ref(), HEARTBEAT_STALE, now);
        }
    }

    /// Kick off the asynchronous queue probe if one is due.
    ///
    /// The probe never mutates node state; it writes "not running" markers
    /// into metadata, observed by the next step.
    fn query_queue(&self, rt: &RuntimeContext) {
        let Some(query) = rt.cluster_jm.as_ref().and_then(|jm| jm.queue_query()) else {
            return;
        };
        if !probe_gate(&self.probe, Instant::now(), QUEUE_CHECK_LIMIT) {
            return;
        }

        // Collect the jobs worth querying and the directories to poke if
        // they are missing.
        let mut needs_query: Vec<(String, PathBuf, String)> = Vec::new();
        let now = SystemTime::now();
        let grace = Duration::from_secs(query.grace_secs);
        for id in self.frontier() {
            for metadata in self.nodes.get(id).collect_metadatas() {
                if !matches!(
                    metadata.get_state(),
                    Some(MetadataState::Queued | MetadataState::Running)
                ) {
                    continue;
                }
                let Some(job_id) = metadata.read_raw(MetadataFile::JobId) else {
                    continue;
                };
                // Freshly submitted jobs may not be visible yet.
                let submitted = std::fs::metadata(metadata.file_path(MetadataFile::JobId))
                    .and_then(|meta| meta.modified())
                    .ok();
                if submitted.is_some_and(|time| {
                    now.duration_since(time).is_ok_and(|age| age < grace)
                }) {
                    continue;
                }
                needs_query.push((
                    job_id.trim().to_owned(),
                    metadata.path().to_owned(),
                    metadata.fq_name().to_owned(),
                ));
            }
        }
        if needs_query.is_empty() {
            probe_done(&self.probe, Instant::now());
            return;
        }

        let probe = Arc::clone(&self.probe);
        tokio::spawn(async move {
            let ids: Vec<String> = needs_query.iter().map(|(id, _, _)| id.clone()).collect();
            let (still_queued, raw) = query.check_queue(&ids).await;
            for (job_id, dir, fq_name) in needs_query {
                if still_queued.contains(&job_id) {
                    continue;
                }
                log::info!("{fq_name}: job {job_id} missing from the queue");
                // Plain file writes only: the probe owns no metadata handles
                // and never touches node state.
                let errors = dir.join(MetadataFile::Errors.file_name());
                let complete = dir.join(MetadataFile::Complete.file_name());
                if !errors.exists() && !complete.exists() {
                    let message = format!(
                        "job {job_id} {NOT_RUNNING_MARKER}: the job manager queue and the local process table have no record of it"
                    );
                    let _ = std::fs::write(&errors, message);
                }
            }
            if !raw.is_empty() {
                log::debug!("queue probe output:\n{raw}");
            }
            probe_done(&probe, Instant::now());
        });
    }

    /// Mark every frontier node killed and stop issuing jobs.
    pub fn kill_with_message(&mut self, message: &str) {
        if self.read_only() {
            return;
        }
        log::warn!("killing pipestance: {message}");
        let _ = self.metadata.write_raw(MetadataFile::KillMarker, message);
        for id in self.frontier() {
            self.nodes.get_mut(id).kill(message);
        }
    }

    /// Reset every failed node back to Waiting.
    pub fn reset(&mut self) -> Result<(), RuntimeError> {
        if self.read_only() {
            return Err(RuntimeError::ReadOnly);
        }
        for id in self.nodes.ids().collect::<Vec<_>>() {
            if self.nodes.get(id).state == MetadataState::Failed {
                self.nodes.get_mut(id).reset()?;
            }
        }
        Ok(())
    }

    /// Reset orphaned Running nodes whose jobs are local (or when the whole
    /// mode is local); cluster orphans are left to the liveness probe.
    pub fn restart_running_nodes(&mut self, job_mode: &str) -> Result<(), RuntimeError> {
        if self.read_only() {
            return Err(RuntimeError::ReadOnly);
        }
        self.load_metadata();
        let local_mode = job_mode == "local";
        for id in self.frontier() {
            let node = self.nodes.get(id);
            if node.state == MetadataState::Running && (local_mode || node.modifiers.local) {
                log::info!("found orphaned stage: {}", node.fq_name);
                self.nodes.get_mut(id).reset()?;
            }
        }
        Ok(())
    }

    /// Requeue locally submitted jobs whose processes are gone.
    pub fn restart_local_jobs(&mut self, rt: &RuntimeContext, job_mode: &str) -> Result<(), RuntimeError> {
        if self.read_only() {
            return Err(RuntimeError::ReadOnly);
        }
        let local_mode = job_mode == "local";
        for id in self.frontier() {
            let node = self.nodes.get(id);
            if node.state != MetadataState::Running || !(local_mode || node.modifiers.local) {
                continue;
            }
            for metadata in node.collect_metadatas() {
                if !matches!(
                    metadata.get_state(),
                    Some(MetadataState::Queued | MetadataState::Running)
                ) {
                    continue;
                }
                if let Some(job_id) = metadata.read_raw(MetadataFile::JobId)
                    && !rt.local_jm.job_alive(&job_id)
                {
                    log::info!(
                        "{}: local job {} is gone; requeueing",
                        metadata.fq_name(),
                        job_id.trim()
                    );
                    metadata.remove(MetadataFile::JobId)?;
                    metadata.remove(MetadataFile::Log)?;
                    metadata.remove(MetadataFile::Heartbeat)?;
                }
            }
        }
        Ok(())
    }

    /// The first failed node's summary.
    #[must_use]
    pub fn get_fatal_error(&self) -> Option<FatalError> {
        self.frontier()
            .into_iter()
            .filter(|id| self.nodes.get(*id).state == MetadataState::Failed)
            .find_map(|id| self.nodes.get(id).get_fatal_error())
    }

    /// Whether every failure is one that a rerun is expected to clear, plus
    /// the first marker line found.
    #[must_use]
    pub fn is_error_transient(&self) -> (bool, String) {
        let mut first_log = String::new();
        for id in self.frontier() {
            let (transient, line) = self.nodes.get(id).is_error_transient();
            if !transient {
                return (false, line);
            }
            if first_log.is_empty() {
                first_log = line;
            }
        }
        (true, first_log)
    }

    /// Every node's entry in the final state digest.
    #[must_use]
    pub fn serialize_state(&self) -> Vec<crate::engine::node::NodeInfo> {
        self.nodes
            .ids()
            .map(|id| self.nodes.get(id).serialize_state())
            .collect()
    }

    /// The performance summary.
    fn serialize_perf(&self) -> Vec<NodePerfInfo> {
        self.nodes
            .ids()
            .map(|id| {
                let node = self.nodes.get(id);
                NodePerfInfo {
                    fqname: node.fq_name.clone(),
                    state: node.state.as_str(),
                    forks: node.stage().map_or(0, |stage| stage.forks.len()),
                    vdr_bytes_reclaimed: node.stage().map_or(0, |stage| stage.vdr_bytes),
                }
            })
            .collect()
    }

    /// Append the end timestamp and immortalize.
    pub fn post_process(&mut self) -> Result<(), RuntimeError> {
        let start = self
            .metadata
            .read_raw(MetadataFile::Timestamp)
            .unwrap_or_default();
        self.metadata.write_raw(
            MetadataFile::Timestamp,
            &format!("{start}\nend: {}", timestamp()),
        )?;
        self.immortalize(false)
    }

    /// Write the performance summary, the final state digest, and the
    /// metadata archive. Each artifact is written at most once.
    pub fn immortalize(&mut self, force: bool) -> Result<(), RuntimeError> {
        if !force && self.read_only() {
            return Err(RuntimeError::ReadOnly);
        }
        self.metadata.clear_read_cache();
        if !self.metadata.exists(MetadataFile::Perf) {
            self.metadata
                .write_json(MetadataFile::Perf, &self.serialize_perf())?;
        }
        if !self.metadata.exists(MetadataFile::FinalState) {
            self.metadata
                .write_json(MetadataFile::FinalState, &self.serialize_state())?;
        }
        if !self.metadata.exists(MetadataFile::MetadataArchive) {
            self.archive_metadata()?;
        }
        Ok(())
    }

    /// Bundle every node's metadata files into one archive, then remove the
    /// originals.
    ///
    /// Runs inside the critical section: signal handlers defer until the
    /// archive is complete so a shutdown cannot leave it half-written.
    fn archive_metadata(&mut self) -> Result<(), RuntimeError> {
        let archive_path = self.metadata.file_path(MetadataFile::MetadataArchive);
        self.critical.set(true);
        let result = (|| -> Result<(), RuntimeError> {
            let mut files: Vec<PathBuf> = Vec::new();
            for id in self.nodes.ids() {
                for metadata in self.nodes.get(id).collect_metadatas() {
                    files.extend(metadata.glob());
                    files.extend(metadata.symlinks());
                }
            }

            let archive_file = std::fs::File::create(&archive_path)?;
            let mut archive = tar::Builder::new(archive_file);
            for file in &files {
                let name = file.strip_prefix(&self.path).unwrap_or(file);
                archive.append_path_with_name(file, name)?;
            }
            archive.finish()?;

            for file in &files {
                if let Err(error) = std::fs::remove_file(file) {
                    log::warn!("failed to remove archived {}: {error}", file.display());
                }
            }
            Ok(())
        })();
        self.critical.set(false);
        if result.is_err() {
            let _ = std::fs::remove_file(&archive_path);
        }
        result
    }

    /// The pipestance UUID, from memory or disk.
    #[must_use]
    pub fn get_uuid(&self) -> Option<uuid::Uuid> {
        if let Some(cached) = self.uuid.get() {
            return Some(cached);
        }
        let parsed = self
            .metadata
            .read_raw(MetadataFile::UuidFile)
            .and_then(|raw| uuid::Uuid::parse_str(raw.trim()).ok());
        self.uuid.set(parsed);
        parsed
    }

    /// Persist the pipestance UUID.
    pub fn set_uuid(&self, uuid: uuid::Uuid) -> Result<(), RuntimeError> {
        self.metadata
            .write_raw(MetadataFile::UuidFile, &uuid.to_string())?;
        self.uuid.set(Some(uuid));
        Ok(())
    }

    /// Advertise the controller's UI port.
    pub fn record_ui_port(&self, url: &str) -> Result<(), RuntimeError> {
        self.metadata.write_raw(MetadataFile::UiPort, url)
    }

    /// Remove the advertised UI port.
    pub fn clear_ui_port(&self) -> Result<(), RuntimeError> {
        self.metadata.remove(MetadataFile::UiPort)
    }
}

/// Fail fast when the pipestance directory is out of disk space.
fn check_minimal_space(path: &Path) -> Result<(), RuntimeError> {
    match nix::sys::statvfs::statvfs(path) {
        Ok(stat) => {
            let available = u64::from(stat.blocks_available()) * stat.fragment_size() as u64;
            if available < MIN_DISK_SPACE_BYTES {
                return Err(RuntimeError::DiskSpace {
                    path: path.to_owned(),
                    available_mb: available / (1024 * 1024),
                    required_mb: MIN_DISK_SPACE_BYTES / (1024 * 1024),
                });
            }
            Ok(())
        }
        Err(error) => {
            log::debug!("statvfs failed for {}: {error}", path.display());
            Ok(())
        }
    }
}

#[cfg(test)]
#[expect(clippy::expect_used, reason = "tests")]
mod tests {
    use std::cell::RefCell;

    use async_trait::async_trait;

    use super::*;
    use crate::engine::job::{JobManagerSettings, JobRequest, JobResources, QueueQuery};
    use crate::engine::{RuntimeConfig, RuntimeContext};
    use crate::mro::ast::{
        BindStm,
        Bindings,
        CallStm,
        Expr,
        LiteralValue,
        Param,
        Params,
        SrcDescriptor,
    };
    use crate::mro::intern::Interner;

    /// What the stub does when a job is handed to it.
    #[derive(Clone, Copy)]
    enum StubBehavior {
        /// Write the canned outputs and complete immediately.
        Succeed,
        /// Split into two chunks, complete chunks and join immediately.
        SplitJoin,
    }

    /// A job manager that runs no processes: it writes canned metadata the
    /// way a finished job would.
    struct StubJobManager {
        settings: JobManagerSettings,
        behavior: StubBehavior,
        outs: serde_json::Value,
        submitted: std::rc::Rc<RefCell<Vec<String>>>,
    }

    impl StubJobManager {
        fn new(behavior: StubBehavior, outs: serde_json::Value) -> Self {
            Self {
                settings: JobManagerSettings::default(),
                behavior,
                outs,
                submitted: std::rc::Rc::new(RefCell::new(Vec::new())),
            }
        }

        fn submissions(&self) -> std::rc::Rc<RefCell<Vec<String>>> {
            std::rc::Rc::clone(&self.submitted)
        }
    }

    #[async_trait(?Send)]
    impl crate::engine::job::JobManager for StubJobManager {
        fn refresh_resources(&mut self) -> Result<(), RuntimeError> {
            Ok(())
        }

        fn settings(&self) -> &JobManagerSettings {
            &self.settings
        }

        fn reserve(&mut self, _resources: &JobResources) -> bool {
            true
        }

        fn release(&mut self, _resources: &JobResources) {}

        fn queue_query(&self) -> Option<QueueQuery> {
            None
        }

        async fn submit(
            &mut self,
            request: &JobRequest,
            metadata: &Metadata,
        ) -> Result<(), RuntimeError> {
            self.submitted.borrow_mut().push(request.fq_name.clone());
            metadata.write_raw(MetadataFile::JobId, "4242")?;
            let phase = request
                .command
                .iter()
                .rev()
                .nth(1)
                .cloned()
                .unwrap_or_default();
            match (self.behavior, phase.as_str()) {
                (StubBehavior::Succeed, _) | (StubBehavior::SplitJoin, "main") => {
                    metadata.write_json(MetadataFile::Outs, &self.outs)?;
                    metadata.write_time(MetadataFile::Complete)?;
                }
                (StubBehavior::SplitJoin, "split") => {
                    metadata.write_raw(
                        MetadataFile::ChunkDefs,
                        r#"[{"args": {"shard": 0}}, {"args": {"shard": 1}}]"#,
                    )?;
                    metadata.write_time(MetadataFile::Complete)?;
                }
                (StubBehavior::SplitJoin, "join") => {
                    let chunk_outs: Vec<serde_json::Value> =
                        metadata.read_json(MetadataFile::ChunkOuts)?;
                    metadata.write_json(
                        MetadataFile::Outs,
                        &serde_json::json!({ "pieces": chunk_outs.len() }),
                    )?;
                    metadata.write_time(MetadataFile::Complete)?;
                }
                (StubBehavior::SplitJoin, other) => {
                    return Err(RuntimeError::internal(format!("unexpected phase {other}")));
                }
            }
            Ok(())
        }

        fn job_alive(&self, _job_id: &str) -> bool {
            false
        }
    }

    fn loc() -> SourceLoc {
        SourceLoc::synthetic()
    }

    fn param(id: &str, ty: &str) -> Param {
        Param {
            id: Arc::from(id),
            ty: crate::mro::ast::TypeName::scalar(Arc::from(ty)),
            loc: loc(),
        }
    }

    fn stage_decl(id: &str, split: bool) -> Stage {
        Stage {
            id: Arc::from(id),
            in_params: Params {
                list: vec![param("value", "int")],
                table: HashMap::new(),
            },
            out_params: Params {
                list: vec![param("result", "string")],
                table: HashMap::new(),
            },
            src: SrcDescriptor {
                lang_tag: Arc::from("exec"),
                lang: None,
                path: "bin/stage".to_owned(),
                args: Vec::new(),
                loc: loc(),
            },
            split,
            resources: None,
            retain: Vec::new(),
            loc: loc(),
        }
    }

    fn bind(id: &str, expr: Expr) -> BindStm {
        BindStm {
            id: Arc::from(id),
            expr,
            tname: None,
            loc: loc(),
        }
    }

    fn literal(value: i64) -> Expr {
        Expr::Literal {
            value: LiteralValue::Int(value),
            loc: loc(),
        }
    }

    fn self_ref(id: &str) -> Expr {
        Expr::Ref(RefExpr {
            kind: RefKind::SelfRef,
            id: Arc::from(id),
            output_id: Arc::from(""),
            loc: loc(),
        })
    }

    fn call_ref(call: &str, output: &str) -> Expr {
        Expr::Ref(RefExpr {
            kind: RefKind::Call,
            id: Arc::from(call),
            output_id: Arc::from(output),
            loc: loc(),
        })
    }

    fn call_stm(id: &str, dec_id: &str, modifiers: Modifiers, bindings: Vec<BindStm>) -> CallStm {
        CallStm {
            id: Arc::from(id),
            dec_id: Arc::from(dec_id),
            modifiers,
            bindings: Bindings {
                list: bindings,
                table: HashMap::new(),
            },
            loc: loc(),
        }
    }

    /// A compiled single-stage pipeline invocation: `PIPE` wraps `STAGE_A`,
    /// invoked with `value = 42`.
    fn single_stage_ast(split: bool, modifiers: Modifiers) -> Ast {
        let mut ast = Ast::default();
        ast.stages.push(stage_decl("STAGE_A", split));
        ast.pipelines.push(Pipeline {
            id: Arc::from("PIPE"),
            in_params: Params {
                list: vec![param("value", "int")],
                table: HashMap::new(),
            },
            out_params: Params {
                list: vec![param("result", "string")],
                table: HashMap::new(),
            },
            calls: vec![call_stm(
                "STAGE_A",
                "STAGE_A",
                modifiers,
                vec![bind("value", self_ref("value"))],
            )],
            call_table: HashMap::new(),
            ret: Bindings {
                list: vec![bind("result", call_ref("STAGE_A", "result"))],
                table: HashMap::new(),
            },
            retain: Vec::new(),
            loc: loc(),
        });
        ast.call = Some(call_stm(
            "PIPE",
            "PIPE",
            Modifiers::default(),
            vec![bind("value", literal(42))],
        ));
        let mut intern = Interner::new();
        crate::mro::check::compile(&mut ast, &mut intern).expect("test ast should compile");
        ast
    }

    fn runtime_with(stub: StubJobManager) -> RuntimeContext {
        RuntimeContext {
            config: RuntimeConfig::default(),
            local_jm: Box::new(stub),
            cluster_jm: None,
        }
    }

    async fn settle(ps: &mut Pipestance, rt: &mut RuntimeContext) -> MetadataState {
        for _ in 0..50 {
            ps.step_nodes(rt).await.expect("step");
            let state = ps.get_state();
            if state.is_terminal() {
                return state;
            }
        }
        panic!("pipestance did not settle, state {:?}", ps.get_state());
    }

    #[test_log::test(tokio::test)]
    async fn single_stage_pipeline_runs_to_complete() {
        let ast = single_stage_ast(false, Modifiers::default());
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ps1");
        let mut ps = Pipestance::new(&ast, "ps1", &path, &[]).expect("construct");
        ps.create_dirs("local", &serde_json::json!({"call": "PIPE"}))
            .expect("create");
        ps.lock().expect("lock");

        let stub = StubJobManager::new(
            StubBehavior::Succeed,
            serde_json::json!({"result": "forty-two"}),
        );
        let mut rt = runtime_with(stub);
        let state = settle(&mut ps, &mut rt).await;
        assert_eq!(state, MetadataState::Complete);

        // The stub's output lands verbatim in the stage fork's outs.
        let outs = std::fs::read_to_string(path.join("PIPE/STAGE_A/fork0/_outs"))
            .expect("stage outs");
        let outs: serde_json::Value = serde_json::from_str(&outs).expect("json");
        assert_eq!(outs, serde_json::json!({"result": "forty-two"}));

        // And the pipeline forwards it through its return binding.
        let pipe_outs = std::fs::read_to_string(path.join("PIPE/_outs")).expect("pipe outs");
        let pipe_outs: serde_json::Value = serde_json::from_str(&pipe_outs).expect("json");
        assert_eq!(pipe_outs["result"], serde_json::json!("forty-two"));

        // The resolved argument record carried the invocation literal.
        let args = std::fs::read_to_string(path.join("PIPE/STAGE_A/fork0/_args"))
            .expect("stage args");
        let args: serde_json::Value = serde_json::from_str(&args).expect("json");
        assert_eq!(args, serde_json::json!({"value": 42}));
        ps.unlock();
    }

    #[test_log::test(tokio::test)]
    async fn chunked_stage_runs_split_chunks_and_join() {
        let ast = single_stage_ast(true, Modifiers::default());
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ps4");
        let mut ps = Pipestance::new(&ast, "ps4", &path, &[]).expect("construct");
        ps.create_dirs("local", &serde_json::json!({"call": "PIPE"}))
            .expect("create");
        ps.lock().expect("lock");

        let stub = StubJobManager::new(
            StubBehavior::SplitJoin,
            serde_json::json!({"result": "chunk"}),
        );
        let submissions = stub.submissions();
        let mut rt = runtime_with(stub);
        let state = settle(&mut ps, &mut rt).await;
        assert_eq!(state, MetadataState::Complete);

        // split, two chunks, join.
        let submitted = submissions.borrow();
        let splits = submitted.iter().filter(|fq| fq.ends_with(".split")).count();
        let joins = submitted.iter().filter(|fq| fq.ends_with(".join")).count();
        let chunks = submitted.iter().filter(|fq| fq.contains(".chnk")).count();
        assert_eq!((splits, chunks, joins), (1, 2, 1), "{submitted:?}");

        let outs = std::fs::read_to_string(path.join("PIPE/STAGE_A/fork0/_outs"))
            .expect("fork outs");
        let outs: serde_json::Value = serde_json::from_str(&outs).expect("json");
        assert_eq!(outs, serde_json::json!({"pieces": 2}));

        // Chunk argument records overlay the chunk definition on the fork
        // arguments.
        let chunk_args = std::fs::read_to_string(path.join("PIPE/STAGE_A/fork0/chnk1/_args"))
            .expect("chunk args");
        let chunk_args: serde_json::Value = serde_json::from_str(&chunk_args).expect("json");
        assert_eq!(chunk_args, serde_json::json!({"value": 42, "shard": 1}));
        ps.unlock();
    }

    #[test_log::test(tokio::test)]
    async fn orphaned_running_node_is_reset_and_rerun() {
        let ast = single_stage_ast(false, Modifiers::default());
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ps5");
        {
            let ps = Pipestance::new(&ast, "ps5", &path, &[]).expect("construct");
            ps.create_dirs("local", &serde_json::json!({"call": "PIPE"}))
                .expect("create");
            // Fake an orphaned run: job id recorded and log written, but no
            // live process behind them.
            let fork = Metadata::new("ID.ps5.PIPE.STAGE_A.fork0", path.join("PIPE/STAGE_A/fork0"));
            fork.make_dirs().expect("mkdirs");
            fork.write_raw(MetadataFile::JobId, "999999").expect("write");
            fork.write_raw(MetadataFile::Log, "started").expect("write");
        }

        let mut ps = Pipestance::new(&ast, "ps5", &path, &[]).expect("reattach construct");
        ps.verify_job_mode("local").expect("job mode matches");
        ps.lock().expect("lock");
        ps.load_metadata();
        assert_eq!(ps.get_state(), MetadataState::Running);

        ps.restart_running_nodes("local").expect("restart");
        assert_eq!(ps.get_state(), MetadataState::ForkWaiting);

        let stub = StubJobManager::new(
            StubBehavior::Succeed,
            serde_json::json!({"result": "recovered"}),
        );
        let mut rt = runtime_with(stub);
        let state = settle(&mut ps, &mut rt).await;
        assert_eq!(state, MetadataState::Complete);
        ps.unlock();
    }

    #[test_log::test(tokio::test)]
    async fn reattach_to_complete_pipestance_issues_no_jobs() {
        let ast = single_stage_ast(false, Modifiers::default());
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ps8");
        {
            let mut ps = Pipestance::new(&ast, "ps8", &path, &[]).expect("construct");
            ps.create_dirs("local", &serde_json::json!({"call": "PIPE"}))
                .expect("create");
            ps.lock().expect("lock");
            let stub =
                StubJobManager::new(StubBehavior::Succeed, serde_json::json!({"result": "x"}));
            let mut rt = runtime_with(stub);
            assert_eq!(settle(&mut ps, &mut rt).await, MetadataState::Complete);
            ps.unlock();
        }

        let mut ps = Pipestance::new(&ast, "ps8", &path, &[]).expect("reattach construct");
        ps.verify_job_mode("local").expect("job mode matches");
        ps.lock().expect("lock");
        ps.load_metadata();
        assert_eq!(ps.get_state(), MetadataState::Complete);

        let stub = StubJobManager::new(StubBehavior::Succeed, serde_json::json!({}));
        let submissions = stub.submissions();
        let mut rt = runtime_with(stub);
        ps.step_nodes(&mut rt).await.expect("step");
        assert_eq!(ps.get_state(), MetadataState::Complete);
        assert!(submissions.borrow().is_empty(), "no new jobs on reattach");
        ps.unlock();
    }

    #[test_log::test(tokio::test)]
    async fn failure_classification_spots_transient_errors() {
        let ast = single_stage_ast(false, Modifiers::default());
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ps6");
        let mut ps = Pipestance::new(&ast, "ps6", &path, &[]).expect("construct");
        ps.create_dirs("local", &serde_json::json!({"call": "PIPE"}))
            .expect("create");
        ps.lock().expect("lock");

        let fork = Metadata::new("ID.ps6.PIPE.STAGE_A.fork0", path.join("PIPE/STAGE_A/fork0"));
        fork.make_dirs().expect("mkdirs");
        fork.write_raw(
            MetadataFile::Errors,
            "stage log tail\nOut of memory: killed process 1234\n",
        )
        .expect("write");

        ps.load_metadata();
        assert_eq!(ps.get_state(), MetadataState::Failed);
        let (transient, line) = ps.is_error_transient();
        assert!(transient);
        assert_eq!(line, "Out of memory: killed process 1234");

        let fatal = ps.get_fatal_error().expect("fatal error");
        assert_eq!(fatal.fq_name, "ID.ps6.PIPE.STAGE_A");
        assert_eq!(fatal.summary, "stage log tail");
        assert!(fatal.paths[0].ends_with("_errors"));
        ps.unlock();
    }

    #[test_log::test]
    fn lock_exclusion_admits_exactly_one_controller() {
        let ast = single_stage_ast(false, Modifiers::default());
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ps7");
        let first = Pipestance::new(&ast, "ps7", &path, &[]).expect("construct");
        let second = Pipestance::new(&ast, "ps7", &path, &[]).expect("construct");

        first.lock().expect("first lock wins");
        let loser = second.lock();
        assert!(matches!(loser, Err(RuntimeError::PipestanceLocked { .. })));
        assert!(second.read_only());

        first.unlock();
        second.lock().expect("lock is free again");
        second.unlock();
    }

    #[test_log::test(tokio::test)]
    async fn immortalize_writes_each_artifact_at_most_once() {
        let ast = single_stage_ast(false, Modifiers::default());
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ps9");
        let mut ps = Pipestance::new(&ast, "ps9", &path, &[]).expect("construct");
        ps.create_dirs("local", &serde_json::json!({"call": "PIPE"}))
            .expect("create");
        ps.lock().expect("lock");
        let stub = StubJobManager::new(StubBehavior::Succeed, serde_json::json!({"result": "x"}));
        let mut rt = runtime_with(stub);
        assert_eq!(settle(&mut ps, &mut rt).await, MetadataState::Complete);

        ps.immortalize(false).expect("first immortalize");
        let perf_path = path.join("_perf");
        let archive_path = path.join("_metadata.tar");
        assert!(perf_path.exists());
        assert!(path.join("_finalstate").exists());
        assert!(archive_path.exists());
        // Archived originals are gone.
        assert!(!path.join("PIPE/STAGE_A/fork0/_outs").exists());

        let perf_before = std::fs::read_to_string(&perf_path).expect("perf");
        let archive_len = std::fs::metadata(&archive_path).expect("archive").len();
        ps.immortalize(false).expect("second immortalize");
        assert_eq!(
            std::fs::read_to_string(&perf_path).expect("perf"),
            perf_before
        );
        assert_eq!(
            std::fs::metadata(&archive_path).expect("archive").len(),
            archive_len
        );
        ps.unlock();
    }

    #[test_log::test(tokio::test)]
    async fn disabled_calls_disable_the_pipestance() {
        let modifiers = Modifiers {
            disabled: true,
            ..Modifiers::default()
        };
        let ast = single_stage_ast(false, modifiers);
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ps10");
        let mut ps = Pipestance::new(&ast, "ps10", &path, &[]).expect("construct");
        ps.create_dirs("local", &serde_json::json!({"call": "PIPE"}))
            .expect("create");
        ps.lock().expect("lock");
        let stub = StubJobManager::new(StubBehavior::Succeed, serde_json::json!({}));
        let submissions = stub.submissions();
        let mut rt = runtime_with(stub);
        ps.step_nodes(&mut rt).await.expect("step");
        assert_eq!(ps.get_state(), MetadataState::DisabledState);
        assert!(submissions.borrow().is_empty());
        ps.unlock();
    }

    #[test_log::test]
    fn preflight_calls_gate_their_siblings() {
        let mut ast = Ast::default();
        ast.stages.push(stage_decl("CHECK", false));
        ast.stages.push(stage_decl("WORK", false));
        ast.pipelines.push(Pipeline {
            id: Arc::from("PIPE"),
            in_params: Params::default(),
            out_params: Params {
                list: vec![param("result", "string")],
                table: HashMap::new(),
            },
            calls: vec![
                call_stm(
                    "CHECK",
                    "CHECK",
                    Modifiers {
                        preflight: true,
                        ..Modifiers::default()
                    },
                    vec![bind("value", literal(1))],
                ),
                call_stm("WORK", "WORK", Modifiers::default(), vec![bind("value", literal(2))]),
            ],
            call_table: HashMap::new(),
            ret: Bindings {
                list: vec![bind("result", call_ref("WORK", "result"))],
                table: HashMap::new(),
            },
            retain: Vec::new(),
            loc: loc(),
        });
        ast.call = Some(call_stm("PIPE", "PIPE", Modifiers::default(), Vec::new()));
        let mut intern = Interner::new();
        crate::mro::check::compile(&mut ast, &mut intern).expect("compile");

        let dir = tempfile::tempdir().expect("tempdir");
        let ps = Pipestance::new(&ast, "ps11", &dir.path().join("ps11"), &[]).expect("construct");
        // WORK must wait for CHECK even though no data flows between them.
        let work = ps
            .nodes
            .ids()
            .find(|id| ps.nodes.get(*id).fq_name.ends_with(".WORK"))
            .expect("WORK node");
        let check = ps
            .nodes
            .ids()
            .find(|id| ps.nodes.get(*id).fq_name.ends_with(".CHECK"))
            .expect("CHECK node");
        assert!(ps.nodes.get(work).prenodes.contains(&check));
        assert!(ps.nodes.get(check).postnodes.contains(&work));
    }

    #[test_log::test]
    fn queue_probe_gate_rate_limits_and_serializes() {
        let probe = Mutex::new(ProbeState::default());
        let now = Instant::now();
        assert!(probe_gate(&probe, now, QUEUE_CHECK_LIMIT));
        // At most one probe in flight.
        assert!(!probe_gate(&probe, now, QUEUE_CHECK_LIMIT));
        probe_done(&probe, now);
        // Still inside the rate-limit window.
        assert!(!probe_gate(&probe, now, QUEUE_CHECK_LIMIT));
        // Outside the window the next probe may start.
        assert!(probe_gate(&probe, now, Duration::ZERO));
    }

    #[test_log::test(tokio::test)]
    async fn sweeps_fork_the_stage_and_line_up_arguments() {
        let mut ast = single_stage_ast(false, Modifiers::default());
        // Replace the invocation binding with a sweep over three values.
        ast.pipelines[0].calls[0].bindings.list[0] = bind(
            "value",
            Expr::Sweep {
                values: vec![literal(1), literal(2), literal(3)],
                loc: loc(),
            },
        );
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ps12");
        let mut ps = Pipestance::new(&ast, "ps12", &path, &[]).expect("construct");
        ps.create_dirs("local", &serde_json::json!({"call": "PIPE"}))
            .expect("create");
        ps.lock().expect("lock");
        let stub = StubJobManager::new(StubBehavior::Succeed, serde_json::json!({"result": "s"}));
        let mut rt = runtime_with(stub);
        assert_eq!(settle(&mut ps, &mut rt).await, MetadataState::Complete);

        for (fork, expected) in [(0, 1), (1, 2), (2, 3)] {
            let args = std::fs::read_to_string(
                path.join(format!("PIPE/STAGE_A/fork{fork}/_args")),
            )
            .expect("fork args");
            let args: serde_json::Value = serde_json::from_str(&args).expect("json");
            assert_eq!(args, serde_json::json!({"value": expected}), "fork {fork}");
        }
        ps.unlock();
    }
}
