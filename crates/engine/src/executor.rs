//! Process execution engine.
//!
//! `ProcessExecutor` is the central orchestrator:
//! 1. Validates the graph and builds an [`ExecutionPlan`].
//! 2. Drives each scope (the top level, then every branch region) by
//!    dispatching nodes whose predecessors have all settled, concurrently
//!    up to `max_concurrent_nodes`.
//! 3. Routes through conditional ports and branch strategies, skipping nodes
//!    left without an active incoming edge.
//! 4. Seals the run into an [`ExecutionRun`], appends it to history and
//!    applies output bindings.
//!
//! Each dispatched node reads a fork of its scope's context; its writes are
//! applied to the scope when it settles. Branch regions run on their own
//! forks, which are merged back (or discarded) by the branch strategy.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use nodes::{
    BranchConfig, BranchStrategy, ExecutionContext, NodeConfig, NodeContext, NodeError, NodeOutput,
    NodeRegistry,
};

use crate::binding::{
    BindingConfig, BindingFailure, BindingReport, BindingStore, OutputBindingResolver,
};
use crate::dag::{validate_dag, ExecutionPlan, RegionId};
use crate::error::BindingError;
use crate::history::RunHistory;
use crate::models::{ExecutionRun, NodeResult, NodeStatus, Process, RunStatus};
use crate::EngineError;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Where run history is kept.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum HistoryBackend {
    #[default]
    Memory,
    Sqlite { url: String },
}

/// Tuning knobs for the engine, loadable from TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Nodes a single scope keeps in flight at once.
    pub max_concurrent_nodes: usize,
    /// Per-request timeout of the HTTP transport.
    pub http_timeout_ms: u64,
    pub history: HistoryBackend,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_nodes: 16,
            http_timeout_ms: 30_000,
            history: HistoryBackend::Memory,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }
}

/// Names the stored configuration in a [`BindingReport`] when it cannot be
/// loaded.
pub const STORED_BINDINGS: &str = "binding_config";

// ---------------------------------------------------------------------------
// Output of a completed execution
// ---------------------------------------------------------------------------

/// A sealed run plus what the binding resolver did with it.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run: ExecutionRun,
    pub bindings: BindingReport,
}

/// A run started in the background.
#[derive(Debug)]
pub struct RunHandle {
    run_id: Uuid,
    cancel: CancellationToken,
    task: JoinHandle<Result<RunOutcome, EngineError>>,
}

impl RunHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Request cancellation. Idempotent; a no-op once the run has settled.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A clone of the run's token, for cancelling from elsewhere.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the run to settle.
    pub async fn wait(self) -> Result<RunOutcome, EngineError> {
        self.task
            .await
            .map_err(|e| EngineError::Aborted(e.to_string()))?
    }
}

// ---------------------------------------------------------------------------
// ProcessExecutor
// ---------------------------------------------------------------------------

/// Orchestrator that runs processes against a node registry.
///
/// Holds no per-run state: every call to [`ProcessExecutor::run`] owns its
/// own context and node results, so concurrent runs never share mutable
/// state.
pub struct ProcessExecutor {
    registry: NodeRegistry,
    config: EngineConfig,
    history: Option<RunHistory>,
    resolver: Option<OutputBindingResolver>,
    binding_store: Option<BindingStore>,
}

impl ProcessExecutor {
    pub fn new(registry: NodeRegistry, config: EngineConfig) -> Self {
        Self {
            registry,
            config,
            history: None,
            resolver: None,
            binding_store: None,
        }
    }

    /// Append every sealed run to `history`.
    pub fn with_history(mut self, history: RunHistory) -> Self {
        self.history = Some(history);
        self
    }

    /// Apply output bindings after each completed run.
    pub fn with_bindings(mut self, resolver: OutputBindingResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Merge stored binding configurations with the process's inline ones.
    pub fn with_binding_store(mut self, store: BindingStore) -> Self {
        self.binding_store = Some(store);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validate a process against the graph rules and the registry.
    pub fn prepare(&self, process: &Process) -> Result<ExecutionPlan, EngineError> {
        let plan = validate_dag(process)?;
        for node in &process.nodes {
            let kind = node.kind();
            if !matches!(node.config, NodeConfig::Branch(_)) && !self.registry.contains(kind) {
                return Err(EngineError::MissingExecutor {
                    node_id: node.id.clone(),
                    kind,
                });
            }
        }
        Ok(plan)
    }

    /// Run the process to completion.
    ///
    /// # Errors
    /// Returns `EngineError` for graph validation failures and persistence
    /// problems. Node failures are recorded on the returned run instead.
    pub async fn run(
        &self,
        process: &Process,
        inputs: ExecutionContext,
    ) -> Result<RunOutcome, EngineError> {
        let plan = self.prepare(process)?;
        self.execute(process, &plan, inputs, Uuid::new_v4(), CancellationToken::new())
            .await
    }

    /// Validate, then run the process on a background task.
    pub fn start(
        self: &Arc<Self>,
        process: Arc<Process>,
        inputs: ExecutionContext,
    ) -> Result<RunHandle, EngineError> {
        let plan = self.prepare(&process)?;
        let run_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let executor = Arc::clone(self);
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            executor
                .execute(&process, &plan, inputs, run_id, token)
                .await
        });
        Ok(RunHandle {
            run_id,
            cancel,
            task,
        })
    }

    #[instrument(skip_all, fields(process_id = %process.id, run_id = %run_id))]
    async fn execute(
        &self,
        process: &Process,
        plan: &ExecutionPlan,
        inputs: ExecutionContext,
        run_id: Uuid,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, EngineError> {
        info!(nodes = plan.len(), order = ?plan.order(), "process validated, starting run");
        let started_at = Utc::now();

        let run = Run {
            process,
            plan,
            registry: &self.registry,
            limit: self.config.max_concurrent_nodes.max(1),
            run_id,
            cancel,
            state: Mutex::new(RunState::new(plan.len())),
        };
        let (end, context) = run.drive(None, inputs).await;

        let status = {
            let mut state = run.state();
            for node in 0..plan.len() {
                if !state.status[node].is_terminal() {
                    state.settle(node, NodeStatus::Skipped, None, None, Vec::new(), 0);
                }
            }
            if end == ScopeEnd::Cancelled {
                RunStatus::Cancelled
            } else if state.status.contains(&NodeStatus::Failed) {
                RunStatus::Failed
            } else {
                RunStatus::Completed
            }
        };

        let sealed = ExecutionRun {
            run_id,
            process_id: process.id.clone(),
            status,
            started_at,
            finished_at: Utc::now(),
            nodes: run.results(),
            context: context.snapshot(),
        };
        match sealed.first_failure() {
            Some(failed) => error!(
                %status,
                node_id = %failed.node_id,
                error = failed.error.as_deref().unwrap_or_default(),
                "run finished with failures"
            ),
            None => info!(%status, duration_ms = sealed.duration_ms(), "run finished"),
        }

        if let Some(history) = &self.history {
            history.record(&sealed).await?;
        }

        let bindings = match (&self.resolver, status) {
            (Some(resolver), RunStatus::Completed) => {
                let mut config = BindingConfig::from_process(process);
                let mut unavailable = None;
                if let Some(store) = &self.binding_store {
                    match store.load(&process.id).await {
                        Ok(stored) => config.extend(stored),
                        Err(e) => {
                            warn!(error = %e, "stored binding configuration unavailable");
                            unavailable = Some(BindingFailure {
                                binding: STORED_BINDINGS.to_string(),
                                error: BindingError::Config(e.to_string()),
                            });
                        }
                    }
                }
                let mut report = resolver
                    .resolve(&process.id, &config, &process.kpi_bindings, &sealed.context)
                    .await;
                report.failures.splice(0..0, unavailable);
                report
            }
            _ => BindingReport::default(),
        };

        Ok(RunOutcome {
            run: sealed,
            bindings,
        })
    }
}

// ---------------------------------------------------------------------------
// Per-run state
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct RunState {
    status: Vec<NodeStatus>,
    output: Vec<Option<Value>>,
    error: Vec<Option<String>>,
    /// Ports a completed node routes through.
    ports: Vec<Vec<String>>,
    duration_ms: Vec<u64>,
    /// Node indices in the order they settled.
    settled: Vec<usize>,
}

impl RunState {
    fn new(len: usize) -> Self {
        Self {
            status: vec![NodeStatus::Pending; len],
            output: vec![None; len],
            error: vec![None; len],
            ports: vec![Vec::new(); len],
            duration_ms: vec![0; len],
            settled: Vec::new(),
        }
    }

    /// Move a node to a terminal status. A node settles once.
    fn settle(
        &mut self,
        node: usize,
        status: NodeStatus,
        output: Option<Value>,
        error: Option<String>,
        ports: Vec<String>,
        duration_ms: u64,
    ) -> bool {
        if self.status[node].is_terminal() {
            return false;
        }
        self.status[node] = status;
        self.output[node] = output;
        self.error[node] = error;
        self.ports[node] = ports;
        self.duration_ms[node] = duration_ms;
        self.settled.push(node);
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopeEnd {
    Settled,
    Cancelled,
}

enum Readiness {
    Waiting,
    Ready,
    Skip,
}

enum Settled {
    Node(NodeOutput),
    Branch { value: Value, ports: Vec<String> },
}

struct Finished {
    node: usize,
    elapsed: Duration,
    /// The fork the node ran on; carries a branch's merged writes.
    context: ExecutionContext,
    result: Result<Settled, NodeError>,
}

/// Outcome label of one branch region.
fn region_label(status: Option<NodeStatus>) -> &'static str {
    match status {
        Some(NodeStatus::Completed) => "completed",
        Some(NodeStatus::Failed) => "failed",
        _ => "skipped",
    }
}

struct Run<'r> {
    process: &'r Process,
    plan: &'r ExecutionPlan,
    registry: &'r NodeRegistry,
    limit: usize,
    run_id: Uuid,
    cancel: CancellationToken,
    state: Mutex<RunState>,
}

impl<'r> Run<'r> {
    fn state(&self) -> MutexGuard<'_, RunState> {
        // Never held across an await; poisoning only follows a panic.
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn results(&self) -> Vec<NodeResult> {
        let state = self.state();
        state
            .settled
            .iter()
            .map(|&n| NodeResult {
                node_id: self.plan.id(n).to_string(),
                kind: self.process.nodes[n].kind(),
                status: state.status[n],
                output: state.output[n].clone(),
                error: state.error[n].clone(),
                duration_ms: state.duration_ms[n],
            })
            .collect()
    }

    /// Skip a node; a skipped branch node takes its regions with it.
    fn skip(&self, node: usize, reason: &str) {
        if !self.state().settle(node, NodeStatus::Skipped, None, None, Vec::new(), 0) {
            return;
        }
        debug!(node_id = self.plan.id(node), reason, "node skipped");
        for index in 0..self.plan.regions(node).len() {
            self.skip_region((node, index), reason);
        }
    }

    /// Skip every member of a region that has not settled yet.
    fn skip_region(&self, region: RegionId, reason: &str) {
        let (branch, index) = region;
        for &member in &self.plan.regions(branch)[index].members {
            self.skip(member, reason);
        }
    }

    /// `completed` unless some member of the region failed.
    fn region_status(&self, region: RegionId) -> NodeStatus {
        let (branch, index) = region;
        let state = self.state();
        let failed = self.plan.regions(branch)[index]
            .members
            .iter()
            .any(|&m| state.status[m] == NodeStatus::Failed);
        if failed {
            NodeStatus::Failed
        } else {
            NodeStatus::Completed
        }
    }

    fn readiness(&self, node: usize, root: Option<usize>) -> Readiness {
        let incoming = self.plan.incoming(node);
        if incoming.is_empty() {
            return Readiness::Ready;
        }
        let state = self.state();
        let mut active = false;
        for &e in incoming {
            let edge = self.plan.edge(e);
            // The branch node driving this region has already routed here.
            if Some(edge.source) == root {
                active = true;
                continue;
            }
            match state.status[edge.source] {
                NodeStatus::Pending | NodeStatus::Running => return Readiness::Waiting,
                NodeStatus::Completed => {
                    let routed = match &edge.port {
                        None => true,
                        Some(port) => state.ports[edge.source].contains(port),
                    };
                    active |= routed;
                }
                NodeStatus::Failed | NodeStatus::Skipped => {}
            }
        }
        if active {
            Readiness::Ready
        } else {
            Readiness::Skip
        }
    }

    /// Drive one scope until every node in it has settled or the run is
    /// cancelled. Returns the scope's context with all settled writes.
    fn drive(
        &'r self,
        region: Option<RegionId>,
        mut context: ExecutionContext,
    ) -> BoxFuture<'r, (ScopeEnd, ExecutionContext)> {
        Box::pin(async move {
            let root = region.map(|(branch, _)| branch);
            let mut pending = self.plan.scope(region);
            let mut in_flight = FuturesUnordered::new();

            loop {
                if self.cancel.is_cancelled() {
                    return (ScopeEnd::Cancelled, context);
                }

                // Pending is in topological order, so a skip is seen by
                // later nodes within the same pass.
                let mut i = 0;
                while i < pending.len() {
                    let node = pending[i];
                    match self.readiness(node, root) {
                        Readiness::Waiting => i += 1,
                        Readiness::Skip => {
                            pending.remove(i);
                            self.skip(node, "no active incoming edge");
                        }
                        Readiness::Ready => {
                            if in_flight.len() >= self.limit {
                                break;
                            }
                            pending.remove(i);
                            self.state().status[node] = NodeStatus::Running;
                            debug!(node_id = self.plan.id(node), "node running");
                            in_flight.push(self.dispatch(node, context.fork()));
                        }
                    }
                }

                if in_flight.is_empty() {
                    for node in pending {
                        self.skip(node, "unreachable");
                    }
                    return (ScopeEnd::Settled, context);
                }

                let finished = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return (ScopeEnd::Cancelled, context),
                    Some(finished) = in_flight.next() => finished,
                };
                self.settle(finished, &mut context);
                if region.is_none() {
                    context.commit();
                }
            }
        })
    }

    fn settle(&self, finished: Finished, context: &mut ExecutionContext) {
        let Finished {
            node,
            elapsed,
            context: fork,
            result,
        } = finished;
        let node_id = self.plan.id(node);
        let duration_ms = elapsed.as_millis() as u64;

        let applied = match result {
            Ok(Settled::Node(output)) => context
                .apply_all(node_id, &output.writes)
                .map(|()| (output.value, output.port.into_iter().collect()))
                .map_err(NodeError::from),
            Ok(Settled::Branch { value, ports }) => context
                .merge(fork)
                .map(|()| (value, ports))
                .map_err(|e| NodeError::Branch(format!("merging branch writes: {e}"))),
            Err(e) => Err(e),
        };

        let mut state = self.state();
        match applied {
            Ok((value, ports)) => {
                state.settle(node, NodeStatus::Completed, Some(value), None, ports, duration_ms);
                drop(state);
                info!(node_id, duration_ms, "node completed");
            }
            Err(NodeError::Cancelled) => {
                state.settle(node, NodeStatus::Skipped, None, None, Vec::new(), duration_ms);
                drop(state);
                debug!(node_id, "node cancelled");
            }
            Err(e) => {
                let message = e.to_string();
                state.settle(node, NodeStatus::Failed, None, Some(message.clone()), Vec::new(), duration_ms);
                drop(state);
                error!(node_id, duration_ms, error = %message, "node failed");
            }
        }
    }

    fn dispatch(&'r self, node: usize, fork: ExecutionContext) -> BoxFuture<'r, Finished> {
        Box::pin(async move {
            let started = Instant::now();
            let definition = &self.process.nodes[node];
            let (result, context) = match &definition.config {
                NodeConfig::Branch(cfg) => self.run_branch(node, cfg, fork).await,
                config => {
                    let result = match self.registry.get(config.kind()) {
                        Some(executor) => {
                            let ctx = NodeContext {
                                process_id: &self.process.id,
                                run_id: self.run_id,
                                node_id: &definition.id,
                                variables: &fork,
                                cancel: &self.cancel,
                            };
                            executor.execute(config, &ctx).await.map(Settled::Node)
                        }
                        None => Err(NodeError::config(format!(
                            "no executor registered for '{}'",
                            config.kind()
                        ))),
                    };
                    (result, fork)
                }
            };
            Finished {
                node,
                elapsed: started.elapsed(),
                context,
                result,
            }
        })
    }

    // -----------------------------------------------------------------------
    // Branch strategies
    // -----------------------------------------------------------------------

    async fn run_branch(
        &'r self,
        node: usize,
        cfg: &BranchConfig,
        mut context: ExecutionContext,
    ) -> (Result<Settled, NodeError>, ExecutionContext) {
        let node_id = self.plan.id(node);
        let regions = self.plan.regions(node);

        // Guards run in declared order; prioridad stops at the first open
        // branch, so later guards are never evaluated.
        let mut eligible = vec![false; regions.len()];
        for (i, spec) in cfg.branches.iter().enumerate() {
            let open = match &spec.guard {
                None => Ok(true),
                Some(guard) => guard.evaluate(&context),
            };
            match open {
                Ok(true) => {
                    eligible[i] = true;
                    if cfg.strategy == BranchStrategy::Prioridad {
                        break;
                    }
                }
                Ok(false) => debug!(node_id, branch = %spec.id, "branch guard false"),
                Err(e) => {
                    for j in 0..regions.len() {
                        self.skip_region((node, j), "branch guard failed");
                    }
                    let message = format!("guard of branch '{}': {e}", spec.id);
                    return (Err(NodeError::Branch(message)), context);
                }
            }
        }
        for (i, open) in eligible.iter().enumerate() {
            if !open {
                self.skip_region((node, i), "branch not selected");
            }
        }
        let chosen: Vec<usize> = (0..regions.len()).filter(|&i| eligible[i]).collect();
        info!(node_id, strategy = ?cfg.strategy, branches = ?chosen, "branch node routing");

        // Nothing open: the branch node completes with an empty result
        // whatever the strategy.
        if chosen.is_empty() {
            return (
                Ok(Settled::Branch {
                    value: Value::Object(Map::new()),
                    ports: Vec::new(),
                }),
                context,
            );
        }

        let mut outcome: Vec<Option<NodeStatus>> = vec![None; regions.len()];
        let result = match cfg.strategy {
            BranchStrategy::Secuencial | BranchStrategy::Prioridad => {
                self.run_in_order(node, &chosen, &mut context, &mut outcome).await
            }
            BranchStrategy::Paralela => {
                self.run_together(node, &chosen, &mut context, &mut outcome).await
            }
            BranchStrategy::Race => self.run_race(node, &chosen, &mut context, &mut outcome).await,
        };
        if let Err(e) = result {
            for i in 0..regions.len() {
                self.skip_region((node, i), "branch node did not settle");
            }
            return (Err(e), context);
        }

        let mut outcomes = Map::new();
        let mut ports = Vec::new();
        for (region, status) in regions.iter().zip(&outcome) {
            if *status == Some(NodeStatus::Completed) {
                ports.push(region.branch_id.clone());
            }
            outcomes.insert(region.branch_id.clone(), json!(region_label(*status)));
        }
        let mut value = json!({ "strategy": cfg.strategy, "outcomes": outcomes });
        match cfg.strategy {
            BranchStrategy::Race => value["winner"] = json!(ports.first()),
            BranchStrategy::Prioridad => value["selected"] = json!(regions[chosen[0]].branch_id),
            _ => {}
        }
        (Ok(Settled::Branch { value, ports }), context)
    }

    /// Secuencial and prioridad: each branch starts after the previous one
    /// settled and sees its writes.
    async fn run_in_order(
        &'r self,
        node: usize,
        chosen: &[usize],
        context: &mut ExecutionContext,
        outcome: &mut [Option<NodeStatus>],
    ) -> Result<(), NodeError> {
        for &i in chosen {
            let (end, child) = self.drive(Some((node, i)), context.fork()).await;
            if end == ScopeEnd::Cancelled {
                return Err(NodeError::Cancelled);
            }
            context
                .merge(child)
                .map_err(|e| NodeError::Branch(format!("merging branch writes: {e}")))?;
            outcome[i] = Some(self.region_status((node, i)));
        }
        Ok(())
    }

    /// Paralela: all branches run at once; writes merge in declared order.
    async fn run_together(
        &'r self,
        node: usize,
        chosen: &[usize],
        context: &mut ExecutionContext,
        outcome: &mut [Option<NodeStatus>],
    ) -> Result<(), NodeError> {
        let mut running: FuturesUnordered<_> = chosen
            .iter()
            .map(|&i| {
                let fork = context.fork();
                async move { (i, self.drive(Some((node, i)), fork).await) }
            })
            .collect();

        let mut children: Vec<Option<ExecutionContext>> = vec![None; outcome.len()];
        while let Some((i, (end, child))) = running.next().await {
            if end == ScopeEnd::Cancelled {
                return Err(NodeError::Cancelled);
            }
            outcome[i] = Some(self.region_status((node, i)));
            children[i] = Some(child);
        }
        for child in children.into_iter().flatten() {
            context
                .merge(child)
                .map_err(|e| NodeError::Branch(format!("merging branch writes: {e}")))?;
        }
        Ok(())
    }

    /// Race: the first branch to settle without failures wins. Losers still
    /// in flight are dropped, their unsettled nodes skipped and their writes
    /// discarded.
    async fn run_race(
        &'r self,
        node: usize,
        chosen: &[usize],
        context: &mut ExecutionContext,
        outcome: &mut [Option<NodeStatus>],
    ) -> Result<(), NodeError> {
        let mut running: FuturesUnordered<_> = chosen
            .iter()
            .map(|&i| {
                let fork = context.fork();
                async move { (i, self.drive(Some((node, i)), fork).await) }
            })
            .collect();

        let mut winner = None;
        while let Some((i, (end, child))) = running.next().await {
            if end == ScopeEnd::Cancelled {
                return Err(NodeError::Cancelled);
            }
            let status = self.region_status((node, i));
            outcome[i] = Some(status);
            if status == NodeStatus::Completed {
                winner = Some((i, child));
                break;
            }
        }
        drop(running);

        let Some((won, child)) = winner else {
            return Err(NodeError::Branch("no branch completed".into()));
        };
        for &i in chosen {
            if i != won && outcome[i].is_none() {
                self.skip_region((node, i), "lost the race");
            }
        }
        info!(node_id = self.plan.id(node), winner = won, "race settled");
        context
            .merge(child)
            .map_err(|e| NodeError::Branch(format!("merging branch writes: {e}")))
    }
}
