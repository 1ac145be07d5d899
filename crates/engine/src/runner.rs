//! Flow Runner: owns loaded flow graphs and drives them node by node.
//!
//! Per flow instance: `Idle -> Running -> {Completed, Error}`.  Nodes run
//! synchronously on the caller's thread until one needs a countdown; that
//! node is *parked* and the flow resumes from whichever of the timer expiry
//! or [`FlowRunner::override_action`] claims it first.
//!
//! Everything that drives a flow (start, override, stop, reload, resume)
//! holds that flow's gate, a re-entrant lock, so two threads never step the
//! same flow at once while a listener on the driving thread may still call
//! back into the runner.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bus::EventBus;
use chrono::Utc;
use nodes::{FlowContext, FlowFailure, Node, NodeExecutor};
use parking_lot::{Mutex, ReentrantMutex};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use timer::TimerManager;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::condition::EdgeCondition;
use crate::context::{ContextManager, ContextPatch};
use crate::dag;
use crate::error::EngineError;
use crate::models::FlowSpec;
use crate::timer_integration::{CompletionCallback, FlowTimerIntegration};

// ---------------------------------------------------------------------------
// Configuration and state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// `aiButlerEnabled` of freshly created contexts.
    pub ai_butler_default: bool,
    /// Maximum node executions per start or resume before the flow errors.
    pub max_steps: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            ai_butler_default: true,
            max_steps: 10_000,
        }
    }
}

/// Derived status of a flow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowState {
    Idle,
    Running,
    Completed,
    Error,
}

impl FlowState {
    pub fn as_str(self) -> &'static str {
        match self {
            FlowState::Idle => "idle",
            FlowState::Running => "running",
            FlowState::Completed => "completed",
            FlowState::Error => "error",
        }
    }
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
struct CompiledEdge {
    from: String,
    to: String,
    condition: EdgeCondition,
}

/// A validated flow with its nodes prepared and conditions parsed.
#[derive(Debug, Clone)]
struct LoadedFlow {
    spec: FlowSpec,
    nodes: HashMap<String, Node>,
    edges: Vec<CompiledEdge>,
    start_node: Option<String>,
}

impl LoadedFlow {
    /// First outgoing edge of `node_id`, in declared order, whose condition
    /// holds against `ctx`.
    fn next_node(&self, node_id: &str, ctx: &FlowContext) -> Option<String> {
        self.edges
            .iter()
            .filter(|edge| edge.from == node_id)
            .find(|edge| edge.condition.evaluate(|path| ctx.get_context_value(path)))
            .map(|edge| edge.to.clone())
    }
}

/// Outcome of running one node.
enum Step {
    Next(String),
    Finished,
    /// Waiting on a timer or an override.
    Parked,
    /// The context went away or already finished; nothing more to do.
    Halted,
}

// ---------------------------------------------------------------------------
// FlowRunner
// ---------------------------------------------------------------------------

struct RunnerInner {
    bus: EventBus,
    executor: NodeExecutor,
    contexts: Arc<ContextManager>,
    timers: FlowTimerIntegration,
    flows: Mutex<HashMap<String, Arc<LoadedFlow>>>,
    /// One per flow id ever driven; never removed.
    gates: Mutex<HashMap<String, Arc<ReentrantMutex<()>>>>,
    /// `(flow, node)` pairs waiting on a countdown, with the epoch they were
    /// parked under.
    parked: Mutex<HashMap<(String, String), u64>>,
    park_epoch: AtomicU64,
    config: RunnerConfig,
}

/// Cheap-to-clone handle; clones drive the same flows.
#[derive(Clone)]
pub struct FlowRunner {
    inner: Arc<RunnerInner>,
}

impl FlowRunner {
    /// Runner with the built-in node kinds and default configuration.
    pub fn new(bus: EventBus) -> Self {
        let executor = NodeExecutor::new(bus.clone());
        Self::with_executor(bus, executor, RunnerConfig::default())
    }

    /// Runner around a custom executor.  The executor should emit on the
    /// same `bus`.
    pub fn with_executor(bus: EventBus, executor: NodeExecutor, config: RunnerConfig) -> Self {
        let contexts = Arc::new(ContextManager::new());
        let timers = FlowTimerIntegration::new(
            bus.clone(),
            TimerManager::new(bus.clone()),
            Arc::clone(&contexts),
        );
        Self {
            inner: Arc::new(RunnerInner {
                bus,
                executor,
                contexts,
                timers,
                flows: Mutex::new(HashMap::new()),
                gates: Mutex::new(HashMap::new()),
                parked: Mutex::new(HashMap::new()),
                park_epoch: AtomicU64::new(0),
                config,
            }),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn timers(&self) -> &TimerManager {
        self.inner.timers.timers()
    }

    // -----------------------------------------------------------------------
    // Loading
    // -----------------------------------------------------------------------

    /// Register `spec` and create its context.  Loading an id again replaces
    /// both, cancelling the old context's timers.
    ///
    /// # Errors
    /// - [`EngineError::DuplicateNodeId`] / [`EngineError::UnknownNodeReference`]
    ///   for a malformed graph.
    /// - [`EngineError::Node`] when a node's config does not decode.
    #[instrument(skip(self, spec), fields(flow = %spec.id))]
    pub fn load_flow(&self, spec: FlowSpec) -> Result<(), EngineError> {
        dag::validate_flow(&spec)?;

        let nodes = spec
            .nodes
            .iter()
            .map(|n| {
                self.inner
                    .executor
                    .prepare(&n.id, &n.node_type, &n.label, &n.config)
                    .map(|node| (n.id.clone(), node))
                    .map_err(|source| EngineError::Node {
                        node_id: n.id.clone(),
                        source,
                    })
            })
            .collect::<Result<HashMap<_, _>, _>>()?;

        let edges: Vec<CompiledEdge> = spec
            .edges
            .iter()
            .map(|e| {
                let condition = EdgeCondition::parse(&e.condition);
                if let EdgeCondition::Malformed { reason, .. } = &condition {
                    warn!(
                        from = %e.from,
                        to = %e.to,
                        condition = %e.condition,
                        %reason,
                        "malformed edge condition; the edge will never be taken"
                    );
                }
                CompiledEdge {
                    from: e.from.clone(),
                    to: e.to.clone(),
                    condition,
                }
            })
            .collect();

        let start_node = dag::find_start_node(&spec).map(str::to_owned);
        let unreachable = dag::unreachable_nodes(&spec, start_node.as_deref());
        if !unreachable.is_empty() {
            warn!(?unreachable, "nodes not reachable from the start node");
        }

        let gate = self.gate(&spec.id);
        let _serial = gate.lock();
        if self.inner.contexts.exists(&spec.id) {
            self.inner.timers.cancel_all_timers(&spec.id, "flow_reloaded");
            self.unpark_all(&spec.id);
        }
        self.inner.contexts.create(&spec, self.inner.config.ai_butler_default);

        info!(
            nodes = spec.nodes.len(),
            edges = spec.edges.len(),
            start = ?start_node,
            "flow loaded"
        );
        let flow_id = spec.id.clone();
        self.inner.flows.lock().insert(
            flow_id,
            Arc::new(LoadedFlow {
                spec,
                nodes,
                edges,
                start_node,
            }),
        );
        Ok(())
    }

    /// Drop a flow's definition and context.  Returns `false` if it was not loaded.
    #[instrument(skip(self))]
    pub fn unload_flow(&self, flow_id: &str) -> bool {
        let gate = self.gate(flow_id);
        let _serial = gate.lock();
        self.inner.timers.cancel_all_timers(flow_id, "flow_unloaded");
        self.unpark_all(flow_id);
        self.inner.contexts.remove(flow_id);
        let removed = self.inner.flows.lock().remove(flow_id).is_some();
        if removed {
            info!("flow unloaded");
        }
        removed
    }

    pub fn is_loaded(&self, flow_id: &str) -> bool {
        self.inner.flows.lock().contains_key(flow_id)
    }

    /// Node execution starts from, if the graph has one.
    pub fn start_node(&self, flow_id: &str) -> Option<String> {
        self.flow(flow_id)?.start_node.clone()
    }

    // -----------------------------------------------------------------------
    // Driving
    // -----------------------------------------------------------------------

    /// Start (or restart) a loaded flow from its start node.
    ///
    /// `initial_context` is merged into the flow's context data.  Logs and
    /// does nothing if the flow or its context is missing.
    #[instrument(skip(self, initial_context))]
    pub fn start_flow(&self, flow_id: &str, initial_context: Option<Map<String, Value>>) {
        let Some(mut flow) = self.flow(flow_id) else {
            warn!("start requested for a flow that is not loaded");
            return;
        };
        let gate = self.gate(flow_id);
        let _serial = gate.lock();
        if !self.inner.contexts.exists(flow_id) {
            warn!("start requested for a flow without a context; reload it first");
            return;
        }

        self.inner.timers.cancel_all_timers(flow_id, "flow_restarted");
        self.unpark_all(flow_id);

        if let Some(initial) = initial_context {
            let mut merged = LoadedFlow::clone(&flow);
            merged.spec.context.extend(initial);
            flow = Arc::new(merged);
            self.inner.flows.lock().insert(flow_id.to_owned(), Arc::clone(&flow));
        }

        let run_id = Uuid::new_v4();
        self.inner.contexts.update(
            flow_id,
            ContextPatch {
                current_node: Some(None),
                completed: Some(false),
                error: Some(None),
                start_time: Some(Utc::now()),
                run_id: Some(run_id),
                data: Some(flow.spec.context.clone()),
                ..Default::default()
            },
        );

        let snapshot = self
            .inner
            .contexts
            .read(flow_id, |ctx| serde_json::to_value(ctx).unwrap_or(Value::Null))
            .unwrap_or(Value::Null);
        info!(%run_id, start = ?flow.start_node, "flow started");
        self.inner
            .bus
            .emit("flow.started", json!({ "flow": flow_id, "context": snapshot }));

        match flow.start_node.clone() {
            Some(start) => self.run_from(flow_id, start),
            None => self.complete(flow_id),
        }
    }

    /// Apply `action` to a node waiting on its countdown and advance.
    ///
    /// Returns `false` (and changes nothing) when the node is not waiting,
    /// e.g. because its default action was already applied.
    #[instrument(skip(self))]
    pub fn override_action(&self, flow_id: &str, node_id: &str, action: &str) -> bool {
        let gate = self.gate(flow_id);
        let _serial = gate.lock();
        self.inner.timers.cancel_node_timeout(flow_id, node_id, "user_override");
        if !self.claim(flow_id, node_id, None) {
            warn!("override ignored; node is not waiting on a timeout");
            return false;
        }

        info!("user override");
        self.inner.bus.emit(
            "ui.action.override",
            json!({ "flow": flow_id, "node": node_id, "action": action }),
        );
        self.inner.contexts.set_user_override(flow_id, node_id, true);
        let output = json!({
            "action_applied": true,
            "result": { "applied": true, "type": "user_override", "action": action },
            "type": "override",
        });
        self.finish_node(flow_id, node_id, output);
        true
    }

    /// Cancel a node's countdown without advancing.  The node stays waiting
    /// for an [`override_action`](Self::override_action).
    #[instrument(skip(self))]
    pub fn cancel_timeout(&self, flow_id: &str, node_id: &str, reason: &str) -> bool {
        let gate = self.gate(flow_id);
        let _serial = gate.lock();
        self.inner.timers.cancel_node_timeout(flow_id, node_id, reason)
    }

    /// Cancel every timer of the flow and discard its context.  A stopped
    /// flow can only be reloaded.
    #[instrument(skip(self))]
    pub fn stop_flow(&self, flow_id: &str) -> bool {
        let gate = self.gate(flow_id);
        let _serial = gate.lock();
        self.inner.timers.cancel_all_timers(flow_id, "flow_stopped");
        self.unpark_all(flow_id);
        let stopped = self.inner.contexts.remove(flow_id).is_some();
        if stopped {
            info!("flow stopped");
        } else {
            warn!("stop requested for a flow without a context");
        }
        stopped
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn get_flow_state(&self, flow_id: &str) -> FlowState {
        self.inner
            .contexts
            .read(flow_id, |ctx| {
                if ctx.error.is_some() {
                    FlowState::Error
                } else if ctx.completed {
                    FlowState::Completed
                } else if ctx.current_node.is_some() {
                    FlowState::Running
                } else {
                    FlowState::Idle
                }
            })
            .unwrap_or(FlowState::Idle)
    }

    /// Ids of flows that are neither completed nor errored.
    pub fn get_active_flows(&self) -> Vec<String> {
        self.inner.contexts.list_active()
    }

    /// Snapshot of a flow's context.
    pub fn context(&self, flow_id: &str) -> Option<FlowContext> {
        self.inner.contexts.get(flow_id)
    }

    /// Toggle whether timed nodes wait for their countdown.
    pub fn set_ai_butler(&self, flow_id: &str, enabled: bool) -> bool {
        let gate = self.gate(flow_id);
        let _serial = gate.lock();
        self.inner.contexts.update(
            flow_id,
            ContextPatch {
                ai_butler_enabled: Some(enabled),
                ..Default::default()
            },
        )
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn flow(&self, flow_id: &str) -> Option<Arc<LoadedFlow>> {
        self.inner.flows.lock().get(flow_id).cloned()
    }

    fn gate(&self, flow_id: &str) -> Arc<ReentrantMutex<()>> {
        Arc::clone(self.inner.gates.lock().entry(flow_id.to_owned()).or_default())
    }

    fn run_from(&self, flow_id: &str, start: String) {
        let mut node_id = start;
        for _ in 0..self.inner.config.max_steps {
            match self.step(flow_id, &node_id) {
                Ok(Step::Next(next)) => node_id = next,
                Ok(Step::Finished) => {
                    self.complete(flow_id);
                    return;
                }
                Ok(Step::Parked | Step::Halted) => return,
                Err(err) => {
                    self.fail(flow_id, &err, Some(&node_id));
                    return;
                }
            }
        }
        let err = EngineError::StepLimitExceeded {
            limit: self.inner.config.max_steps,
        };
        self.fail(flow_id, &err, Some(&node_id));
    }

    fn step(&self, flow_id: &str, node_id: &str) -> Result<Step, EngineError> {
        let flow = self
            .flow(flow_id)
            .ok_or_else(|| EngineError::FlowNotFound(flow_id.to_owned()))?;
        let ai_butler = self
            .inner
            .contexts
            .read(flow_id, |ctx| (!ctx.completed).then_some(ctx.ai_butler_enabled))
            .flatten();
        let Some(ai_butler) = ai_butler else {
            debug!(flow = flow_id, node = node_id, "flow no longer running; halting");
            return Ok(Step::Halted);
        };
        let node = flow.nodes.get(node_id).ok_or_else(|| EngineError::NodeNotFound {
            flow_id: flow_id.to_owned(),
            node_id: node_id.to_owned(),
        })?;

        self.inner.contexts.update(
            flow_id,
            ContextPatch {
                current_node: Some(Some(node_id.to_owned())),
                ..Default::default()
            },
        );

        if node.timeout.is_some() && ai_butler {
            let epoch = self.park(flow_id, node_id);
            match self
                .inner
                .timers
                .start_node_timeout(node, flow_id, self.resume_callback(flow_id, epoch))
            {
                Ok(timer_id) => {
                    debug!(flow = flow_id, node = node_id, %timer_id, "node waiting on countdown");
                    return Ok(Step::Parked);
                }
                Err(err) => {
                    self.claim(flow_id, node_id, Some(epoch));
                    return Err(err);
                }
            }
        }

        let ctx = self
            .inner
            .contexts
            .get(flow_id)
            .ok_or_else(|| EngineError::ContextNotFound(flow_id.to_owned()))?;
        let output = self
            .inner
            .executor
            .execute(node, &ctx)
            .map_err(|source| EngineError::Node {
                node_id: node_id.to_owned(),
                source,
            })?;
        Ok(self.advance(&flow, flow_id, node_id, output))
    }

    /// Store `output` and pick the successor of `node_id`.
    fn advance(&self, flow: &LoadedFlow, flow_id: &str, node_id: &str, output: Value) -> Step {
        if !self.inner.contexts.store_node_output(flow_id, node_id, output) {
            return Step::Halted;
        }
        match self.inner.contexts.read(flow_id, |ctx| flow.next_node(node_id, ctx)) {
            None => Step::Halted,
            Some(Some(next)) => {
                debug!(flow = flow_id, from = node_id, to = %next, "advancing");
                Step::Next(next)
            }
            Some(None) => Step::Finished,
        }
    }

    /// Store the output of a parked node that was just claimed, then keep
    /// running.
    fn finish_node(&self, flow_id: &str, node_id: &str, output: Value) {
        let Some(flow) = self.flow(flow_id) else {
            warn!(flow = flow_id, node = node_id, "flow unloaded while node was waiting");
            return;
        };
        match self.advance(&flow, flow_id, node_id, output) {
            Step::Next(next) => self.run_from(flow_id, next),
            Step::Finished => self.complete(flow_id),
            Step::Parked | Step::Halted => {}
        }
    }

    /// Completion for a node parked under `epoch`.  Runs on the timer's
    /// task, so it takes the flow's gate first.
    pub(crate) fn resume_callback(&self, flow_id: &str, epoch: u64) -> CompletionCallback {
        // Weak: the callback lives in a bus listener owned by this runner.
        let runner: Weak<RunnerInner> = Arc::downgrade(&self.inner);
        let flow_id = flow_id.to_owned();
        Arc::new(move |node_id: &str, output: Value| {
            let Some(inner) = runner.upgrade() else {
                return;
            };
            let runner = FlowRunner { inner };
            let gate = runner.gate(&flow_id);
            let _serial = gate.lock();
            if runner.claim(&flow_id, node_id, Some(epoch)) {
                runner.finish_node(&flow_id, node_id, output);
            } else {
                debug!(flow = %flow_id, node = node_id, "default applied to a node no longer waiting");
            }
        })
    }

    fn complete(&self, flow_id: &str) {
        let Some(outputs) = self.inner.contexts.read(flow_id, |ctx| ctx.node_outputs.clone()) else {
            return;
        };
        self.inner.contexts.update(
            flow_id,
            ContextPatch {
                completed: Some(true),
                current_node: Some(None),
                ..Default::default()
            },
        );
        self.unpark_all(flow_id);
        self.inner.timers.cancel_all_timers(flow_id, "flow_completed");

        info!(flow = flow_id, nodes = outputs.len(), "flow completed");
        self.inner
            .bus
            .emit("flow.completed", json!({ "flow": flow_id, "outputs": outputs }));
    }

    fn fail(&self, flow_id: &str, err: &EngineError, node_id: Option<&str>) {
        error!(flow = flow_id, node = ?node_id, error = %err, "flow failed");
        let failure = FlowFailure {
            message: err.to_string(),
            node: node_id.map(str::to_owned),
        };
        self.inner.contexts.update(
            flow_id,
            ContextPatch {
                error: Some(Some(failure.clone())),
                completed: Some(true),
                current_node: Some(None),
                ..Default::default()
            },
        );
        self.unpark_all(flow_id);
        self.inner.timers.cancel_all_timers(flow_id, "flow_error");

        self.inner.bus.emit(
            "flow.error",
            json!({ "flow": flow_id, "error": failure.message, "node": failure.node }),
        );
    }

    /// Mark the node as waiting and return the epoch it waits under.
    fn park(&self, flow_id: &str, node_id: &str) -> u64 {
        let epoch = self.inner.park_epoch.fetch_add(1, Ordering::Relaxed) + 1;
        self.inner
            .parked
            .lock()
            .insert((flow_id.to_owned(), node_id.to_owned()), epoch);
        epoch
    }

    /// Take the parked node.  Exactly one caller wins.  With `epoch`, only a
    /// node parked under that epoch can be taken.
    fn claim(&self, flow_id: &str, node_id: &str, epoch: Option<u64>) -> bool {
        let mut parked = self.inner.parked.lock();
        let key = (flow_id.to_owned(), node_id.to_owned());
        match parked.get(&key).copied() {
            Some(current) if epoch.map_or(true, |expected| expected == current) => {
                parked.remove(&key);
                true
            }
            _ => false,
        }
    }

    fn unpark_all(&self, flow_id: &str) {
        self.inner.parked.lock().retain(|(flow, _), _| flow != flow_id);
    }
}

impl fmt::Debug for FlowRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowRunner")
            .field("flows", &self.inner.flows.lock().len())
            .field("parked", &self.inner.parked.lock().len())
            .finish()
    }
}
