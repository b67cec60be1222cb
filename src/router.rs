//! Entry points for running one audio cycle and for rebuilding the graph.

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use rtrb::{Consumer, Producer, RingBuffer};
use tracing::{debug, error, warn};

use crate::config::EngineConfig;
use crate::engine::EngineState;
use crate::error::{Error, GraphError, PluginError, Result};
use crate::graph::{Graph, GraphNodes, NodeKey, Scheduler};
use crate::port::ChangeEvent;
use crate::project::Project;
use crate::sync::{Semaphore, SemaphoreGuard};
use crate::time::{EngineProcessTimeInfo, ProcessContext};

/// What [`Router::start_cycle`] did.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CycleOutcome {
    /// Every node ran.
    Processed,
    /// A rebuild held the graph; nothing ran.
    Skipped,
    /// No graph has been built yet.
    NoGraph,
    /// The frame range does not fit the configured buffer size.
    Rejected,
}

impl CycleOutcome {
    pub fn is_processed(self) -> bool {
        self == CycleOutcome::Processed
    }
}

/// A node error, handed to the UI after the cycle it happened in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeErrorReport {
    pub node: NodeKey,
    pub error: PluginError,
}

pub struct Router {
    config: EngineConfig,
    state: Arc<EngineState>,
    scheduler: Arc<Scheduler>,
    graph: Mutex<Option<Graph>>,
    /// Held by a rebuild or a soft recalc; `start_cycle` only ever tries it.
    graph_access: Semaphore,
    ctrl_port_change_queue: ArrayQueue<ChangeEvent>,
    error_tx: Mutex<Producer<NodeErrorReport>>,
    error_rx: Mutex<Consumer<NodeErrorReport>>,
}

impl Router {
    pub(crate) fn new(config: EngineConfig, state: Arc<EngineState>) -> Self {
        let scheduler = Arc::new(Scheduler::new(&config));
        let (error_tx, error_rx) = RingBuffer::new(config.error_queue_capacity);
        Self {
            ctrl_port_change_queue: ArrayQueue::new(config.control_queue_capacity),
            config,
            state,
            scheduler,
            graph: Mutex::new(None),
            graph_access: Semaphore::new(1),
            error_tx: Mutex::new(error_tx),
            error_rx: Mutex::new(error_rx),
        }
    }

    /// Run one cycle. Called once per backend callback (or per preroll
    /// split of it).
    ///
    /// Never blocks on a rebuild: if the graph is being rebuilt the cycle is
    /// skipped and the caller outputs silence.
    pub fn start_cycle(&self, time: EngineProcessTimeInfo) -> CycleOutcome {
        if !self.scheduler.has_graph() {
            return CycleOutcome::NoGraph;
        }
        if time.end_offset() > self.config.buffer_size {
            warn!(
                "cycle of {} frames at offset {} exceeds buffer size {}",
                time.nframes, time.local_offset, self.config.buffer_size
            );
            return CycleOutcome::Rejected;
        }
        let Some(_access) = self.graph_access.try_guard() else {
            return CycleOutcome::Skipped;
        };

        let ctx = ProcessContext {
            time,
            sample_rate: self.config.sample_rate,
            rolling: self.state.transport().is_rolling(),
            remaining_preroll: self.state.remaining_latency_preroll(),
        };
        self.scheduler.set_context(ctx);

        {
            let nodes = self.scheduler.nodes.load();
            let Some(nodes) = Option::as_ref(&nodes) else {
                return CycleOutcome::NoGraph;
            };

            // only what was queued before this cycle started
            let pending = self.ctrl_port_change_queue.len();
            for _ in 0..pending {
                let Some(change) = self.ctrl_port_change_queue.pop() else {
                    break;
                };
                if let Some(tempo) = nodes.tempo() {
                    tempo.apply_change(&change);
                }
            }

            for node in nodes.tempo_nodes() {
                if let Err(err) = node.process(&ctx) {
                    node.record_error(err);
                }
                self.scheduler.trace_node(node.key());
                node.set_skip_processing(true);
            }
        }

        self.scheduler.callback_start.release();
        self.scheduler.callback_done.acquire();

        if let Some(nodes) = Option::as_ref(&self.scheduler.nodes.load()) {
            for node in nodes.tempo_nodes() {
                node.set_skip_processing(false);
            }
        }

        if let Some(mut tx) = self.error_tx.try_lock() {
            while let Some((node, error)) = self.scheduler.pop_failed() {
                // drop reports nobody collects
                let _ = tx.push(NodeErrorReport { node, error });
            }
        }

        CycleOutcome::Processed
    }

    /// Rebuild the graph after a topology change, or refresh latencies only
    /// with `soft`.
    ///
    /// The first non-soft call builds the graph and starts the worker pool.
    /// A hard rebuild stops the engine, waits (at most
    /// [`EngineConfig::quiesce_timeout`]) for the running cycle to finish,
    /// swaps in the new graph and restores the engine's run flag.
    pub fn recalc_graph(&self, project: &Project, soft: bool) -> Result<()> {
        let mut slot = self.graph.lock();

        let Some(graph) = slot.as_mut() else {
            if soft {
                debug!("soft recalc without a graph, nothing to do");
                return Ok(());
            }
            // nothing is published until the pool runs; dropping `graph` on
            // any error below stops the threads again
            let num_workers = self.config.resolve_num_threads()?;
            let mut graph = Graph::with_scheduler(self.config.clone(), Arc::clone(&self.scheduler));
            graph
                .setup(project, true, true)
                .map_err(|err| self.structural_error(err))?;
            graph.start(num_workers)?;
            graph.rechain().map_err(|err| self.structural_error(err))?;
            *slot = Some(graph);
            return Ok(());
        };

        if soft {
            let _access = self.graph_access.guard();
            graph.update_latencies(false);
            return Ok(());
        }

        let was_running = self.state.swap_run(false);
        let timeout = self.config.quiesce_timeout;
        let start = Instant::now();
        while self.state.is_cycle_running() {
            if start.elapsed() >= timeout {
                self.state.set_run(was_running);
                warn!(?timeout, "running cycle did not finish, rebuild abandoned");
                return Err(Error::QuiesceTimeout(timeout));
            }
            thread::sleep(self.config.quiesce_poll);
        }

        let result = {
            let _access = self.graph_access.guard();
            self.rebuild(graph, project)
        };
        self.state.set_run(was_running);
        result
    }

    fn rebuild(&self, graph: &mut Graph, project: &Project) -> Result<()> {
        graph
            .setup(project, true, true)
            .and_then(|()| graph.rechain())
            .map_err(|err| self.structural_error(err))
    }

    fn structural_error(&self, err: GraphError) -> Error {
        if self.config.strict_validation {
            panic!("invalid processing graph: {}", err);
        }
        error!("graph rebuild rejected, keeping previous graph: {}", err);
        err.into()
    }

    /// Queue a tempo change for the next cycle. Callable from any thread.
    ///
    /// Hands the event back if the queue is full.
    pub fn queue_control_port_change(&self, change: ChangeEvent) -> core::result::Result<(), ChangeEvent> {
        self.ctrl_port_change_queue.push(change)
    }

    /// Hold off cycles (they will be skipped) until the guard is dropped.
    pub fn lock_graph_access(&self) -> SemaphoreGuard<'_> {
        self.graph_access.guard()
    }

    /// Node errors reported since the last call.
    pub fn drain_node_errors(&self) -> Vec<NodeErrorReport> {
        let mut rx = self.error_rx.lock();
        let mut reports = Vec::with_capacity(rx.slots());
        while let Ok(report) = rx.pop() {
            warn!(node = %report.node, "node error: {}", report.error);
            reports.push(report);
        }
        reports
    }

    /// Live node set, if a graph was built.
    pub fn graph_nodes(&self) -> Option<Arc<GraphNodes>> {
        self.scheduler.nodes.load_full()
    }

    pub(crate) fn with_live_nodes<R>(&self, f: impl FnOnce(Option<&GraphNodes>) -> R) -> R {
        let nodes = self.scheduler.nodes.load();
        f(Option::as_deref(&nodes))
    }

    /// Node keys in the order they ran, if the execution trace is enabled.
    pub fn take_execution_trace(&self) -> Vec<NodeKey> {
        self.scheduler.take_trace()
    }

    /// Cached critical-path latency of the live graph.
    pub fn get_max_route_playback_latency(&self) -> u32 {
        self.with_live_nodes(|nodes| nodes.map_or(0, GraphNodes::max_route_playback_latency))
    }

    /// Graphviz DOT export of the live graph.
    pub fn to_dot(&self) -> String {
        match self.graph.lock().as_ref() {
            Some(graph) => graph.to_dot(),
            None => String::from("digraph {\n}\n"),
        }
    }

    /// Log every node of the live graph.
    pub fn print_graph(&self) {
        if let Some(graph) = self.graph.lock().as_ref() {
            graph.print();
        }
    }

    pub fn is_running(&self) -> bool {
        self.graph.lock().as_ref().is_some_and(Graph::is_running)
    }
}
