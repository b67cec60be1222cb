//! The processing graph.
//!
//! [`Graph::setup`] walks the project into a staging node set,
//! [`Graph::rechain`] computes latencies and refcounts and makes it the live
//! set. The live set is only ever replaced whole, so a failed setup leaves
//! the running graph untouched.
//!
//! ```
//! use routegraph::{EngineConfig, Graph, Project};
//!
//! let config = EngineConfig::default().with_strict_validation(false);
//! let project = Project::new(config.clone()).unwrap();
//!
//! let mut graph = Graph::new(config);
//! graph.setup(&project, true, true).unwrap();
//! graph.rechain().unwrap();
//!
//! let nodes = graph.nodes().unwrap();
//! assert!(nodes.is_acyclic());
//! assert_eq!(graph.get_max_route_playback_latency(false), 0);
//! ```

mod builder;
pub mod node;
mod scheduler;
mod thread;

use core::fmt;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::queue::ArrayQueue;
use hashbrown::HashMap;
use itertools::Itertools;
use petgraph::algo::is_cyclic_directed;
use petgraph::dot::{Config, Dot};
use petgraph::graph::DiGraph;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::GraphError;
use crate::port::{Port, PortFlow, PortType};
use crate::processors::{TempoTrack, TrackProcessor};
use crate::project::Project;

use builder::GraphBuilder;
pub use node::{GraphNode, NodeKey, NodeKind, PortNode};
pub(crate) use scheduler::Scheduler;
use thread::GraphThread;

/// An immutable node set plus the per-cycle scheduling state that goes with
/// it.
pub struct GraphNodes {
    pub(crate) nodes: Vec<GraphNode>,
    pub(crate) init_triggers: Vec<usize>,
    pub(crate) terminals: Vec<usize>,
    index: HashMap<NodeKey, usize>,
    topo_order: Vec<usize>,
    pub(crate) tempo_nodes: Vec<usize>,
    tempo: Option<Arc<TrackProcessor>>,
    external_out_ports: Vec<Arc<Port>>,
    max_route_playback_latency: AtomicU32,
    pub(crate) trigger_queue: ArrayQueue<usize>,
    pub(crate) trigger_queue_size: AtomicUsize,
}

impl GraphNodes {
    fn from_builder(b: GraphBuilder, topo_order: Vec<usize>) -> Self {
        let mut parents = vec![0usize; b.kinds.len()];
        for children in &b.children {
            for &child in children {
                parents[child] += 1;
            }
        }

        let nodes: Vec<GraphNode> = b
            .kinds
            .into_iter()
            .zip(b.children)
            .enumerate()
            .map(|(id, (kind, children))| GraphNode::new(id, kind, children, parents[id]))
            .collect();

        let index = nodes.iter().map(|n| (n.key(), n.id)).collect();
        let init_triggers = nodes.iter().filter(|n| n.initial).map(|n| n.id).collect();
        let terminals = nodes.iter().filter(|n| n.terminal).map(|n| n.id).collect();
        let capacity = nodes.len().max(1);

        Self {
            nodes,
            init_triggers,
            terminals,
            index,
            topo_order,
            tempo_nodes: b.tempo_nodes,
            tempo: b.tempo,
            external_out_ports: b.external_out_ports,
            max_route_playback_latency: AtomicU32::new(0),
            trigger_queue: ArrayQueue::new(capacity),
            trigger_queue_size: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.iter()
    }

    pub fn node(&self, idx: usize) -> Option<&GraphNode> {
        self.nodes.get(idx)
    }

    pub fn get(&self, key: &NodeKey) -> Option<&GraphNode> {
        self.index.get(key).map(|&idx| &self.nodes[idx])
    }

    pub fn contains(&self, key: &NodeKey) -> bool {
        self.index.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = NodeKey> + '_ {
        self.nodes.iter().map(GraphNode::key)
    }

    /// Keys of the children of `key`.
    pub fn children(&self, key: &NodeKey) -> Vec<NodeKey> {
        self.get(key)
            .map(|n| n.childnodes.iter().map(|&c| self.nodes[c].key()).collect())
            .unwrap_or_default()
    }

    /// Every edge as a `(parent, child)` key pair.
    pub fn edges(&self) -> Vec<(NodeKey, NodeKey)> {
        self.nodes
            .iter()
            .flat_map(|n| n.childnodes.iter().map(move |&c| (n.key(), self.nodes[c].key())))
            .collect()
    }

    /// Nodes without parents.
    pub fn init_triggers(&self) -> impl Iterator<Item = &GraphNode> {
        self.init_triggers.iter().map(move |&idx| &self.nodes[idx])
    }

    /// Nodes without children.
    pub fn terminals(&self) -> impl Iterator<Item = &GraphNode> {
        self.terminals.iter().map(move |&idx| &self.nodes[idx])
    }

    pub fn topo_order(&self) -> &[usize] {
        &self.topo_order
    }

    /// BPM, beats-per-bar and beat-unit nodes.
    pub fn tempo_nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.tempo_nodes.iter().map(move |&idx| &self.nodes[idx])
    }

    pub fn tempo(&self) -> Option<&TempoTrack> {
        self.tempo.as_ref().and_then(|t| t.tempo())
    }

    /// Output ports read by the audio backend after each cycle.
    pub fn external_out_ports(&self) -> &[Arc<Port>] {
        &self.external_out_ports
    }

    /// No node reaches itself through child edges.
    pub fn is_acyclic(&self) -> bool {
        let mut g: DiGraph<(), ()> = DiGraph::with_capacity(self.nodes.len(), self.nodes.len() * 2);
        let idx: Vec<_> = self.nodes.iter().map(|_| g.add_node(())).collect();
        for node in &self.nodes {
            for &child in &node.childnodes {
                g.add_edge(idx[node.id], idx[child], ());
            }
        }
        !is_cyclic_directed(&g)
    }

    /// Cached critical-path latency, as of the last latency update.
    pub fn max_route_playback_latency(&self) -> u32 {
        self.max_route_playback_latency.load(Ordering::SeqCst)
    }

    /// Recompute every node's own and route latency.
    ///
    /// Refreshes plugin latencies, so this must not run concurrently with a
    /// cycle.
    pub(crate) fn update_latencies(&self) -> u32 {
        for node in &self.nodes {
            node.playback_latency.store(0, Ordering::SeqCst);
            node.route_playback_latency.store(0, Ordering::SeqCst);
        }

        for node in &self.nodes {
            if let NodeKind::Plugin(pl) = &node.kind {
                pl.update_latency();
            }
            node.playback_latency
                .store(node.kind.single_playback_latency(), Ordering::SeqCst);
        }

        for &idx in self.topo_order.iter().rev() {
            let node = &self.nodes[idx];
            let downstream = node
                .childnodes
                .iter()
                .map(|&c| self.nodes[c].route_playback_latency())
                .max()
                .unwrap_or(0);
            node.route_playback_latency
                .store(node.playback_latency() + downstream, Ordering::SeqCst);
        }

        let max = self
            .init_triggers()
            .map(GraphNode::route_playback_latency)
            .max()
            .unwrap_or(0);
        self.max_route_playback_latency.store(max, Ordering::SeqCst);
        max
    }

    /// Put refcounts and queue counters back to their start-of-cycle values.
    fn reset_cycle_state(&self) {
        for node in &self.nodes {
            node.refcount.store(node.init_refcount, Ordering::SeqCst);
            node.set_skip_processing(false);
        }
        while self.trigger_queue.pop().is_some() {}
        self.trigger_queue_size.store(0, Ordering::SeqCst);
    }

    fn print(&self) {
        for node in &self.nodes {
            info!(
                "{}: refcount {}, latency {}/{}, children [{}]",
                node.name(),
                node.init_refcount,
                node.playback_latency(),
                node.route_playback_latency(),
                node.childnodes.iter().map(|&c| self.nodes[c].name()).join(", ")
            );
        }
        info!(
            "num trigger nodes {} | num terminal nodes {}",
            self.init_triggers.len(),
            self.terminals.len()
        );
    }

    fn to_dot(&self) -> String {
        let mut g: DiGraph<String, &str> = DiGraph::new();
        let idx: Vec<_> = self.nodes.iter().map(|n| g.add_node(n.name())).collect();
        for node in &self.nodes {
            for &child in &node.childnodes {
                g.add_edge(idx[node.id], idx[child], "");
            }
        }
        format!("{}", Dot::with_config(&g, &[Config::EdgeNoLabel]))
    }
}

impl fmt::Debug for GraphNodes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphNodes")
            .field("nodes", &self.nodes.len())
            .field("init_triggers", &self.init_triggers.len())
            .field("terminals", &self.terminals.len())
            .finish()
    }
}

/// Staging node set, plus the cycle found in it when setup skipped
/// validation.
struct Staged {
    nodes: GraphNodes,
    cycle: Option<NodeKey>,
}

pub struct Graph {
    config: EngineConfig,
    scheduler: Arc<Scheduler>,
    setup: Option<Staged>,
    /// Previous live sets, freed here once no graph thread holds them.
    retired: Vec<Arc<GraphNodes>>,
    threads: Vec<JoinHandle<()>>,
}

impl Graph {
    /// A graph with its own scheduler. Threads are not started.
    pub fn new(config: EngineConfig) -> Self {
        let scheduler = Arc::new(Scheduler::new(&config));
        Self::with_scheduler(config, scheduler)
    }

    pub(crate) fn with_scheduler(config: EngineConfig, scheduler: Arc<Scheduler>) -> Self {
        Self {
            config,
            scheduler,
            setup: None,
            retired: Vec::new(),
            threads: Vec::new(),
        }
    }

    /// Build the staging node set from the live project.
    ///
    /// With `validate`, a dependency cycle is rejected here; otherwise it is
    /// rejected by [`Graph::rechain`]. Connections or routings pointing at
    /// removed objects are always rejected. On error the staging set is
    /// discarded and the live graph is left alone.
    ///
    /// `connect_ports` adds the edges coming from port connections; without
    /// it only the edges inside processors are built.
    pub fn setup(&mut self, project: &Project, validate: bool, connect_ports: bool) -> Result<(), GraphError> {
        self.setup = None;

        let builder = GraphBuilder::build(project, self.config.drop_unnecessary_ports, connect_ports)?;
        let (topo, cycle) = match builder.topo_order() {
            Ok(order) => (order, None),
            Err(key) if validate => return Err(GraphError::Cycle(key)),
            Err(key) => (Vec::new(), Some(key)),
        };

        let nodes = GraphNodes::from_builder(builder, topo);
        let frames = self.config.buffer_size as usize;
        for node in &nodes.nodes {
            if let NodeKind::Port(p) = &node.kind {
                p.port.allocate_bufs(frames);
            }
        }
        if cycle.is_none() {
            nodes.update_latencies();
        }

        debug!(
            nodes = nodes.len(),
            init_triggers = nodes.init_triggers.len(),
            terminals = nodes.terminals.len(),
            "graph setup done"
        );
        self.setup = Some(Staged { nodes, cycle });
        Ok(())
    }

    /// Make the staging set live.
    ///
    /// Must not race a running cycle: the router only calls it with the
    /// audio thread quiesced and the access semaphore held.
    pub fn rechain(&mut self) -> Result<(), GraphError> {
        let staged = self.setup.take().ok_or(GraphError::NotSetUp)?;
        if let Some(key) = staged.cycle {
            return Err(GraphError::Cycle(key));
        }

        let nodes = staged.nodes;
        nodes.reset_cycle_state();
        let max = nodes.max_route_playback_latency();

        self.retired.retain(|old| Arc::strong_count(old) > 1);
        if let Some(old) = self.scheduler.nodes.swap(Some(Arc::new(nodes))) {
            self.retired.push(old);
        }
        info!(max_route_playback_latency = max, "graph rechained");
        Ok(())
    }

    /// Recompute latencies without touching edges.
    ///
    /// Returns the new critical-path latency. On the live set this locks
    /// every plugin instance, so it must not overlap a cycle: the router
    /// only calls it with the access semaphore held (`recalc_graph(soft)`).
    pub fn update_latencies(&self, use_setup_nodes: bool) -> u32 {
        let max = if use_setup_nodes {
            match &self.setup {
                Some(staged) if staged.cycle.is_none() => staged.nodes.update_latencies(),
                _ => 0,
            }
        } else {
            match self.scheduler.nodes.load_full() {
                Some(nodes) => nodes.update_latencies(),
                None => 0,
            }
        };
        info!(playback = max, "total latencies");
        max
    }

    /// Critical-path latency of the live graph, in frames.
    ///
    /// `recompute` refreshes every node's latency first; otherwise the value
    /// cached by the last setup or latency update is returned. Recomputing
    /// has the same restriction as [`Graph::update_latencies`]; for a graph
    /// run by a router use [`Router::recalc_graph`](crate::Router::recalc_graph)
    /// with `soft` instead.
    pub fn get_max_route_playback_latency(&self, recompute: bool) -> u32 {
        match self.scheduler.nodes.load_full() {
            Some(nodes) if recompute => nodes.update_latencies(),
            Some(nodes) => nodes.max_route_playback_latency(),
            None => 0,
        }
    }

    /// Live node set.
    pub fn nodes(&self) -> Option<Arc<GraphNodes>> {
        self.scheduler.nodes.load_full()
    }

    /// Staging node set, between [`Graph::setup`] and [`Graph::rechain`].
    pub fn setup_nodes(&self) -> Option<&GraphNodes> {
        self.setup.as_ref().map(|s| &s.nodes)
    }

    /// Whether connecting `src` to `dest` is allowed.
    ///
    /// The flows and types must fit, and the graph with the extra edge must
    /// stay acyclic.
    pub fn can_ports_be_connected(project: &Project, src: &Port, dest: &Port) -> bool {
        if src.flow() != PortFlow::Output || dest.flow() != PortFlow::Input {
            return false;
        }
        let types_ok = matches!(
            (src.kind(), dest.kind()),
            (PortType::Audio, PortType::Audio)
                | (PortType::Cv, PortType::Cv)
                | (PortType::Cv, PortType::Control)
                | (PortType::Event, PortType::Event)
        );
        if !types_ok || src.owner() == dest.owner() {
            return false;
        }

        let mut trial = match GraphBuilder::build(project, false, true) {
            Ok(b) => b,
            Err(err) => {
                warn!("connection check failed: {}", err);
                return false;
            }
        };
        if !trial.connect_port_ids(src.id(), dest.id()) {
            return false;
        }
        debug!(nodes = trial.len(), "checking connection {} -> {}", src.id(), dest.id());
        trial.topo_order().is_ok()
    }

    /// Log every node of the live graph (or the staging one if none is live).
    pub fn print(&self) {
        info!("==printing graph");
        match (self.scheduler.nodes.load_full(), &self.setup) {
            (Some(nodes), _) => nodes.print(),
            (None, Some(staged)) => staged.nodes.print(),
            (None, None) => info!("graph is empty"),
        }
        info!("==finish printing graph");
    }

    /// Graphviz DOT export of the live graph.
    pub fn to_dot(&self) -> String {
        match self.scheduler.nodes.load_full() {
            Some(nodes) => nodes.to_dot(),
            None => String::from("digraph {\n}\n"),
        }
    }

    /// Spawn the main graph thread and `num_workers` helpers.
    ///
    /// If a thread fails to spawn, the ones already running are stopped and
    /// the live set is withdrawn, so a router sees no graph rather than one
    /// nobody processes.
    pub fn start(&mut self, num_workers: usize) -> crate::Result<()> {
        if !self.threads.is_empty() {
            return Ok(());
        }
        self.scheduler.reset();
        self.scheduler.set_num_workers(num_workers);
        for id in 0..=num_workers {
            let thread = GraphThread::new(id, id == 0, Arc::clone(&self.scheduler));
            match thread.spawn() {
                Ok(handle) => self.threads.push(handle),
                Err(err) => {
                    self.terminate();
                    return Err(err.into());
                }
            }
        }
        info!(threads = self.threads.len(), "graph threads started");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        !self.threads.is_empty()
    }

    /// Stop and join every graph thread.
    pub fn terminate(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        self.scheduler.terminate(self.threads.len());
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!("graph thread panicked");
            }
        }
        // cycles must not wait on a pool that is gone
        if let Some(old) = self.scheduler.nodes.swap(None) {
            self.retired.push(old);
        }
        info!("graph terminated");
    }
}

impl Drop for Graph {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn wait_done(scheduler: &Scheduler) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !scheduler.callback_done.try_acquire() {
            if Instant::now() > deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }

    #[test]
    fn pool_restarts_on_a_used_scheduler() {
        let config = EngineConfig::default().with_strict_validation(false);
        let project = Project::new(config.clone()).unwrap();
        let scheduler = Arc::new(Scheduler::new(&config));

        for _ in 0..2 {
            let mut graph = Graph::with_scheduler(config.clone(), Arc::clone(&scheduler));
            graph.setup(&project, true, true).unwrap();
            graph.start(1).unwrap();
            graph.rechain().unwrap();
            assert!(scheduler.has_graph());

            scheduler.callback_start.release();
            assert!(wait_done(&scheduler), "cycle never finished");

            graph.terminate();
            assert!(!scheduler.has_graph());
        }
    }
}
