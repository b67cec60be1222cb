//! Cycle hand-off and the refcount-driven ready queue.
//!
//! One cycle: the router releases `callback_start`; the thread waiting on it
//! queues the initial nodes and starts processing. Every finished node
//! decrements its children's refcounts and queues the ones that reach zero.
//! The thread finishing the last terminal node releases `callback_done`,
//! waits for the rest of the pool to go idle and then waits for the next
//! `callback_start`.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use crossbeam::atomic::AtomicCell;
use crossbeam::queue::ArrayQueue;

use crate::config::EngineConfig;
use crate::error::PluginError;
use crate::graph::{GraphNodes, NodeKey};
use crate::sync::Semaphore;
use crate::time::ProcessContext;

pub(crate) struct Scheduler {
    /// Node set the next cycle will run.
    pub(crate) nodes: ArcSwapOption<GraphNodes>,
    /// Node set of the cycle in progress.
    cycle_nodes: ArcSwapOption<GraphNodes>,
    pub(crate) callback_start: Semaphore,
    pub(crate) callback_done: Semaphore,
    trigger: Semaphore,
    idle_thread_cnt: AtomicUsize,
    /// Threads besides the main graph thread.
    num_workers: AtomicUsize,
    terminal_refcnt: AtomicUsize,
    terminate: AtomicBool,
    ctx: AtomicCell<ProcessContext>,
    failed: ArrayQueue<(NodeKey, PluginError)>,
    trace: Option<ArrayQueue<NodeKey>>,
}

impl Scheduler {
    pub(crate) fn new(config: &EngineConfig) -> Self {
        Self {
            nodes: ArcSwapOption::empty(),
            cycle_nodes: ArcSwapOption::empty(),
            callback_start: Semaphore::new(0),
            callback_done: Semaphore::new(0),
            trigger: Semaphore::new(0),
            idle_thread_cnt: AtomicUsize::new(0),
            num_workers: AtomicUsize::new(0),
            terminal_refcnt: AtomicUsize::new(0),
            terminate: AtomicBool::new(false),
            ctx: AtomicCell::new(ProcessContext::default()),
            failed: ArrayQueue::new(config.error_queue_capacity.max(1)),
            trace: (config.execution_trace_capacity > 0)
                .then(|| ArrayQueue::new(config.execution_trace_capacity)),
        }
    }

    pub(crate) fn has_graph(&self) -> bool {
        self.nodes.load().is_some()
    }

    pub(crate) fn set_context(&self, ctx: ProcessContext) {
        self.ctx.store(ctx);
    }

    pub(crate) fn set_num_workers(&self, n: usize) {
        self.num_workers.store(n, Ordering::SeqCst);
    }

    pub(crate) fn trace_node(&self, key: NodeKey) {
        if let Some(trace) = &self.trace {
            let _ = trace.push(key);
        }
    }

    pub(crate) fn take_trace(&self) -> Vec<NodeKey> {
        let mut out = Vec::new();
        if let Some(trace) = &self.trace {
            while let Some(key) = trace.pop() {
                out.push(key);
            }
        }
        out
    }

    pub(crate) fn pop_failed(&self) -> Option<(NodeKey, PluginError)> {
        self.failed.pop()
    }

    /// Decrement a node's refcount and queue it once all parents are done.
    fn trigger(&self, nodes: &GraphNodes, idx: usize) {
        let node = &nodes.nodes[idx];
        if node.refcount.fetch_sub(1, Ordering::SeqCst) == 1 {
            node.refcount.store(node.init_refcount, Ordering::SeqCst);
            nodes.trigger_queue_size.fetch_add(1, Ordering::SeqCst);
            let _ = nodes.trigger_queue.push(idx);
        }
    }

    /// Install the pending node set and queue its initial nodes.
    ///
    /// Returns `false` if there is nothing to run.
    fn prep(&self) -> bool {
        let Some(nodes) = self.nodes.load_full() else {
            return false;
        };
        self.cycle_nodes.store(Some(Arc::clone(&nodes)));
        if nodes.terminals.is_empty() {
            return false;
        }
        self.terminal_refcnt
            .store(nodes.terminals.len(), Ordering::SeqCst);
        for &idx in &nodes.init_triggers {
            nodes.trigger_queue_size.fetch_add(1, Ordering::SeqCst);
            let _ = nodes.trigger_queue.push(idx);
        }
        true
    }

    /// Block until the router starts a cycle, then queue its initial nodes.
    ///
    /// Returns `false` on termination.
    fn wait_for_cycle(&self) -> bool {
        loop {
            self.callback_start.acquire();
            if self.terminate.load(Ordering::SeqCst) {
                return false;
            }
            if self.prep() {
                return true;
            }
            // empty graph: report the cycle done straight away
            self.callback_done.release();
        }
    }

    fn wait_for_idle_pool(&self) {
        let workers = self.num_workers.load(Ordering::SeqCst);
        while self.idle_thread_cnt.load(Ordering::SeqCst) != workers {
            if self.terminate.load(Ordering::SeqCst) {
                return;
            }
            std::thread::yield_now();
        }
    }

    fn reached_terminal_node(&self) {
        if self.terminal_refcnt.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }
        self.callback_done.release();
        self.wait_for_idle_pool();
        // returns into the worker loop either way; the loop checks terminate
        let _ = self.wait_for_cycle();
    }

    /// Run one node and notify its children.
    ///
    /// Returns whether the node was terminal.
    fn process_node(&self, nodes: &GraphNodes, idx: usize) -> bool {
        let node = &nodes.nodes[idx];
        if !node.skip_processing() {
            let ctx = self.ctx.load();
            if let Err(err) = node.process(&ctx) {
                node.record_error(err.clone());
                let _ = self.failed.push((node.key(), err));
            }
            self.trace_node(node.key());
        }

        for &child in &node.childnodes {
            self.trigger(nodes, child);
        }
        node.childnodes.is_empty()
    }

    /// Take one node from the ready queue (sleeping if there is none) and
    /// process it.
    fn run_one(&self) {
        if self.terminate.load(Ordering::SeqCst) {
            return;
        }

        let mut nodes = self.cycle_nodes.load_full();
        let mut to_run = nodes.as_ref().and_then(|n| n.trigger_queue.pop());

        if let (Some(n), Some(_)) = (&nodes, to_run) {
            // wake at most as many idle threads as there is queued work
            let idle = self.idle_thread_cnt.load(Ordering::SeqCst);
            let work_avail = n.trigger_queue_size.load(Ordering::SeqCst);
            let wakeup = (idle + 1).min(work_avail);
            if wakeup > 1 {
                self.trigger.release_n(wakeup - 1);
            }
        }

        while to_run.is_none() {
            self.idle_thread_cnt.fetch_add(1, Ordering::SeqCst);
            self.trigger.acquire();
            if self.terminate.load(Ordering::SeqCst) {
                return;
            }
            self.idle_thread_cnt.fetch_sub(1, Ordering::SeqCst);
            nodes = self.cycle_nodes.load_full();
            to_run = nodes.as_ref().and_then(|n| n.trigger_queue.pop());
        }

        let (Some(n), Some(idx)) = (nodes, to_run) else {
            return;
        };
        n.trigger_queue_size.fetch_sub(1, Ordering::SeqCst);
        let terminal = self.process_node(&n, idx);
        drop(n);
        if terminal {
            self.reached_terminal_node();
        }
    }

    /// Loop of the main graph thread: waits for the pool, takes the first
    /// cycle, then works like any other thread.
    pub(crate) fn main_loop(&self) {
        self.wait_for_idle_pool();
        if !self.wait_for_cycle() {
            return;
        }
        while !self.terminate.load(Ordering::SeqCst) {
            self.run_one();
        }
    }

    pub(crate) fn worker_loop(&self) {
        while !self.terminate.load(Ordering::SeqCst) {
            self.run_one();
        }
    }

    /// Make every graph thread return.
    pub(crate) fn terminate(&self, num_threads: usize) {
        self.terminate.store(true, Ordering::SeqCst);
        self.trigger.release_n(num_threads);
        self.callback_start.release();
    }

    /// Clear what a terminated pool left behind: the terminate flag, idle
    /// count and unconsumed permits. Only while no graph thread runs.
    pub(crate) fn reset(&self) {
        self.terminate.store(false, Ordering::SeqCst);
        self.idle_thread_cnt.store(0, Ordering::SeqCst);
        self.terminal_refcnt.store(0, Ordering::SeqCst);
        self.cycle_nodes.store(None);
        self.callback_start.reset();
        self.callback_done.reset();
        self.trigger.reset();
    }
}
