//! Schedulable graph nodes.

use core::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::PluginError;
use crate::plugin::{Plugin, PluginId};
use crate::port::{Port, PortId, PortSource};
use crate::processors::{ChannelSend, Fader, ModulatorMacroProcessor, TrackId, TrackProcessor};
use crate::time::ProcessContext;

/// Stable identity of a node across rebuilds.
///
/// Two graphs built from the same project contain the same keys.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub enum NodeKey {
    InitialProcessor,
    Track(TrackId),
    Plugin(PluginId),
    Fader(TrackId),
    Prefader(TrackId),
    ChannelSend { track: TrackId, slot: usize },
    ModulatorMacroProcessor { track: TrackId, index: usize },
    Port(PortId),
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKey::InitialProcessor => write!(f, "initial processor"),
            NodeKey::Track(t) => write!(f, "{}", t),
            NodeKey::Plugin(p) => write!(f, "{}", p),
            NodeKey::Fader(t) => write!(f, "{} fader", t),
            NodeKey::Prefader(t) => write!(f, "{} prefader", t),
            NodeKey::ChannelSend { track, slot } => write!(f, "{} send {}", track, slot),
            NodeKey::ModulatorMacroProcessor { track, index } => write!(f, "{} macro {}", track, index),
            NodeKey::Port(p) => write!(f, "{}", p),
        }
    }
}

/// A port scheduled as its own node, with its resolved sources.
pub struct PortNode {
    pub port: Arc<Port>,
    pub srcs: Vec<PortSource>,
}

/// What a node runs. Dispatch is a plain `match`.
pub enum NodeKind {
    /// No-op ordered after the tempo track and before every track input.
    InitialProcessor,
    Track(Arc<TrackProcessor>),
    Plugin(Arc<Plugin>),
    Fader(Arc<Fader>),
    Prefader(Arc<Fader>),
    ChannelSend(Arc<ChannelSend>),
    ModulatorMacroProcessor {
        processor: Arc<ModulatorMacroProcessor>,
        cv_in_connected: bool,
    },
    Port(PortNode),
}

impl NodeKind {
    pub fn key(&self) -> NodeKey {
        match self {
            NodeKind::InitialProcessor => NodeKey::InitialProcessor,
            NodeKind::Track(t) => NodeKey::Track(t.track()),
            NodeKind::Plugin(p) => NodeKey::Plugin(p.id()),
            NodeKind::Fader(f) => NodeKey::Fader(f.track()),
            NodeKind::Prefader(f) => NodeKey::Prefader(f.track()),
            NodeKind::ChannelSend(s) => NodeKey::ChannelSend {
                track: s.track(),
                slot: s.slot(),
            },
            NodeKind::ModulatorMacroProcessor { processor, .. } => NodeKey::ModulatorMacroProcessor {
                track: processor.track(),
                index: processor.index(),
            },
            NodeKind::Port(p) => NodeKey::Port(p.port.id()),
        }
    }

    /// Human-readable name for printing and DOT export.
    pub fn name(&self) -> String {
        match self {
            NodeKind::Plugin(p) => format!("{} ({})", p.name(), p.id()),
            NodeKind::Port(p) => format!("{} ({})", p.port.label(), p.port.id()),
            other => other.key().to_string(),
        }
    }

    /// This node's own processing delay.
    pub fn single_playback_latency(&self) -> u32 {
        match self {
            NodeKind::Plugin(p) => p.latency(),
            _ => 0,
        }
    }
}

pub struct GraphNode {
    pub(crate) id: usize,
    pub(crate) kind: NodeKind,
    pub(crate) childnodes: Vec<usize>,
    pub(crate) init_refcount: usize,
    /// Parents not yet processed in the current cycle.
    pub(crate) refcount: AtomicUsize,
    pub(crate) playback_latency: AtomicU32,
    pub(crate) route_playback_latency: AtomicU32,
    pub(crate) terminal: bool,
    pub(crate) initial: bool,
    skip_processing: AtomicBool,
    error: Mutex<Option<PluginError>>,
}

impl GraphNode {
    pub(crate) fn new(id: usize, kind: NodeKind, childnodes: Vec<usize>, init_refcount: usize) -> Self {
        let terminal = childnodes.is_empty();
        Self {
            id,
            kind,
            childnodes,
            init_refcount,
            refcount: AtomicUsize::new(init_refcount),
            playback_latency: AtomicU32::new(0),
            route_playback_latency: AtomicU32::new(0),
            terminal,
            initial: init_refcount == 0,
            skip_processing: AtomicBool::new(false),
            error: Mutex::new(None),
        }
    }

    /// Index inside its [`GraphNodes`](super::GraphNodes).
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn key(&self) -> NodeKey {
        self.kind.key()
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn name(&self) -> String {
        self.kind.name()
    }

    pub fn childnodes(&self) -> &[usize] {
        &self.childnodes
    }

    pub fn init_refcount(&self) -> usize {
        self.init_refcount
    }

    pub fn playback_latency(&self) -> u32 {
        self.playback_latency.load(Ordering::SeqCst)
    }

    pub fn route_playback_latency(&self) -> u32 {
        self.route_playback_latency.load(Ordering::SeqCst)
    }

    /// No children.
    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    /// No parents.
    pub fn is_initial(&self) -> bool {
        self.initial
    }

    /// Mark the node as already processed for this cycle.
    pub fn set_skip_processing(&self, skip: bool) {
        self.skip_processing.store(skip, Ordering::SeqCst);
    }

    pub fn skip_processing(&self) -> bool {
        self.skip_processing.load(Ordering::SeqCst)
    }

    /// Error reported by the last failing run, if any.
    pub fn last_error(&self) -> Option<PluginError> {
        self.error.lock().clone()
    }

    pub(crate) fn record_error(&self, err: PluginError) {
        if let Some(mut slot) = self.error.try_lock() {
            *slot = Some(err);
        }
    }

    /// Run the wrapped processor for one cycle.
    ///
    /// Nodes whose route latency is below the remaining preroll sit the cycle
    /// out (terminal ports clear their buffers). While rolling, a node renders
    /// ahead of the playhead by its route latency minus the remaining preroll.
    pub fn process(&self, ctx: &ProcessContext) -> Result<(), PluginError> {
        let route_latency = self.route_playback_latency();
        if route_latency < ctx.remaining_preroll {
            if self.terminal {
                if let NodeKind::Port(p) = &self.kind {
                    p.port.clear_buffer(&ctx.time);
                }
            }
            return Ok(());
        }

        let mut ctx = *ctx;
        if ctx.rolling {
            ctx.time.g_start_frame_w_offset += u64::from(route_latency - ctx.remaining_preroll);
        }

        match &self.kind {
            NodeKind::InitialProcessor => Ok(()),
            NodeKind::Track(t) => {
                t.process(&ctx);
                Ok(())
            }
            NodeKind::Plugin(p) => p.process(&ctx),
            NodeKind::Fader(f) | NodeKind::Prefader(f) => {
                f.process(&ctx.time);
                Ok(())
            }
            NodeKind::ChannelSend(s) => {
                s.process(&ctx.time);
                Ok(())
            }
            NodeKind::ModulatorMacroProcessor {
                processor,
                cv_in_connected,
            } => {
                processor.process(&ctx.time, *cv_in_connected);
                Ok(())
            }
            NodeKind::Port(p) => {
                p.port.process(&p.srcs, &ctx.time);
                Ok(())
            }
        }
    }
}

impl fmt::Debug for GraphNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphNode")
            .field("id", &self.id)
            .field("key", &self.key())
            .field("children", &self.childnodes)
            .field("init_refcount", &self.init_refcount)
            .field("playback_latency", &self.playback_latency())
            .field("route_playback_latency", &self.route_playback_latency())
            .finish()
    }
}
