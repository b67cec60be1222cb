//! Ports: the buffers nodes read from and write to.
//!
//! Every port is owned by exactly one processor (track, plugin, fader, send,
//! macro processor or the engine). A port buffer is written only by the thread
//! running the node that owns it (or the port's own node, for summing inputs)
//! and read by children after the refcount handshake.

use core::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use atomic_float::AtomicF32;
use parking_lot::RwLock;

use crate::plugin::PluginId;
use crate::processors::TrackId;
use crate::time::EngineProcessTimeInfo;

/// Project-wide port identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct PortId(pub(crate) u32);

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port#{}", self.0)
    }
}

/// Hands out fresh port ids. Ids are never reused within a project.
#[derive(Debug, Default)]
pub(crate) struct PortIdAllocator(u32);

impl PortIdAllocator {
    pub(crate) fn next(&mut self) -> PortId {
        let id = PortId(self.0);
        self.0 += 1;
        id
    }

    /// Whether `id` was ever handed out, even if its port is gone since.
    pub(crate) fn is_allocated(&self, id: PortId) -> bool {
        id.0 < self.0
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum PortType {
    Audio,
    Cv,
    Event,
    Control,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum PortFlow {
    Input,
    Output,
}

/// The object a port belongs to.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum PortOwner {
    /// The track processor (track input/output, tempo controls).
    Track(TrackId),
    Plugin(PluginId),
    Fader(TrackId),
    Prefader(TrackId),
    ChannelSend { track: TrackId, slot: usize },
    ModulatorMacroProcessor { track: TrackId, index: usize },
    Engine,
}

/// Small bitset describing a port's role.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct PortFlags(u16);

impl PortFlags {
    pub const NONE: PortFlags = PortFlags(0);
    /// The value may be driven by automation or modulation.
    pub const AUTOMATABLE: PortFlags = PortFlags(1);
    pub const BPM: PortFlags = PortFlags(1 << 1);
    pub const BEATS_PER_BAR: PortFlags = PortFlags(1 << 2);
    pub const BEAT_UNIT: PortFlags = PortFlags(1 << 3);
    /// Read by the audio backend after each cycle.
    pub const EXPOSED_TO_BACKEND: PortFlags = PortFlags(1 << 4);

    #[inline]
    pub const fn contains(self, other: PortFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn union(self, other: PortFlags) -> PortFlags {
        PortFlags(self.0 | other.0)
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl core::ops::BitOr for PortFlags {
    type Output = PortFlags;

    fn bitor(self, rhs: PortFlags) -> PortFlags {
        self.union(rhs)
    }
}

/// A short MIDI message positioned inside the cycle buffer.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MidiEvent {
    /// Frame offset inside the port buffer.
    pub time: u32,
    pub data: [u8; 3],
}

/// Value range of a control port.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct ControlRange {
    pub min: f32,
    pub max: f32,
    pub default: f32,
}

impl ControlRange {
    pub const fn new(min: f32, max: f32, default: f32) -> Self {
        Self { min, max, default }
    }

    #[inline]
    pub fn clamp(&self, val: f32) -> f32 {
        val.clamp(self.min, self.max)
    }
}

impl Default for ControlRange {
    fn default() -> Self {
        Self::new(0.0, 1.0, 0.0)
    }
}

/// A resolved incoming connection, cached on the port's graph node.
#[derive(Clone)]
pub struct PortSource {
    pub port: Arc<Port>,
    pub multiplier: f32,
}

pub struct Port {
    id: PortId,
    label: String,
    kind: PortType,
    flow: PortFlow,
    owner: PortOwner,
    flags: PortFlags,
    range: ControlRange,
    buf: RwLock<Vec<f32>>,
    events: RwLock<Vec<MidiEvent>>,
    control: AtomicF32,
    deleting: AtomicBool,
}

impl Port {
    pub(crate) fn new(
        id: PortId,
        label: impl Into<String>,
        kind: PortType,
        flow: PortFlow,
        owner: PortOwner,
    ) -> Self {
        Self {
            id,
            label: label.into(),
            kind,
            flow,
            owner,
            flags: PortFlags::NONE,
            range: ControlRange::default(),
            buf: RwLock::new(Vec::new()),
            events: RwLock::new(Vec::new()),
            control: AtomicF32::new(0.0),
            deleting: AtomicBool::new(false),
        }
    }

    pub(crate) fn with_flags(mut self, flags: PortFlags) -> Self {
        self.flags = self.flags | flags;
        self
    }

    pub(crate) fn with_range(mut self, range: ControlRange) -> Self {
        self.range = range;
        self.control = AtomicF32::new(range.default);
        self
    }

    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn kind(&self) -> PortType {
        self.kind
    }

    pub fn flow(&self) -> PortFlow {
        self.flow
    }

    pub fn owner(&self) -> PortOwner {
        self.owner
    }

    pub fn flags(&self) -> PortFlags {
        self.flags
    }

    pub fn range(&self) -> ControlRange {
        self.range
    }

    pub fn is_control(&self) -> bool {
        self.kind == PortType::Control
    }

    pub fn is_exposed_to_backend(&self) -> bool {
        self.flags.contains(PortFlags::EXPOSED_TO_BACKEND)
    }

    pub fn is_deleting(&self) -> bool {
        self.deleting.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_deleting(&self) {
        self.deleting.store(true, Ordering::SeqCst);
    }

    /// Current control value.
    #[inline]
    pub fn control_value(&self) -> f32 {
        self.control.load(Ordering::Relaxed)
    }

    /// Set the control value, clamped to the port's range.
    pub fn set_control_value(&self, val: f32) {
        self.control.store(self.range.clamp(val), Ordering::Relaxed);
    }

    /// Size the sample buffer for cycles of up to `frames` frames.
    ///
    /// Called from the non-real-time thread during graph setup.
    pub(crate) fn allocate_bufs(&self, frames: usize) {
        match self.kind {
            PortType::Audio | PortType::Cv => {
                let mut buf = self.buf.write();
                if buf.len() != frames {
                    buf.clear();
                    buf.resize(frames, 0.0);
                }
            }
            PortType::Event => {
                let mut events = self.events.write();
                let additional = 128usize.saturating_sub(events.capacity());
                events.reserve(additional);
            }
            PortType::Control => {}
        }
    }

    /// Read the sample buffer.
    pub fn read_audio<R>(&self, f: impl FnOnce(&[f32]) -> R) -> R {
        f(&self.buf.read())
    }

    /// Write the sample buffer.
    pub fn write_audio<R>(&self, f: impl FnOnce(&mut [f32]) -> R) -> R {
        f(&mut self.buf.write())
    }

    pub fn read_events<R>(&self, f: impl FnOnce(&[MidiEvent]) -> R) -> R {
        f(&self.events.read())
    }

    pub fn write_events<R>(&self, f: impl FnOnce(&mut Vec<MidiEvent>) -> R) -> R {
        f(&mut self.events.write())
    }

    /// Zero the cycle's region of the buffer (or drop its events).
    pub fn clear_buffer(&self, time: &EngineProcessTimeInfo) {
        match self.kind {
            PortType::Audio | PortType::Cv => {
                let mut buf = self.buf.write();
                if let Some(region) = buf.get_mut(time.range()) {
                    region.fill(0.0);
                }
            }
            PortType::Event => {
                let (start, end) = (time.local_offset, time.end_offset());
                self.events
                    .write()
                    .retain(|ev| ev.time < start || ev.time >= end);
            }
            PortType::Control => {}
        }
    }

    /// Copy the cycle's region of `src` into this port.
    pub(crate) fn copy_from(&self, src: &Port, time: &EngineProcessTimeInfo) {
        match self.kind {
            PortType::Audio | PortType::Cv => {
                let range = time.range();
                let src_buf = src.buf.read();
                let mut buf = self.buf.write();
                if let (Some(dst), Some(s)) = (buf.get_mut(range.clone()), src_buf.get(range)) {
                    dst.copy_from_slice(s);
                }
            }
            PortType::Event => {
                self.clear_buffer(time);
                let (start, end) = (time.local_offset, time.end_offset());
                let src_events = src.events.read();
                let mut events = self.events.write();
                events.extend(src_events.iter().filter(|ev| ev.time >= start && ev.time < end));
            }
            PortType::Control => self.set_control_value(src.control_value()),
        }
    }

    /// Process this port as a graph node: pull the sources into the buffer.
    ///
    /// Audio and CV inputs sum their sources scaled by the connection
    /// multiplier. Control inputs take the summed source values, clamped to
    /// range. Event inputs collect the sources' events for the cycle. Ports
    /// without sources are left to their owner.
    pub fn process(&self, srcs: &[PortSource], time: &EngineProcessTimeInfo) {
        if srcs.is_empty() || self.flow == PortFlow::Output {
            return;
        }

        match self.kind {
            PortType::Audio | PortType::Cv => {
                let range = time.range();
                let mut buf = self.buf.write();
                let Some(dst) = buf.get_mut(range.clone()) else {
                    return;
                };
                dst.fill(0.0);
                for src in srcs {
                    let src_buf = src.port.buf.read();
                    let Some(s) = src_buf.get(range.clone()) else {
                        continue;
                    };
                    for (d, s) in dst.iter_mut().zip(s) {
                        *d += s * src.multiplier;
                    }
                }
            }
            PortType::Control => {
                let sum: f32 = srcs
                    .iter()
                    .map(|src| src.port.first_value(time) * src.multiplier)
                    .sum();
                self.set_control_value(sum);
            }
            PortType::Event => {
                self.clear_buffer(time);
                let (start, end) = (time.local_offset, time.end_offset());
                let mut events = self.events.write();
                for src in srcs {
                    let src_events = src.port.events.read();
                    events.extend(
                        src_events
                            .iter()
                            .filter(|ev| ev.time >= start && ev.time < end),
                    );
                }
                events.sort_by_key(|ev| ev.time);
            }
        }
    }

    /// Value this port contributes when driving a control input.
    fn first_value(&self, time: &EngineProcessTimeInfo) -> f32 {
        match self.kind {
            PortType::Control => self.control_value(),
            PortType::Audio | PortType::Cv => self
                .buf
                .read()
                .get(time.local_offset as usize)
                .copied()
                .unwrap_or(0.0),
            PortType::Event => 0.0,
        }
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("kind", &self.kind)
            .field("flow", &self.flow)
            .field("owner", &self.owner)
            .finish()
    }
}

/// Left/right port pair.
#[derive(Clone, Debug)]
pub struct StereoPorts {
    pub l: Arc<Port>,
    pub r: Arc<Port>,
}

impl StereoPorts {
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Port>> {
        [&self.l, &self.r].into_iter()
    }
}

/// Denominator of the time signature.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub enum BeatUnit {
    Two,
    #[default]
    Four,
    Eight,
    Sixteen,
}

impl BeatUnit {
    pub fn value(self) -> u32 {
        match self {
            BeatUnit::Two => 2,
            BeatUnit::Four => 4,
            BeatUnit::Eight => 8,
            BeatUnit::Sixteen => 16,
        }
    }

    /// Map a control port value (index 0..=3) to a beat unit.
    pub fn from_index(idx: u32) -> Self {
        match idx {
            0 => BeatUnit::Two,
            1 => BeatUnit::Four,
            2 => BeatUnit::Eight,
            _ => BeatUnit::Sixteen,
        }
    }

    pub fn index(self) -> u32 {
        match self {
            BeatUnit::Two => 0,
            BeatUnit::Four => 1,
            BeatUnit::Eight => 2,
            BeatUnit::Sixteen => 3,
        }
    }
}

/// A tempo control change, queued on the router and applied at cycle start.
///
/// Use the constructors rather than filling the fields by hand:
///
/// ```
/// use routegraph::port::{ChangeEvent, PortFlags};
///
/// let ev = ChangeEvent::bpm(140.0);
/// assert!(ev.flags.contains(PortFlags::BPM));
/// ```
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct ChangeEvent {
    /// Which control changed.
    pub flags: PortFlags,
    pub real_val: f32,
    pub ival: u32,
    pub beat_unit: BeatUnit,
}

impl ChangeEvent {
    pub fn bpm(bpm: f32) -> Self {
        Self {
            flags: PortFlags::BPM,
            real_val: bpm,
            ival: 0,
            beat_unit: BeatUnit::default(),
        }
    }

    pub fn beats_per_bar(beats: u32) -> Self {
        Self {
            flags: PortFlags::BEATS_PER_BAR,
            real_val: 0.0,
            ival: beats,
            beat_unit: BeatUnit::default(),
        }
    }

    pub fn beat_unit(unit: BeatUnit) -> Self {
        Self {
            flags: PortFlags::BEAT_UNIT,
            real_val: 0.0,
            ival: unit.value(),
            beat_unit: unit,
        }
    }
}
