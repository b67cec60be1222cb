use std::sync::atomic::Ordering;
use std::sync::Arc;

use atomic_float::AtomicF64;

use crate::port::{BeatUnit, ChangeEvent, ControlRange, Port, PortFlags, PortFlow, PortIdAllocator, PortOwner, PortType};
use crate::processors::TrackId;

pub const MIN_BPM: f32 = 40.0;
pub const MAX_BPM: f32 = 420.0;
pub const DEFAULT_BPM: f32 = 120.0;
pub const MIN_BEATS_PER_BAR: u32 = 1;
pub const MAX_BEATS_PER_BAR: u32 = 16;

/// Ticks in a quarter note.
pub const TICKS_PER_QUARTER_NOTE: f64 = 960.0;

/// Tempo and time signature, held in three control ports.
///
/// The ports are the graph's tempo singleton nodes: they run before anything
/// else in a cycle, and the tempo track's own node (which refreshes
/// [`TempoTrack::frames_per_tick`]) runs before the initial processor.
pub struct TempoTrack {
    bpm: Arc<Port>,
    beats_per_bar: Arc<Port>,
    beat_unit: Arc<Port>,
    frames_per_tick: AtomicF64,
}

impl TempoTrack {
    pub(crate) fn new(track: TrackId, ids: &mut PortIdAllocator) -> Self {
        let owner = PortOwner::Track(track);
        let control = |ids: &mut PortIdAllocator, label: &str, range: ControlRange, flag: PortFlags| {
            Arc::new(
                Port::new(ids.next(), label, PortType::Control, PortFlow::Input, owner)
                    .with_range(range)
                    .with_flags(flag),
            )
        };
        let bpm = control(
            ids,
            "BPM",
            ControlRange::new(MIN_BPM, MAX_BPM, DEFAULT_BPM),
            PortFlags::BPM,
        );
        let beats_per_bar = control(
            ids,
            "Beats per bar",
            ControlRange::new(MIN_BEATS_PER_BAR as f32, MAX_BEATS_PER_BAR as f32, 4.0),
            PortFlags::BEATS_PER_BAR,
        );
        let beat_unit = control(
            ids,
            "Beat unit",
            ControlRange::new(0.0, 3.0, BeatUnit::Four.index() as f32),
            PortFlags::BEAT_UNIT,
        );

        Self {
            bpm,
            beats_per_bar,
            beat_unit,
            frames_per_tick: AtomicF64::new(0.0),
        }
    }

    pub fn bpm_port(&self) -> &Arc<Port> {
        &self.bpm
    }

    pub fn beats_per_bar_port(&self) -> &Arc<Port> {
        &self.beats_per_bar
    }

    pub fn beat_unit_port(&self) -> &Arc<Port> {
        &self.beat_unit
    }

    pub fn ports(&self) -> impl Iterator<Item = &Arc<Port>> {
        [&self.bpm, &self.beats_per_bar, &self.beat_unit].into_iter()
    }

    pub fn bpm(&self) -> f32 {
        self.bpm.control_value()
    }

    /// Clamped to 40..=420.
    pub fn set_bpm(&self, bpm: f32) {
        self.bpm.set_control_value(bpm);
    }

    pub fn beats_per_bar(&self) -> u32 {
        self.beats_per_bar.control_value().round() as u32
    }

    /// Clamped to 1..=16.
    pub fn set_beats_per_bar(&self, beats: u32) {
        self.beats_per_bar.set_control_value(beats as f32);
    }

    pub fn beat_unit(&self) -> BeatUnit {
        BeatUnit::from_index(self.beat_unit.control_value().round() as u32)
    }

    pub fn set_beat_unit(&self, unit: BeatUnit) {
        self.beat_unit.set_control_value(unit.index() as f32);
    }

    /// Apply a queued control change. Real-time safe.
    pub fn apply_change(&self, change: &ChangeEvent) {
        if change.flags.contains(PortFlags::BPM) {
            self.set_bpm(change.real_val);
        } else if change.flags.contains(PortFlags::BEATS_PER_BAR) {
            self.set_beats_per_bar(change.ival);
        } else if change.flags.contains(PortFlags::BEAT_UNIT) {
            self.set_beat_unit(change.beat_unit);
        }
    }

    /// Frames per tick, as of the tempo track's last processing.
    pub fn frames_per_tick(&self) -> f64 {
        self.frames_per_tick.load(Ordering::SeqCst)
    }

    pub(crate) fn update_frames_per_tick(&self, sample_rate: u32) {
        let ticks_per_beat = TICKS_PER_QUARTER_NOTE * 4.0 / f64::from(self.beat_unit().value());
        let frames = f64::from(sample_rate) * 60.0 / (f64::from(self.bpm()) * ticks_per_beat);
        self.frames_per_tick.store(frames, Ordering::SeqCst);
    }
}
