use core::fmt;
use std::sync::Arc;

use crate::plugin::Plugin;
use crate::port::{Port, PortFlags, PortIdAllocator, PortOwner, PortType};
use crate::processors::channel::Channel;
use crate::processors::fader::{FaderType, SignalPorts};
use crate::processors::modulator::{ModulatorMacroProcessor, NUM_MODULATOR_MACROS};
use crate::processors::tempo::TempoTrack;
use crate::time::ProcessContext;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct TrackId(pub(crate) u32);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "track#{}", self.0)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum TrackType {
    Audio,
    Midi,
    AudioBus,
    Master,
    Tempo,
    Modulator,
}

impl TrackType {
    /// Signal type flowing through the track processor and channel.
    pub fn signal_type(self) -> Option<PortType> {
        match self {
            TrackType::Audio | TrackType::AudioBus | TrackType::Master => Some(PortType::Audio),
            TrackType::Midi => Some(PortType::Event),
            TrackType::Tempo | TrackType::Modulator => None,
        }
    }

    pub fn has_channel(self) -> bool {
        self.signal_type().is_some()
    }

    fn fader_type(self) -> Option<FaderType> {
        match self.signal_type()? {
            PortType::Event => Some(FaderType::MidiChannel),
            _ => Some(FaderType::AudioChannel),
        }
    }
}

/// The part of a track the graph schedules as the track node.
///
/// Passes the track input to the track output, or, for the tempo track,
/// refreshes the cached frames-per-tick.
pub struct TrackProcessor {
    track: TrackId,
    kind: TrackType,
    signal: Option<SignalPorts>,
    tempo: Option<TempoTrack>,
}

impl TrackProcessor {
    pub fn track(&self) -> TrackId {
        self.track
    }

    pub fn kind(&self) -> TrackType {
        self.kind
    }

    pub fn signal(&self) -> Option<&SignalPorts> {
        self.signal.as_ref()
    }

    pub fn tempo(&self) -> Option<&TempoTrack> {
        self.tempo.as_ref()
    }

    pub fn ports(&self) -> Vec<&Arc<Port>> {
        let mut ports: Vec<&Arc<Port>> = self.signal.iter().flat_map(|s| s.ports()).collect();
        ports.extend(self.tempo.iter().flat_map(|t| t.ports()));
        ports
    }

    pub(crate) fn process(&self, ctx: &ProcessContext) {
        if let Some(tempo) = &self.tempo {
            tempo.update_frames_per_tick(ctx.sample_rate);
        }
        if let Some(signal) = &self.signal {
            signal.pass_through(&ctx.time);
        }
    }
}

pub struct Track {
    id: TrackId,
    name: String,
    kind: TrackType,
    pub(crate) processor: Arc<TrackProcessor>,
    pub(crate) channel: Option<Channel>,
    pub(crate) modulators: Vec<Arc<Plugin>>,
    pub(crate) macros: Vec<Arc<ModulatorMacroProcessor>>,
}

impl Track {
    pub(crate) fn new(id: TrackId, kind: TrackType, name: impl Into<String>, ids: &mut PortIdAllocator) -> Self {
        let name = name.into();
        let signal = kind
            .fader_type()
            .map(|ft| SignalPorts::new(ft, PortOwner::Track(id), &name, PortFlags::NONE, ids));
        let tempo = (kind == TrackType::Tempo).then(|| TempoTrack::new(id, ids));
        let channel = kind
            .fader_type()
            .map(|ft| Channel::new(id, ft, kind == TrackType::Master, ids));
        let macros = if kind == TrackType::Modulator {
            (0..NUM_MODULATOR_MACROS)
                .map(|i| Arc::new(ModulatorMacroProcessor::new(id, i, ids)))
                .collect()
        } else {
            Vec::new()
        };

        Self {
            id,
            name,
            kind,
            processor: Arc::new(TrackProcessor {
                track: id,
                kind,
                signal,
                tempo,
            }),
            channel,
            modulators: Vec::new(),
            macros,
        }
    }

    pub fn id(&self) -> TrackId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TrackType {
        self.kind
    }

    pub fn processor(&self) -> &Arc<TrackProcessor> {
        &self.processor
    }

    pub fn channel(&self) -> Option<&Channel> {
        self.channel.as_ref()
    }

    pub fn tempo(&self) -> Option<&TempoTrack> {
        self.processor.tempo()
    }

    /// Live modulator plugins (modulator tracks only).
    pub fn modulators(&self) -> impl Iterator<Item = &Arc<Plugin>> {
        self.modulators.iter().filter(|pl| !pl.is_deleting())
    }

    pub fn macros(&self) -> &[Arc<ModulatorMacroProcessor>] {
        &self.macros
    }

    /// Every port owned by the track, its channel and its plugins.
    pub fn ports(&self) -> Vec<&Arc<Port>> {
        let mut ports = self.processor.ports();
        if let Some(channel) = &self.channel {
            ports.extend(channel.ports());
        }
        ports.extend(self.modulators().flat_map(|pl| pl.ports()));
        ports.extend(self.macros.iter().flat_map(|m| m.ports()));
        ports
    }
}

impl fmt::Debug for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Track")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_track_layout() {
        let track = Track::new(TrackId(2), TrackType::Audio, "Audio 1", &mut PortIdAllocator::default());
        let channel = track.channel().unwrap();
        assert!(channel.prefader().is_prefader());
        assert!(!channel.fader().is_prefader());
        // 4 processor + 4 prefader + 4 fader signal + 3 fader controls
        assert_eq!(track.ports().len(), 15);
        assert_eq!(channel.external_outputs().count(), 0);
    }

    #[test]
    fn master_fader_is_exposed() {
        let track = Track::new(TrackId(1), TrackType::Master, "Master", &mut PortIdAllocator::default());
        assert_eq!(track.channel().unwrap().external_outputs().count(), 2);
    }

    #[test]
    fn tempo_and_modulator_tracks_have_no_channel() {
        let mut ids = PortIdAllocator::default();
        let tempo = Track::new(TrackId(0), TrackType::Tempo, "Tempo", &mut ids);
        assert!(tempo.channel().is_none());
        assert_eq!(tempo.ports().len(), 3);

        let modulators = Track::new(TrackId(3), TrackType::Modulator, "Modulators", &mut ids);
        assert!(modulators.channel().is_none());
        assert_eq!(modulators.macros().len(), NUM_MODULATOR_MACROS);
    }
}
