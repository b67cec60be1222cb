use std::sync::Arc;

use crate::port::{ControlRange, Port, PortFlags, PortFlow, PortIdAllocator, PortOwner, PortType, StereoPorts};
use crate::processors::TrackId;
use crate::time::EngineProcessTimeInfo;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FaderType {
    AudioChannel,
    MidiChannel,
}

/// Input/output ports of a processor carrying either stereo audio or events.
#[derive(Clone, Debug)]
pub enum SignalPorts {
    Stereo { input: StereoPorts, output: StereoPorts },
    Midi { input: Arc<Port>, output: Arc<Port> },
}

impl SignalPorts {
    pub(crate) fn new(
        kind: FaderType,
        owner: PortOwner,
        name: &str,
        out_flags: PortFlags,
        ids: &mut PortIdAllocator,
    ) -> Self {
        let port = |ids: &mut PortIdAllocator, label: String, kind: PortType, flow: PortFlow| {
            let flags = if flow == PortFlow::Output { out_flags } else { PortFlags::NONE };
            Arc::new(Port::new(ids.next(), label, kind, flow, owner).with_flags(flags))
        };
        match kind {
            FaderType::AudioChannel => SignalPorts::Stereo {
                input: StereoPorts {
                    l: port(ids, format!("{} stereo in L", name), PortType::Audio, PortFlow::Input),
                    r: port(ids, format!("{} stereo in R", name), PortType::Audio, PortFlow::Input),
                },
                output: StereoPorts {
                    l: port(ids, format!("{} stereo out L", name), PortType::Audio, PortFlow::Output),
                    r: port(ids, format!("{} stereo out R", name), PortType::Audio, PortFlow::Output),
                },
            },
            FaderType::MidiChannel => SignalPorts::Midi {
                input: port(ids, format!("{} midi in", name), PortType::Event, PortFlow::Input),
                output: port(ids, format!("{} midi out", name), PortType::Event, PortFlow::Output),
            },
        }
    }

    pub fn inputs(&self) -> Vec<&Arc<Port>> {
        match self {
            SignalPorts::Stereo { input, .. } => vec![&input.l, &input.r],
            SignalPorts::Midi { input, .. } => vec![input],
        }
    }

    pub fn outputs(&self) -> Vec<&Arc<Port>> {
        match self {
            SignalPorts::Stereo { output, .. } => vec![&output.l, &output.r],
            SignalPorts::Midi { output, .. } => vec![output],
        }
    }

    pub fn ports(&self) -> impl Iterator<Item = &Arc<Port>> {
        self.inputs().into_iter().chain(self.outputs())
    }

    /// Copy inputs to outputs unchanged.
    pub(crate) fn pass_through(&self, time: &EngineProcessTimeInfo) {
        match self {
            SignalPorts::Stereo { input, output } => {
                output.l.copy_from(&input.l, time);
                output.r.copy_from(&input.r, time);
            }
            SignalPorts::Midi { input, output } => output.copy_from(input, time),
        }
    }
}

/// Gain, balance and mute controls of a post-fader.
#[derive(Clone, Debug)]
pub struct FaderControls {
    pub amp: Arc<Port>,
    pub balance: Arc<Port>,
    pub mute: Arc<Port>,
}

/// A channel's prefader (pass-through tap point) or fader.
pub struct Fader {
    track: TrackId,
    kind: FaderType,
    signal: SignalPorts,
    controls: Option<FaderControls>,
}

impl Fader {
    pub(crate) fn new(track: TrackId, kind: FaderType, prefader: bool, ids: &mut PortIdAllocator) -> Self {
        Self::with_output_flags(track, kind, prefader, PortFlags::NONE, ids)
    }

    pub(crate) fn with_output_flags(
        track: TrackId,
        kind: FaderType,
        prefader: bool,
        out_flags: PortFlags,
        ids: &mut PortIdAllocator,
    ) -> Self {
        let (owner, name) = if prefader {
            (PortOwner::Prefader(track), "Prefader")
        } else {
            (PortOwner::Fader(track), "Fader")
        };
        let signal = SignalPorts::new(kind, owner, name, out_flags, ids);
        let controls = (!prefader).then(|| {
            let control = |ids: &mut PortIdAllocator, label: &str, range: ControlRange| {
                Arc::new(
                    Port::new(ids.next(), label, PortType::Control, PortFlow::Input, owner)
                        .with_range(range)
                        .with_flags(PortFlags::AUTOMATABLE),
                )
            };
            FaderControls {
                amp: control(ids, "Volume", ControlRange::new(0.0, 2.0, 1.0)),
                balance: control(ids, "Balance", ControlRange::new(0.0, 1.0, 0.5)),
                mute: control(ids, "Mute", ControlRange::new(0.0, 1.0, 0.0)),
            }
        });

        Self {
            track,
            kind,
            signal,
            controls,
        }
    }

    pub fn track(&self) -> TrackId {
        self.track
    }

    pub fn kind(&self) -> FaderType {
        self.kind
    }

    pub fn is_prefader(&self) -> bool {
        self.controls.is_none()
    }

    pub fn signal(&self) -> &SignalPorts {
        &self.signal
    }

    pub fn controls(&self) -> Option<&FaderControls> {
        self.controls.as_ref()
    }

    pub fn ports(&self) -> impl Iterator<Item = &Arc<Port>> {
        let controls = self
            .controls
            .iter()
            .flat_map(|c| [&c.amp, &c.balance, &c.mute]);
        self.signal.ports().chain(controls)
    }

    /// Per-side gains for the current control values.
    ///
    /// Balance at 0.5 leaves both sides at `amp`; moving it attenuates the
    /// opposite side linearly down to silence at the extremes.
    pub fn gains(&self) -> (f32, f32) {
        let Some(controls) = &self.controls else {
            return (1.0, 1.0);
        };
        if controls.mute.control_value() >= 0.5 {
            return (0.0, 0.0);
        }
        let amp = controls.amp.control_value();
        let balance = controls.balance.control_value();
        let l = amp * (2.0 * (1.0 - balance)).min(1.0);
        let r = amp * (2.0 * balance).min(1.0);
        (l, r)
    }

    pub(crate) fn process(&self, time: &EngineProcessTimeInfo) {
        if self.controls.is_none() {
            self.signal.pass_through(time);
            return;
        }

        match &self.signal {
            SignalPorts::Stereo { input, output } => {
                let (gain_l, gain_r) = self.gains();
                for (src, dst, gain) in [(&input.l, &output.l, gain_l), (&input.r, &output.r, gain_r)] {
                    dst.copy_from(src, time);
                    dst.write_audio(|buf| {
                        if let Some(region) = buf.get_mut(time.range()) {
                            region.iter_mut().for_each(|s| *s *= gain);
                        }
                    });
                }
            }
            SignalPorts::Midi { input, output } => {
                let muted = self
                    .controls
                    .as_ref()
                    .map_or(false, |c| c.mute.control_value() >= 0.5);
                if muted {
                    output.clear_buffer(time);
                } else {
                    output.copy_from(input, time);
                }
            }
        }
    }
}
