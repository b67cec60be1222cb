use std::sync::Arc;

use crate::port::{ControlRange, Port, PortFlags, PortFlow, PortIdAllocator, PortOwner, PortType};
use crate::processors::fader::{FaderType, SignalPorts};
use crate::processors::TrackId;
use crate::time::EngineProcessTimeInfo;

/// Number of send slots per channel.
pub const CHANNEL_SEND_SLOTS: usize = 9;

/// Sends a copy of a channel's signal to another track's input.
pub struct ChannelSend {
    track: TrackId,
    slot: usize,
    prefader: bool,
    signal: SignalPorts,
    amount: Arc<Port>,
    enabled: Arc<Port>,
}

impl ChannelSend {
    pub(crate) fn new(
        track: TrackId,
        slot: usize,
        kind: FaderType,
        prefader: bool,
        ids: &mut PortIdAllocator,
    ) -> Self {
        let owner = PortOwner::ChannelSend { track, slot };
        let name = format!("Send {}", slot + 1);
        let signal = SignalPorts::new(kind, owner, &name, PortFlags::NONE, ids);
        let amount = Arc::new(
            Port::new(ids.next(), format!("{} amount", name), PortType::Control, PortFlow::Input, owner)
                .with_range(ControlRange::new(0.0, 2.0, 1.0))
                .with_flags(PortFlags::AUTOMATABLE),
        );
        let enabled = Arc::new(
            Port::new(ids.next(), format!("{} enabled", name), PortType::Control, PortFlow::Input, owner)
                .with_range(ControlRange::new(0.0, 1.0, 1.0))
                .with_flags(PortFlags::AUTOMATABLE),
        );

        Self {
            track,
            slot,
            prefader,
            signal,
            amount,
            enabled,
        }
    }

    pub fn track(&self) -> TrackId {
        self.track
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Whether the send taps the signal before the fader.
    pub fn is_prefader(&self) -> bool {
        self.prefader
    }

    pub fn signal(&self) -> &SignalPorts {
        &self.signal
    }

    pub fn amount(&self) -> &Arc<Port> {
        &self.amount
    }

    pub fn enabled(&self) -> &Arc<Port> {
        &self.enabled
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.control_value() >= 0.5
    }

    pub fn ports(&self) -> impl Iterator<Item = &Arc<Port>> {
        self.signal.ports().chain([&self.amount, &self.enabled])
    }

    pub(crate) fn process(&self, time: &EngineProcessTimeInfo) {
        let enabled = self.is_enabled();
        match &self.signal {
            SignalPorts::Stereo { input, output } => {
                let amount = self.amount.control_value();
                for (src, dst) in [(&input.l, &output.l), (&input.r, &output.r)] {
                    if !enabled {
                        dst.clear_buffer(time);
                        continue;
                    }
                    dst.copy_from(src, time);
                    dst.write_audio(|buf| {
                        if let Some(region) = buf.get_mut(time.range()) {
                            region.iter_mut().for_each(|s| *s *= amount);
                        }
                    });
                }
            }
            SignalPorts::Midi { input, output } => {
                if enabled {
                    output.copy_from(input, time);
                } else {
                    output.clear_buffer(time);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_send_is_silent() {
        let send = ChannelSend::new(TrackId(1), 0, FaderType::AudioChannel, false, &mut PortIdAllocator::default());
        for port in send.ports() {
            port.allocate_bufs(4);
        }
        let SignalPorts::Stereo { input, output } = send.signal() else {
            panic!("expected stereo send");
        };
        input.l.write_audio(|buf| buf.fill(1.0));
        send.amount().set_control_value(0.5);
        let time = EngineProcessTimeInfo::new(0, 0, 4);

        send.process(&time);
        output.l.read_audio(|buf| assert_eq!(buf, &[0.5; 4]));

        send.enabled().set_control_value(0.0);
        send.process(&time);
        output.l.read_audio(|buf| assert_eq!(buf, &[0.0; 4]));
    }
}
