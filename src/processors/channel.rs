use std::sync::Arc;

use crate::plugin::Plugin;
use crate::port::{Port, PortFlags, PortIdAllocator};
use crate::processors::channel_send::{ChannelSend, CHANNEL_SEND_SLOTS};
use crate::processors::fader::{Fader, FaderType};
use crate::processors::TrackId;

/// Number of insert slots per channel.
pub const STRIP_SIZE: usize = 9;

/// Mixer strip of a track: inserts, prefader, fader, sends and the output
/// routing.
///
/// Signal path: track processor out → inserts → prefader → fader → output
/// track's processor input. Sends tap the prefader or fader output.
pub struct Channel {
    pub(crate) prefader: Arc<Fader>,
    pub(crate) fader: Arc<Fader>,
    pub(crate) inserts: [Option<Arc<Plugin>>; STRIP_SIZE],
    pub(crate) sends: [Option<Arc<ChannelSend>>; CHANNEL_SEND_SLOTS],
    pub(crate) output: Option<TrackId>,
}

impl Channel {
    pub(crate) fn new(track: TrackId, kind: FaderType, exposed: bool, ids: &mut PortIdAllocator) -> Self {
        let out_flags = if exposed {
            PortFlags::EXPOSED_TO_BACKEND
        } else {
            PortFlags::NONE
        };
        Self {
            prefader: Arc::new(Fader::new(track, kind, true, ids)),
            fader: Arc::new(Fader::with_output_flags(track, kind, false, out_flags, ids)),
            inserts: std::array::from_fn(|_| None),
            sends: std::array::from_fn(|_| None),
            output: None,
        }
    }

    pub fn prefader(&self) -> &Arc<Fader> {
        &self.prefader
    }

    pub fn fader(&self) -> &Arc<Fader> {
        &self.fader
    }

    pub fn output(&self) -> Option<TrackId> {
        self.output
    }

    pub fn insert(&self, slot: usize) -> Option<&Arc<Plugin>> {
        self.inserts.get(slot).and_then(Option::as_ref)
    }

    /// Live insert plugins in slot order.
    pub fn plugins(&self) -> impl Iterator<Item = &Arc<Plugin>> {
        self.inserts
            .iter()
            .flatten()
            .filter(|pl| !pl.is_deleting())
    }

    pub fn sends(&self) -> impl Iterator<Item = &Arc<ChannelSend>> {
        self.sends.iter().flatten()
    }

    pub fn send(&self, slot: usize) -> Option<&Arc<ChannelSend>> {
        self.sends.get(slot).and_then(Option::as_ref)
    }

    pub fn ports(&self) -> Vec<&Arc<Port>> {
        let mut ports: Vec<&Arc<Port>> = self.prefader.ports().chain(self.fader.ports()).collect();
        ports.extend(self.plugins().flat_map(|pl| pl.ports()));
        ports.extend(self.sends().flat_map(|s| s.ports()));
        ports
    }

    /// Outputs that are exposed to the audio backend.
    pub fn external_outputs(&self) -> impl Iterator<Item = &Arc<Port>> {
        self.fader
            .signal()
            .outputs()
            .into_iter()
            .filter(|p| p.flags().contains(PortFlags::EXPOSED_TO_BACKEND))
    }
}
