//! The objects a project is made of and the graph schedules.

pub mod channel;
pub mod channel_send;
pub mod fader;
pub mod modulator;
pub mod tempo;
pub mod track;

pub use channel::{Channel, STRIP_SIZE};
pub use channel_send::{ChannelSend, CHANNEL_SEND_SLOTS};
pub use fader::{Fader, FaderControls, FaderType, SignalPorts};
pub use modulator::{ModulatorMacroProcessor, NUM_MODULATOR_MACROS};
pub use tempo::TempoTrack;
pub use track::{Track, TrackId, TrackProcessor, TrackType};
