//! Error types.

use std::time::Duration;

use thiserror::Error;

use crate::graph::NodeKey;
use crate::port::PortId;
use crate::processors::{TrackId, TrackType};

/// Structural problems found while building the processing graph.
///
/// These are rejected during [`Graph::setup`](crate::graph::Graph::setup); the
/// previously installed graph stays live.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Dependency cycle through {0}")]
    Cycle(NodeKey),

    #[error("Stale reference: {0}")]
    StaleReference(String),

    #[error("Connection references unknown port {0}")]
    UnknownPort(PortId),

    #[error("Graph has no staged nodes to rechain")]
    NotSetUp,
}

/// Error type for non-real-time operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("Running cycle did not finish within {0:?}, rebuild abandoned")]
    QuiesceTimeout(Duration),

    #[error("Failed to spawn graph thread: {0}")]
    ThreadSpawn(#[from] std::io::Error),

    #[error("Ports {src} -> {dest} cannot be connected")]
    InvalidConnection { src: PortId, dest: PortId },

    #[error("Unknown track {0}")]
    UnknownTrack(TrackId),

    #[error("Track {0} has no channel")]
    NoChannel(TrackId),

    #[error("Invalid slot {slot} on track {track}")]
    InvalidSlot { track: TrackId, slot: usize },

    #[error("Project already has a {0:?} track")]
    SingletonTrack(TrackType),

    #[error("Track {0} cannot be removed")]
    PermanentTrack(TrackId),

    #[error("Track {0} is not a modulator track")]
    NotModulatorTrack(TrackId),

    #[cfg(feature = "cpal_backend")]
    #[error("No output device available")]
    NoDevice,

    #[cfg(feature = "cpal_backend")]
    #[error("Audio device not available")]
    DeviceNotAvailable(#[from] cpal::DefaultStreamConfigError),

    #[cfg(feature = "cpal_backend")]
    #[error("Failed to build audio stream")]
    BuildStream(#[from] cpal::BuildStreamError),

    #[cfg(feature = "cpal_backend")]
    #[error("Failed to play audio stream")]
    PlayStream(#[from] cpal::PlayStreamError),
}

/// Result type alias.
pub type Result<T> = core::result::Result<T, Error>;

/// Runtime failure reported by a processing node.
///
/// Never crosses the real-time boundary as a panic: the worker records it on
/// the node and the router hands it to the UI after the cycle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct PluginError(pub String);

impl PluginError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}
