//! Real-time audio routing graph.
//!
//! A [`Project`] holds tracks, their mixer channels, plugins and the port
//! connections between them. Its [`AudioEngine`] owns a [`Router`], which
//! turns the project into a dependency graph of processing nodes and runs
//! that graph once per audio callback on a pool of worker threads.
//!
//! ```
//! use routegraph::plugin::PassThrough;
//! use routegraph::processors::TrackType;
//! use routegraph::{EngineConfig, Project};
//!
//! let config = EngineConfig::default()
//!     .with_num_threads(1)
//!     .with_strict_validation(false);
//! let mut project = Project::new(config).unwrap();
//!
//! let track = project.add_track(TrackType::Audio, "Audio 1").unwrap();
//! project
//!     .insert_plugin(track, 0, &PassThrough::descriptor(), Box::new(PassThrough::with_latency(64)))
//!     .unwrap();
//! project.recalc_graph(false).unwrap();
//!
//! let engine = project.engine();
//! assert!(engine.process(256).is_processed());
//! assert_eq!(engine.router().get_max_route_playback_latency(), 64);
//! ```

pub mod config;
pub mod connections;
#[cfg(feature = "cpal_backend")]
pub mod device;
pub mod engine;
pub mod error;
pub mod graph;
pub mod plugin;
pub mod port;
pub mod processors;
pub mod project;
pub mod router;
mod sync;
pub mod time;

pub use config::EngineConfig;
#[cfg(feature = "cpal_backend")]
pub use device::CpalDevice;
pub use engine::{AudioEngine, EngineState, PlayState, Transport};
pub use error::{Error, GraphError, PluginError, Result};
pub use graph::{Graph, GraphNode, GraphNodes, NodeKey, NodeKind};
pub use plugin::{PluginDescriptor, PluginId, PluginInstance};
pub use port::{ChangeEvent, Port, PortFlags, PortId};
pub use project::{Project, Tracklist};
pub use router::{CycleOutcome, NodeErrorReport, Router};
pub use sync::SemaphoreGuard;
pub use time::{EngineProcessTimeInfo, ProcessContext};
