//! pdhost core - host layer for embedded Pure Data engine instances
//!
//! The engine itself stays external behind [`engine::EngineBackend`]; this
//! crate manages instances, routes messages in both directions, opens and
//! closes patches, and fills sample arrays.

pub mod audio;
pub mod buffer;
pub mod config;
pub mod engine;
pub mod error;
pub mod host;
pub mod patch;
pub mod pending;
pub mod registry;
pub mod router;
pub mod types;

pub use audio::AudioTap;
pub use buffer::{BufferBridge, SampleBuffer};
pub use config::HostConfig;
pub use error::{HostError, HostResult};
pub use host::PatchHost;
pub use patch::{CloseAllReport, Patch, PatchManager, PatchRef};
pub use pending::{Pending, PendingInstance, PendingPatch};
pub use router::{Atom, InboundMessage, Message, MessageRouter, Payload};
pub use types::*;
