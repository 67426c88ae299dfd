//! Boundary with the embedded Pure Data engine
//!
//! Every call into the engine goes through [`EngineBackend`]. The engine
//! reports nothing but success flags, so each method returns `bool` (or an
//! optional patch id) and the host turns failures into [`crate::HostError`]s.
//!
//! Inbound traffic flows the other way through a [`HandlerTable`] that the
//! host installs exactly once when it is constructed.
//!
//! # Backends
//!
//! - [`SimEngine`] - in-process stand-in that records calls; used by tests
//!   and by headless demo runs
//! - `LibPdEngine` - libpd-rs backend (cargo feature `libpd`)

mod handlers;
mod sim;
#[cfg(feature = "libpd")]
mod libpd;

use std::path::Path;

use crate::router::Atom;
use crate::types::{InstanceId, PatchId};

pub use handlers::{log_engine_print, HandlerTable};
pub use sim::{EngineCall, SimEngine, DEFAULT_CALL_LOG_LIMIT};
#[cfg(feature = "libpd")]
pub use libpd::LibPdEngine;

/// Calls the host makes into an engine implementation
///
/// Implementations must be callable from any thread. `process` is called
/// from the real-time audio context and must never block.
pub trait EngineBackend: Send + Sync {
    /// Human readable backend name for logs
    fn name(&self) -> &'static str;

    /// Install the process-wide inbound handler table (succeeds once)
    fn install_handlers(&self, handlers: HandlerTable) -> bool;

    fn create(&self, instance: InstanceId) -> bool;

    fn init(&self, instance: InstanceId, sample_rate: u32, inputs: u32, outputs: u32) -> bool;

    fn release(&self, instance: InstanceId) -> bool;

    fn release_all(&self) -> bool;

    fn set_compute(&self, instance: InstanceId, enabled: bool) -> bool;

    /// Open `file` located in `dir`; `dir` doubles as the patch search path
    fn open_patch(&self, instance: InstanceId, file: &str, dir: &Path) -> Option<PatchId>;

    fn close_patch(&self, instance: InstanceId, patch: PatchId) -> bool;

    fn close_all_patches(&self, instance: InstanceId) -> bool;

    fn send_bang(&self, instance: InstanceId, dest: &str) -> bool;

    fn send_float(&self, instance: InstanceId, dest: &str, value: f32) -> bool;

    fn send_symbol(&self, instance: InstanceId, dest: &str, symbol: &str) -> bool;

    fn send_list(&self, instance: InstanceId, dest: &str, atoms: &[Atom]) -> bool;

    fn send_message(&self, instance: InstanceId, dest: &str, selector: &str, atoms: &[Atom])
        -> bool;

    fn send_note_on(&self, instance: InstanceId, channel: i32, pitch: i32) -> bool;

    /// Write samples into a previously sized array
    fn write_array(&self, instance: InstanceId, name: &str, samples: &[f32]) -> bool;

    fn subscribe(&self, instance: InstanceId, source: &str) -> bool;

    fn unsubscribe(&self, instance: InstanceId, source: &str) -> bool;

    /// Deliver queued inbound messages for `instance` through the handler table
    fn poll(&self, _instance: InstanceId) -> bool {
        true
    }

    /// Pull one block of interleaved audio. Returns false when nothing was
    /// computed; the caller is responsible for silencing `output`.
    fn process(
        &self,
        instance: InstanceId,
        input: &[f32],
        output: &mut [f32],
        channels: usize,
    ) -> bool;
}
