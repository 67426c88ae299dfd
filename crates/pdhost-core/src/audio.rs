//! Real-time audio pull for one instance
//!
//! An [`AudioTap`] is created on the control thread and moved into the
//! audio callback. `process` reads lock-free flags only; it never waits on
//! the registry or on an instance's control lock.

use std::sync::Arc;

use crate::engine::EngineBackend;
use crate::registry::InstanceSlot;
use crate::types::{InstanceId, ENGINE_BLOCK_FRAMES};

/// Pulls interleaved audio blocks from one engine instance
pub struct AudioTap {
    slot: Arc<InstanceSlot>,
    engine: Arc<dyn EngineBackend>,
    channels: usize,
}

impl AudioTap {
    pub(crate) fn new(
        slot: Arc<InstanceSlot>,
        engine: Arc<dyn EngineBackend>,
        channels: usize,
    ) -> Self {
        Self {
            slot,
            engine,
            channels: channels.max(1),
        }
    }

    pub fn instance(&self) -> InstanceId {
        self.slot.id()
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Interleaved samples per engine tick
    pub fn block_len(&self) -> usize {
        ENGINE_BLOCK_FRAMES * self.channels
    }

    /// Compute one buffer of audio into `output`
    ///
    /// `output.len()` must be a non-zero multiple of [`AudioTap::block_len`].
    /// Returns false, with `output` silenced, when the instance is not
    /// computing, the length is wrong, or the engine produced nothing.
    pub fn process(&self, input: &[f32], output: &mut [f32]) -> bool {
        let block = self.block_len();
        let computed = self.slot.is_computing()
            && !output.is_empty()
            && output.len() % block == 0
            && self
                .engine
                .process(self.slot.id(), input, output, self.channels);

        if !computed {
            output.fill(0.0);
        }
        computed
    }
}

impl std::fmt::Debug for AudioTap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioTap")
            .field("instance", &self.slot.id())
            .field("engine", &self.engine.name())
            .field("channels", &self.channels)
            .finish()
    }
}
