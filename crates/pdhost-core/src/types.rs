//! Core identifiers and constants shared by every host component

use std::fmt;

/// Identifier of an engine instance (caller-assigned or registry-issued)
pub type InstanceId = u32;

/// Instance-scoped handle of an open patch, issued by the engine at open time
pub type PatchId = u32;

/// Default sample rate when the host configuration does not override it
pub const DEFAULT_SAMPLE_RATE: u32 = 44100;

/// Default channel count for engine audio I/O (stereo in, stereo out)
pub const DEFAULT_CHANNELS: u32 = 2;

/// Frames processed by the engine per tick (Pure Data block size)
pub const ENGINE_BLOCK_FRAMES: usize = 64;

/// Largest array length a float size message carries exactly (2^24)
pub const MAX_ARRAY_LENGTH: usize = 1 << 24;

/// Lifecycle of an engine instance
///
/// ```text
/// Uninitialized ──init──► Suspended ◄──compute──► Computing
///                              │                      │
///                              └──────release─────────┴──► Released
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceState {
    /// Id reserved, engine startup still running in the background
    Uninitialized,
    /// Initialized and processing audio
    Computing,
    /// Initialized, audio processing disabled
    Suspended,
    /// Destroyed; no further operation is accepted
    Released,
}

impl InstanceState {
    /// Patches, messages and buffers are only accepted in these states
    pub fn is_live(self) -> bool {
        matches!(self, Self::Computing | Self::Suspended)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Computing => write!(f, "computing"),
            Self::Suspended => write!(f, "suspended"),
            Self::Released => write!(f, "released"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_states() {
        assert!(InstanceState::Computing.is_live());
        assert!(InstanceState::Suspended.is_live());
        assert!(!InstanceState::Uninitialized.is_live());
        assert!(!InstanceState::Released.is_live());
    }

    #[test]
    fn test_max_array_length_is_exact_as_float() {
        let len = MAX_ARRAY_LENGTH as f32;
        assert_eq!(len as usize, MAX_ARRAY_LENGTH);
        assert_eq!((MAX_ARRAY_LENGTH + 1) as f32 as usize, MAX_ARRAY_LENGTH);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(InstanceState::Suspended.to_string(), "suspended");
    }
}
