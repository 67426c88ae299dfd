//! Audio buffer bridge - fill fixed-size arrays inside a patch
//!
//! Engine arrays cannot be resized implicitly, so loading is two-phase:
//!
//! 1. declare: a float carrying the sample count is sent to the array's
//!    size receiver (`<name>_length` by default)
//! 2. write: the samples are copied into the array
//!
//! Declarations are remembered per instance, so a write with no matching
//! declaration fails with `BufferNotDeclared` before reaching the engine.

mod sample;

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{ensure, HostError, HostResult};
use crate::host::HostShared;
use crate::registry::InstanceData;
use crate::types::{InstanceId, MAX_ARRAY_LENGTH};

pub use sample::SampleBuffer;

/// Array sizes declared on one instance
#[derive(Debug, Default)]
pub struct BufferTable {
    declared: BTreeMap<String, usize>,
}

impl BufferTable {
    pub fn declare(&mut self, name: &str, length: usize) {
        self.declared.insert(name.to_string(), length);
    }

    pub fn length(&self, name: &str) -> Option<usize> {
        self.declared.get(name).copied()
    }

    pub fn clear(&mut self) {
        self.declared.clear();
    }
}

/// Loads sample data into engine arrays
#[derive(Clone)]
pub struct BufferBridge {
    shared: Arc<HostShared>,
}

impl BufferBridge {
    pub(crate) fn new(shared: Arc<HostShared>) -> Self {
        Self { shared }
    }

    /// Size destination used by [`BufferBridge::load_buffer`] for `name`
    pub fn length_destination(&self, name: &str) -> String {
        format!("{}{}", name, self.shared.config.length_suffix)
    }

    /// Declare the size of `name` and write `samples` into it
    pub fn load_buffer(&self, instance: InstanceId, name: &str, samples: &[f32]) -> HostResult<()> {
        let length_dest = self.length_destination(name);
        self.load_buffer_to(instance, name, &length_dest, samples)
    }

    /// Like [`BufferBridge::load_buffer`] with an explicit size destination
    pub fn load_buffer_to(
        &self,
        instance: InstanceId,
        name: &str,
        length_dest: &str,
        samples: &[f32],
    ) -> HostResult<()> {
        self.shared.registry.with_live(instance, |_, data| {
            self.declare_locked(instance, data, name, length_dest, samples.len())?;
            self.write_locked(instance, data, name, samples)
        })
    }

    pub fn load_sample(&self, instance: InstanceId, buffer: &SampleBuffer) -> HostResult<()> {
        self.load_buffer(instance, &buffer.name, &buffer.samples)
    }

    /// Phase one: size `name` to `length` samples via `length_dest`
    pub fn declare(
        &self,
        instance: InstanceId,
        name: &str,
        length_dest: &str,
        length: usize,
    ) -> HostResult<()> {
        self.shared.registry.with_live(instance, |_, data| {
            self.declare_locked(instance, data, name, length_dest, length)
        })
    }

    /// Phase two: fill a declared array; the length must match exactly
    pub fn write(&self, instance: InstanceId, name: &str, samples: &[f32]) -> HostResult<()> {
        self.shared
            .registry
            .with_live(instance, |_, data| self.write_locked(instance, data, name, samples))
    }

    pub fn declared_length(&self, instance: InstanceId, name: &str) -> HostResult<Option<usize>> {
        self.shared
            .registry
            .with_live(instance, |_, data| Ok(data.buffers.length(name)))
    }

    fn declare_locked(
        &self,
        instance: InstanceId,
        data: &mut InstanceData,
        name: &str,
        length_dest: &str,
        length: usize,
    ) -> HostResult<()> {
        // No zero-length arrays; sizes above 2^24 would round as f32
        ensure(length > 0 && length <= MAX_ARRAY_LENGTH, || {
            HostError::BufferNotDeclared {
                instance,
                name: name.to_string(),
                length,
            }
        })?;

        let ok = self
            .shared
            .engine
            .send_float(instance, length_dest, length as f32);
        ensure(ok, || HostError::UnknownDestination {
            instance,
            destination: length_dest.to_string(),
        })?;

        data.buffers.declare(name, length);
        log::debug!(
            "Instance {}: declared '{}' with {} samples via '{}'",
            instance,
            name,
            length,
            length_dest
        );
        Ok(())
    }

    fn write_locked(
        &self,
        instance: InstanceId,
        data: &mut InstanceData,
        name: &str,
        samples: &[f32],
    ) -> HostResult<()> {
        let not_declared = || HostError::BufferNotDeclared {
            instance,
            name: name.to_string(),
            length: samples.len(),
        };

        let declared = data.buffers.length(name);
        ensure(!samples.is_empty() && declared == Some(samples.len()), not_declared)?;
        ensure(
            self.shared.engine.write_array(instance, name, samples),
            not_declared,
        )?;

        log::debug!("Instance {}: wrote {} samples to '{}'", instance, samples.len(), name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_table() {
        let mut table = BufferTable::default();
        assert_eq!(table.length("sample0"), None);
        table.declare("sample0", 128);
        table.declare("sample0", 64);
        assert_eq!(table.length("sample0"), Some(64));
        table.clear();
        assert_eq!(table.length("sample0"), None);
    }
}
