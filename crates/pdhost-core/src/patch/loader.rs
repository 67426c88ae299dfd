//! PatchLoader - background service that materializes and opens patches
//!
//! Runs on a dedicated thread so asset I/O never stalls a control loop.
//! Commands arrive over a crossbeam channel and each open replies through
//! its own oneshot channel.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use tokio::sync::oneshot;

use super::{open_file, PatchRef};
use crate::error::{HostError, HostResult};
use crate::host::HostShared;
use crate::types::{InstanceId, PatchId};

pub(crate) enum LoaderCommand {
    Open {
        instance: InstanceId,
        patch: PatchRef,
        reply: oneshot::Sender<HostResult<PatchId>>,
    },
    Shutdown,
}

/// Handle to the running loader thread
pub(crate) struct LoaderHandle {
    command_tx: Sender<LoaderCommand>,
    thread_handle: Option<JoinHandle<()>>,
}

impl LoaderHandle {
    pub(crate) fn sender(&self) -> Sender<LoaderCommand> {
        self.command_tx.clone()
    }

    /// Stop the thread after it finishes queued commands
    pub(crate) fn shutdown(&mut self) {
        let Some(handle) = self.thread_handle.take() else {
            return;
        };
        let _ = self.command_tx.send(LoaderCommand::Shutdown);
        if handle.thread().id() != thread::current().id() {
            let _ = handle.join();
        }
    }
}

pub(crate) struct PatchLoader {
    shared: Arc<HostShared>,
    command_rx: Receiver<LoaderCommand>,
}

impl PatchLoader {
    pub(crate) fn spawn(shared: Arc<HostShared>) -> HostResult<LoaderHandle> {
        let (command_tx, command_rx) = channel::unbounded();
        let loader = PatchLoader { shared, command_rx };

        let handle = thread::Builder::new()
            .name("patch-loader".into())
            .spawn(move || loader.run())
            .map_err(|e| {
                HostError::ServiceUnavailable(format!("Failed to spawn patch loader thread: {}", e))
            })?;

        Ok(LoaderHandle {
            command_tx,
            thread_handle: Some(handle),
        })
    }

    fn run(self) {
        log::info!("PatchLoader started");

        while let Ok(cmd) = self.command_rx.recv() {
            match cmd {
                LoaderCommand::Open {
                    instance,
                    patch,
                    reply,
                } => {
                    let result = self.open(instance, &patch);
                    let _ = reply.send(result);
                }
                LoaderCommand::Shutdown => {
                    log::info!("PatchLoader shutting down");
                    break;
                }
            }
        }

        log::info!("PatchLoader stopped");
    }

    fn open(&self, instance: InstanceId, patch: &PatchRef) -> HostResult<PatchId> {
        let path = self.shared.assets.materialize(patch).inspect_err(|e| {
            log::warn!("Instance {}: cannot materialize {}: {}", instance, patch, e)
        })?;

        let (dir, file) = match (path.parent(), path.file_name()) {
            (Some(dir), Some(file)) => (dir.to_path_buf(), file.to_string_lossy().into_owned()),
            _ => {
                return Err(HostError::PatchNotFound {
                    path,
                    reason: "materialized path has no file name".to_string(),
                })
            }
        };

        open_file(&self.shared, instance, &dir, &file)
    }
}
