//! PatchHost - process-wide façade over engine instances
//!
//! Owns the engine backend, the instance registry and the patch-loader
//! service, and hands out the component APIs:
//!
//! - [`MessageRouter`] via [`PatchHost::router`]
//! - [`PatchManager`] via [`PatchHost::patches`]
//! - [`BufferBridge`] via [`PatchHost::buffers`]
//! - [`AudioTap`] via [`PatchHost::audio_tap`]
//!
//! Instance initialization can take a while (the engine loads its
//! externals, sets up DSP), so [`PatchHost::create`] reserves the id
//! immediately and finishes on a background thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use crate::audio::AudioTap;
use crate::buffer::BufferBridge;
use crate::config::HostConfig;
use crate::engine::{EngineBackend, HandlerTable};
use crate::error::{ensure, HostError, HostResult};
use crate::patch::loader::{LoaderHandle, PatchLoader};
use crate::patch::{AssetSource, PatchManager};
use crate::pending::PendingInstance;
use crate::registry::{dispatching_instance, InstanceRegistry, InstanceSlot};
use crate::router::{self, MessageRouter};
use crate::types::{InstanceId, InstanceState};

/// State shared by every component handle
pub(crate) struct HostShared {
    pub(crate) engine: Arc<dyn EngineBackend>,
    pub(crate) registry: Arc<InstanceRegistry>,
    pub(crate) assets: Arc<dyn AssetSource>,
    pub(crate) config: HostConfig,
}

/// Tears the host down when the last `PatchHost` clone goes away
struct HostLifetime {
    shared: Arc<HostShared>,
    loader: Mutex<LoaderHandle>,
    stopped: AtomicBool,
}

impl HostLifetime {
    fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        log::info!("Shutting down patch host");

        self.loader
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .shutdown();

        if let Err(e) = release_all(&self.shared) {
            log::warn!("Release during shutdown failed: {}", e);
        }
    }
}

impl Drop for HostLifetime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Host for embedded Pure Data engine instances
///
/// Cheap to clone; all clones share the same instances.
#[derive(Clone)]
pub struct PatchHost {
    shared: Arc<HostShared>,
    lifetime: Arc<HostLifetime>,
    router: MessageRouter,
    patches: PatchManager,
    buffers: BufferBridge,
}

impl PatchHost {
    /// Create a host whose assets come from `config.assets`
    pub fn new(engine: Arc<dyn EngineBackend>, config: HostConfig) -> HostResult<Self> {
        let assets = config.assets.source();
        Self::with_assets(engine, config, assets)
    }

    /// Create a host with a custom asset source
    pub fn with_assets(
        engine: Arc<dyn EngineBackend>,
        config: HostConfig,
        assets: Arc<dyn AssetSource>,
    ) -> HostResult<Self> {
        let registry = Arc::new(InstanceRegistry::new());

        let dispatch_registry = registry.clone();
        let handlers = HandlerTable::routing(move |msg| router::dispatch(&dispatch_registry, msg));
        if !engine.install_handlers(handlers) {
            return Err(HostError::ServiceUnavailable(format!(
                "{} engine already has inbound handlers installed",
                engine.name()
            )));
        }

        let shared = Arc::new(HostShared {
            engine,
            registry,
            assets,
            config,
        });
        let loader = PatchLoader::spawn(shared.clone())?;

        log::info!(
            "Patch host ready ({} engine, {} Hz default)",
            shared.engine.name(),
            shared.config.sample_rate
        );

        Ok(Self {
            router: MessageRouter::new(shared.clone()),
            patches: PatchManager::new(shared.clone(), loader.sender()),
            buffers: BufferBridge::new(shared.clone()),
            lifetime: Arc::new(HostLifetime {
                shared: shared.clone(),
                loader: Mutex::new(loader),
                stopped: AtomicBool::new(false),
            }),
            shared,
        })
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    pub fn patches(&self) -> &PatchManager {
        &self.patches
    }

    pub fn buffers(&self) -> &BufferBridge {
        &self.buffers
    }

    pub fn config(&self) -> &HostConfig {
        &self.shared.config
    }

    pub fn engine_name(&self) -> &'static str {
        self.shared.engine.name()
    }

    // ------------------------------------------------------------------
    // Instance lifecycle
    // ------------------------------------------------------------------

    /// Create instance `id`; fails with `AlreadyExists` if the id is taken
    ///
    /// The id is reserved before this returns. The engine is initialized on
    /// a background thread and the instance ends up `Suspended`.
    pub fn create(&self, id: InstanceId, sample_rate: u32) -> HostResult<PendingInstance> {
        self.ensure_running()?;
        let slot = self.shared.registry.reserve(id, sample_rate)?;
        self.spawn_init(slot)
    }

    /// Create an instance under the lowest unused id
    pub fn create_next(&self, sample_rate: u32) -> HostResult<PendingInstance> {
        self.ensure_running()?;
        let slot = self.shared.registry.reserve_next(sample_rate);
        self.spawn_init(slot)
    }

    fn ensure_running(&self) -> HostResult<()> {
        if self.lifetime.stopped.load(Ordering::Acquire) {
            return Err(HostError::ServiceUnavailable(
                "patch host has been shut down".to_string(),
            ));
        }
        Ok(())
    }

    fn spawn_init(&self, slot: Arc<InstanceSlot>) -> HostResult<PendingInstance> {
        let id = slot.id();
        let (reply, pending) = PendingInstance::channel("instance init");
        let shared = self.shared.clone();
        let init_slot = slot.clone();

        let spawned = thread::Builder::new()
            .name(format!("pd-init-{}", id))
            .spawn(move || {
                let _ = reply.send(initialize(&shared, &init_slot));
            });

        if let Err(e) = spawned {
            self.shared.registry.remove_slot(&slot);
            return Err(HostError::ServiceUnavailable(format!(
                "Failed to spawn init thread for instance {}: {}",
                id, e
            )));
        }

        log::debug!("Instance {}: initialization started", id);
        Ok(pending)
    }

    /// Release one instance
    ///
    /// Fails with `NotFound` for unknown ids and `InvalidInstance` while the
    /// instance is still initializing. Waits for in-flight callbacks of the
    /// instance, then closes its patches and drops its subscriptions.
    ///
    /// Inbound callbacks of any instance cannot release: the call fails with
    /// `ReentrantRelease` instead of waiting on a dispatch gate.
    pub fn release(&self, id: InstanceId) -> HostResult<()> {
        let slot = self.shared.registry.get(id).ok_or(HostError::NotFound(id))?;
        if let Some(dispatching) = dispatching_instance() {
            log::warn!(
                "Instance {}: release requested from a callback of instance {}",
                id,
                dispatching
            );
            return Err(HostError::ReentrantRelease(id));
        }
        if slot.state() == InstanceState::Uninitialized {
            return Err(HostError::InvalidInstance(id));
        }
        if !self.shared.registry.remove_slot(&slot) {
            return Err(HostError::NotFound(id));
        }

        teardown(&self.shared, &slot, true)
    }

    /// Release every instance; returns how many were torn down
    pub fn release_all(&self) -> HostResult<usize> {
        release_all(&self.shared)
    }

    /// Enable or suspend audio computation without destroying state
    pub fn set_compute_enabled(&self, id: InstanceId, enabled: bool) -> HostResult<()> {
        let engine = &self.shared.engine;
        self.shared.registry.with_live(id, |slot, data| {
            ensure(engine.set_compute(id, enabled), || {
                HostError::engine("set_compute", id)
            })?;

            let state = if enabled {
                InstanceState::Computing
            } else {
                InstanceState::Suspended
            };
            slot.set_state(data, state);
            log::info!("Instance {}: {}", id, state);
            Ok(())
        })
    }

    /// Current state; `None` for ids that are not registered
    pub fn state(&self, id: InstanceId) -> Option<InstanceState> {
        self.shared.registry.get(id).map(|slot| slot.state())
    }

    pub fn instance_ids(&self) -> Vec<InstanceId> {
        self.shared.registry.ids()
    }

    /// Real-time audio handle for a live instance
    pub fn audio_tap(&self, id: InstanceId) -> HostResult<AudioTap> {
        let slot = self
            .shared
            .registry
            .get(id)
            .filter(|slot| slot.is_active())
            .ok_or(HostError::InvalidInstance(id))?;
        let channels = self.shared.config.output_channels as usize;
        Ok(AudioTap::new(slot, self.shared.engine.clone(), channels))
    }

    /// Stop the patch loader and release every instance
    ///
    /// Dropping the last clone of the host does the same.
    pub fn shutdown(&self) {
        self.lifetime.shutdown();
    }
}

/// Body of the init thread
fn initialize(shared: &HostShared, slot: &Arc<InstanceSlot>) -> HostResult<InstanceId> {
    let id = slot.id();
    let engine = &shared.engine;
    let sample_rate = slot.lock().sample_rate;
    let started = Instant::now();

    let failed = if !engine.create(id) {
        Some("create")
    } else if !engine.init(
        id,
        sample_rate,
        shared.config.input_channels,
        shared.config.output_channels,
    ) {
        Some("init")
    } else {
        None
    };

    let mut data = slot.lock();

    if !shared.registry.contains_slot(slot) {
        log::info!("Instance {}: removed while initializing, releasing engine instance", id);
        if failed != Some("create") {
            engine.release(id);
        }
        return Err(HostError::NotFound(id));
    }

    if let Some(operation) = failed {
        shared.registry.remove_slot(slot);
        if operation != "create" {
            engine.release(id);
        }
        let err = HostError::engine(operation, id);
        log::warn!("{}", err);
        return Err(err);
    }

    slot.set_state(&mut data, InstanceState::Suspended);
    log::info!(
        "Instance {}: initialized at {} Hz in {:?}",
        id,
        sample_rate,
        started.elapsed()
    );
    Ok(id)
}

/// Shut down a slot that has already been removed from the registry
fn teardown(shared: &HostShared, slot: &InstanceSlot, release_engine: bool) -> HostResult<()> {
    let id = slot.id();
    let engine = &shared.engine;

    // Lock order: gate, control, subscriptions
    let _gate = slot.deactivate();
    let mut data = slot.lock();

    if data.state == InstanceState::Computing {
        let _ = ensure(engine.set_compute(id, false), || {
            HostError::engine("set_compute", id)
        });
    }
    if !data.patches.is_empty() {
        let _ = ensure(engine.close_all_patches(id), || {
            HostError::engine("close_all_patches", id)
        });
    }
    let sources = slot.subscriptions().drain();
    for source in sources {
        let _ = ensure(engine.unsubscribe(id, &source), || {
            HostError::engine("unsubscribe", id)
        });
    }

    let patch_count = data.patches.len();
    data.patches.clear();
    data.buffers.clear();
    slot.set_state(&mut data, InstanceState::Released);

    if release_engine {
        ensure(engine.release(id), || HostError::engine("release", id))?;
    }

    log::info!(
        "Instance {}: released ({} patches closed, alive since {})",
        id,
        patch_count,
        data.created_at.format("%H:%M:%S")
    );
    Ok(())
}

fn release_all(shared: &HostShared) -> HostResult<usize> {
    if let Some(id) = dispatching_instance() {
        return Err(HostError::ReentrantRelease(id));
    }

    // Only the drained slots are released; instances created while this
    // runs are registered after the drain and stay alive
    let mut released = 0;
    let mut first_error = None;
    for slot in shared.registry.drain() {
        // Init threads clean up instances removed under them
        if slot.state() == InstanceState::Uninitialized {
            continue;
        }
        match teardown(shared, &slot, true) {
            Ok(()) => released += 1,
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }

    log::info!("Released {} instances", released);
    match first_error {
        Some(e) => Err(e),
        None => Ok(released),
    }
}
