//! LibPdEngine - engine backend over libpd-rs
//!
//! libpd can only be initialized once per process, so there is a single
//! process-wide `Pd`, created by the first `init` and kept until the
//! process exits. One host instance at a time is bound to it, across all
//! `LibPdEngine` values; `create` for a second concurrent instance fails.
//! Releasing the bound instance closes its patches and receivers, and the
//! next instance reuses the same `Pd`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, Once, OnceLock};

use libpd_rs::functions::receive::ReceiverHandle;
use libpd_rs::types::PatchFileHandle;
use libpd_rs::{Pd, PdAudioContext};

use super::{EngineBackend, HandlerTable};
use crate::router::{Atom, Payload};
use crate::types::{InstanceId, PatchId};

/// Hooks are process-wide in libpd; they are registered once
static HOOKS_INIT: Once = Once::new();

/// Handler table shared with the libpd hooks
static HANDLERS: OnceLock<HandlerTable> = OnceLock::new();

/// Messages collected by the hooks during `poll`; libpd hooks carry no
/// instance id and must not call back into the engine while it is locked
static INBOX: Mutex<Vec<(String, Payload)>> = Mutex::new(Vec::new());

fn inbox() -> MutexGuard<'static, Vec<(String, Payload)>> {
    INBOX.lock().unwrap_or_else(|e| e.into_inner())
}

fn init_hooks() {
    HOOKS_INIT.call_once(|| {
        libpd_rs::functions::verbose_print_state(true);

        libpd_rs::functions::receive::on_print(|msg: &str| {
            if let Some(h) = HANDLERS.get() {
                (h.print)(msg);
            }
        });
        libpd_rs::functions::receive::on_bang(|source: &str| {
            inbox().push((source.to_string(), Payload::Bang));
        });
        libpd_rs::functions::receive::on_float(|source: &str, value: f32| {
            inbox().push((source.to_string(), Payload::Float(value)));
        });
        libpd_rs::functions::receive::on_symbol(|source: &str, symbol: &str| {
            inbox().push((source.to_string(), Payload::Symbol(symbol.to_string())));
        });
        libpd_rs::functions::receive::on_list(|source: &str, list: &[libpd_rs::types::Atom]| {
            let atoms = list.iter().map(from_pd_atom).collect();
            inbox().push((source.to_string(), Payload::List(atoms)));
        });

        log::debug!("libpd hooks registered");
    });
}

fn to_pd_atom(atom: &Atom) -> libpd_rs::types::Atom {
    match atom {
        Atom::Float(v) => libpd_rs::types::Atom::Float(f64::from(*v)),
        Atom::Symbol(s) => libpd_rs::types::Atom::Symbol(s.clone()),
    }
}

fn from_pd_atom(atom: &libpd_rs::types::Atom) -> Atom {
    match atom {
        libpd_rs::types::Atom::Float(v) => Atom::Float(*v as f32),
        libpd_rs::types::Atom::Symbol(s) => Atom::Symbol(s.clone()),
    }
}

/// What the bound host instance has opened
#[derive(Default)]
struct Binding {
    instance: InstanceId,
    initialized: bool,
    patch_count: PatchId,
    patches: HashMap<PatchId, PatchFileHandle>,
    receivers: HashMap<String, ReceiverHandle>,
}

/// The process-wide libpd state
struct LibPdState {
    pd: Option<Pd>,
    ctx: Option<PdAudioContext>,
    /// Directories already on the engine's search path
    search_paths: Vec<PathBuf>,
    bound: Option<Binding>,
}

// libpd holds raw pointers into the C engine. All access goes through
// the `LIBPD` mutex.
unsafe impl Send for LibPdState {}

static LIBPD: Mutex<LibPdState> = Mutex::new(LibPdState {
    pd: None,
    ctx: None,
    search_paths: Vec::new(),
    bound: None,
});

impl LibPdState {
    /// The binding for `instance` with libpd made current
    fn enter(&mut self, instance: InstanceId) -> Option<(&mut Pd, &mut Binding)> {
        let binding = self.bound.as_mut().filter(|b| b.instance == instance && b.initialized)?;
        let pd = self.pd.as_mut()?;
        pd.set_as_current();
        Some((pd, binding))
    }

    fn add_search_path(&mut self, dir: &Path) {
        if self.search_paths.iter().any(|p| p == dir) {
            return;
        }
        let Some(pd) = self.pd.as_mut() else {
            return;
        };
        match pd.add_path_to_search_paths(dir) {
            Ok(()) => self.search_paths.push(dir.to_path_buf()),
            Err(e) => log::warn!("libpd: failed to add search path {}: {}", dir.display(), e),
        }
    }
}

/// Engine backend over libpd-rs
pub struct LibPdEngine {
    /// Added to the search path on every init
    search_paths: Vec<PathBuf>,
}

impl LibPdEngine {
    pub fn new() -> Self {
        Self::with_search_paths(Vec::new())
    }

    /// Abstractions are also looked up in `search_paths`
    pub fn with_search_paths(search_paths: Vec<PathBuf>) -> Self {
        init_hooks();
        Self { search_paths }
    }

    fn state(&self) -> MutexGuard<'static, LibPdState> {
        LIBPD.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` with `instance` bound and libpd made current
    fn with_current<T>(
        &self,
        instance: InstanceId,
        f: impl FnOnce(&mut Pd, &mut Binding) -> Option<T>,
    ) -> Option<T> {
        let mut state = self.state();
        let (pd, binding) = state.enter(instance)?;
        f(pd, binding)
    }

    fn send(&self, instance: InstanceId, what: &str, f: impl FnOnce() -> bool) -> bool {
        let sent = self.with_current(instance, |_, _| Some(f())).unwrap_or(false);
        if !sent {
            log::debug!("libpd: {} on instance {} failed", what, instance);
        }
        sent
    }
}

impl Default for LibPdEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBackend for LibPdEngine {
    fn name(&self) -> &'static str {
        "libpd"
    }

    fn install_handlers(&self, handlers: HandlerTable) -> bool {
        HANDLERS.set(handlers).is_ok()
    }

    fn create(&self, instance: InstanceId) -> bool {
        let mut state = self.state();
        if let Some(bound) = &state.bound {
            log::warn!(
                "libpd: cannot create instance {}, instance {} already owns libpd",
                instance,
                bound.instance
            );
            return false;
        }
        state.bound = Some(Binding {
            instance,
            ..Binding::default()
        });
        true
    }

    fn init(&self, instance: InstanceId, sample_rate: u32, inputs: u32, outputs: u32) -> bool {
        let mut state = self.state();
        if !state
            .bound
            .as_ref()
            .is_some_and(|b| b.instance == instance && !b.initialized)
        {
            return false;
        }

        if let Some(pd) = state.pd.as_mut() {
            // Reuse the process-wide context with this instance's audio settings
            pd.set_as_current();
            if let Err(e) = libpd_rs::functions::audio::initialize_audio(
                inputs as i32,
                outputs as i32,
                sample_rate as i32,
            ) {
                log::error!("libpd audio setup failed for instance {}: {}", instance, e);
                return false;
            }
        } else {
            match Pd::init_and_configure(inputs as i32, outputs as i32, sample_rate as i32) {
                Ok(pd) => {
                    state.ctx = Some(pd.audio_context());
                    state.pd = Some(pd);
                }
                Err(e) => {
                    log::error!("libpd init failed for instance {}: {}", instance, e);
                    return false;
                }
            }
        }

        for path in &self.search_paths {
            state.add_search_path(path);
        }
        if let Some(binding) = state.bound.as_mut() {
            binding.initialized = true;
        }
        log::info!("libpd instance {} initialized @ {}Hz", instance, sample_rate);
        true
    }

    fn release(&self, instance: InstanceId) -> bool {
        let mut state = self.state();
        if !state.bound.as_ref().is_some_and(|b| b.instance == instance) {
            return false;
        }
        if let Some((pd, binding)) = state.enter(instance) {
            for (_, handle) in binding.receivers.drain() {
                libpd_rs::functions::receive::stop_listening_from(handle);
            }
            for (_, handle) in binding.patches.drain() {
                let _ = libpd_rs::functions::close_patch(handle);
            }
            let _ = pd.activate_audio(false);
        }
        state.bound = None;
        inbox().clear();
        true
    }

    fn release_all(&self) -> bool {
        let bound = self.state().bound.as_ref().map(|b| b.instance);
        bound.map_or(true, |id| self.release(id))
    }

    fn set_compute(&self, instance: InstanceId, enabled: bool) -> bool {
        self.with_current(instance, |pd, _| Some(pd.activate_audio(enabled).is_ok()))
            .unwrap_or(false)
    }

    fn open_patch(&self, instance: InstanceId, file: &str, dir: &Path) -> Option<PatchId> {
        let mut state = self.state();
        state.enter(instance)?;
        state.add_search_path(dir);

        let (_, binding) = state.enter(instance)?;
        match libpd_rs::functions::open_patch(dir.join(file)) {
            Ok(handle) => {
                binding.patch_count += 1;
                binding.patches.insert(binding.patch_count, handle);
                Some(binding.patch_count)
            }
            Err(e) => {
                log::warn!("libpd: failed to open {}: {}", file, e);
                None
            }
        }
    }

    fn close_patch(&self, instance: InstanceId, patch: PatchId) -> bool {
        self.with_current(instance, |_, binding| {
            let handle = binding.patches.remove(&patch)?;
            Some(libpd_rs::functions::close_patch(handle).is_ok())
        })
        .unwrap_or(false)
    }

    fn close_all_patches(&self, instance: InstanceId) -> bool {
        self.with_current(instance, |_, binding| {
            let all_closed = binding
                .patches
                .drain()
                .map(|(_, handle)| libpd_rs::functions::close_patch(handle).is_ok())
                .fold(true, |acc, ok| acc && ok);
            Some(all_closed)
        })
        .unwrap_or(false)
    }

    fn send_bang(&self, instance: InstanceId, dest: &str) -> bool {
        self.send(instance, "bang", || {
            libpd_rs::functions::send::send_bang_to(dest).is_ok()
        })
    }

    fn send_float(&self, instance: InstanceId, dest: &str, value: f32) -> bool {
        self.send(instance, "float", || {
            libpd_rs::functions::send::send_float_to(dest, value).is_ok()
        })
    }

    fn send_symbol(&self, instance: InstanceId, dest: &str, symbol: &str) -> bool {
        self.send(instance, "symbol", || {
            libpd_rs::functions::send::send_symbol_to(dest, symbol).is_ok()
        })
    }

    fn send_list(&self, instance: InstanceId, dest: &str, atoms: &[Atom]) -> bool {
        let atoms: Vec<libpd_rs::types::Atom> = atoms.iter().map(to_pd_atom).collect();
        self.send(instance, "list", || {
            libpd_rs::functions::send::send_list_to(dest, &atoms).is_ok()
        })
    }

    fn send_message(
        &self,
        instance: InstanceId,
        dest: &str,
        selector: &str,
        atoms: &[Atom],
    ) -> bool {
        let atoms: Vec<libpd_rs::types::Atom> = atoms.iter().map(to_pd_atom).collect();
        self.send(instance, "message", || {
            libpd_rs::functions::send::send_message_to(dest, selector, &atoms).is_ok()
        })
    }

    fn send_note_on(&self, instance: InstanceId, channel: i32, pitch: i32) -> bool {
        self.send(instance, "note on", || {
            libpd_rs::functions::send::send_note_on(channel, pitch, 64).is_ok()
        })
    }

    fn write_array(&self, instance: InstanceId, name: &str, samples: &[f32]) -> bool {
        self.with_current(instance, |_, _| {
            // Arrays never resize implicitly; the size must already match
            let size = libpd_rs::functions::array::array_size(name).ok()?;
            if size as usize != samples.len() {
                return Some(false);
            }
            Some(
                libpd_rs::functions::array::write_float_array_to(
                    name,
                    0,
                    samples,
                    samples.len() as i32,
                )
                .is_ok(),
            )
        })
        .unwrap_or(false)
    }

    fn subscribe(&self, instance: InstanceId, source: &str) -> bool {
        self.with_current(instance, |_, binding| {
            if binding.receivers.contains_key(source) {
                return Some(true);
            }
            let handle = libpd_rs::functions::receive::start_listening_from(source).ok()?;
            binding.receivers.insert(source.to_string(), handle);
            Some(true)
        })
        .unwrap_or(false)
    }

    fn unsubscribe(&self, instance: InstanceId, source: &str) -> bool {
        self.with_current(instance, |_, binding| {
            if let Some(handle) = binding.receivers.remove(source) {
                libpd_rs::functions::receive::stop_listening_from(handle);
            }
            Some(true)
        })
        .unwrap_or(false)
    }

    fn poll(&self, instance: InstanceId) -> bool {
        let drained = self.with_current(instance, |_, _| {
            libpd_rs::functions::receive::receive_messages_from_pd();
            Some(std::mem::take(&mut *inbox()))
        });
        let Some(pending) = drained else {
            return false;
        };

        // Handlers run with the backend unlocked so they may send back in
        if let Some(handlers) = HANDLERS.get() {
            for (source, payload) in &pending {
                handlers.deliver(instance, source, payload);
            }
        }
        true
    }

    fn process(
        &self,
        instance: InstanceId,
        input: &[f32],
        output: &mut [f32],
        channels: usize,
    ) -> bool {
        // Contention with the control plane costs one silent block, never a wait
        let Ok(mut state) = LIBPD.try_lock() else {
            return false;
        };
        if state.enter(instance).is_none() {
            return false;
        }
        let Some(ctx) = state.ctx.as_ref() else {
            return false;
        };

        let ticks =
            libpd_rs::functions::util::calculate_ticks(channels as i32, output.len() as i32);
        ctx.process_float(ticks, input, output);
        true
    }
}
