//! SimEngine - in-process stand-in for the Pure Data engine
//!
//! Models just enough of the engine contract for the host to be exercised
//! without the native library: instances, patch files opened from disk,
//! fixed-size arrays sized through a `<name>_length` receiver, source
//! subscriptions, and pass-through audio. Every boundary call is recorded
//! in order so tests can assert on the exact call sequence.
//!
//! Inbound messages are queued per instance and only reach the handler
//! table on [`EngineBackend::poll`], the same way libpd's queued hooks work.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};

use crossbeam::channel::{self, Receiver, Sender};

use super::{EngineBackend, HandlerTable};
use crate::router::{Atom, Payload};
use crate::types::{InstanceId, PatchId};

/// A boundary call as observed by [`SimEngine`]
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    Create(InstanceId),
    Init { instance: InstanceId, sample_rate: u32 },
    Release(InstanceId),
    ReleaseAll,
    SetCompute { instance: InstanceId, enabled: bool },
    OpenPatch { instance: InstanceId, file: String, dir: PathBuf },
    ClosePatch { instance: InstanceId, patch: PatchId },
    CloseAllPatches(InstanceId),
    SendBang { instance: InstanceId, dest: String },
    SendFloat { instance: InstanceId, dest: String, value: f32 },
    SendSymbol { instance: InstanceId, dest: String, symbol: String },
    SendList { instance: InstanceId, dest: String, atoms: Vec<Atom> },
    SendMessage { instance: InstanceId, dest: String, selector: String, atoms: Vec<Atom> },
    SendNoteOn { instance: InstanceId, channel: i32, pitch: i32 },
    WriteArray { instance: InstanceId, name: String, len: usize },
    Subscribe { instance: InstanceId, source: String },
    Unsubscribe { instance: InstanceId, source: String },
}

impl EngineCall {
    /// Instance the call targeted (`None` for `ReleaseAll`)
    pub fn instance(&self) -> Option<InstanceId> {
        match self {
            Self::ReleaseAll => None,
            Self::Create(id) | Self::Release(id) | Self::CloseAllPatches(id) => Some(*id),
            Self::Init { instance, .. }
            | Self::SetCompute { instance, .. }
            | Self::OpenPatch { instance, .. }
            | Self::ClosePatch { instance, .. }
            | Self::SendBang { instance, .. }
            | Self::SendFloat { instance, .. }
            | Self::SendSymbol { instance, .. }
            | Self::SendList { instance, .. }
            | Self::SendMessage { instance, .. }
            | Self::SendNoteOn { instance, .. }
            | Self::WriteArray { instance, .. }
            | Self::Subscribe { instance, .. }
            | Self::Unsubscribe { instance, .. } => Some(*instance),
        }
    }

    /// Operation name, as accepted by [`SimEngine::fail`]
    pub fn operation(&self) -> &'static str {
        match self {
            Self::Create(_) => "create",
            Self::Init { .. } => "init",
            Self::Release(_) => "release",
            Self::ReleaseAll => "release_all",
            Self::SetCompute { .. } => "set_compute",
            Self::OpenPatch { .. } => "open_patch",
            Self::ClosePatch { .. } => "close_patch",
            Self::CloseAllPatches(_) => "close_all_patches",
            Self::SendBang { .. }
            | Self::SendFloat { .. }
            | Self::SendSymbol { .. }
            | Self::SendList { .. }
            | Self::SendMessage { .. }
            | Self::SendNoteOn { .. } => "send",
            Self::WriteArray { .. } => "write_array",
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
        }
    }
}

#[derive(Debug, Default)]
struct SimInstance {
    initialized: bool,
    sample_rate: u32,
    computing: bool,
    patch_count: PatchId,
    patches: HashMap<PatchId, PathBuf>,
    arrays: HashMap<String, Vec<f32>>,
    subscriptions: HashSet<String>,
    inbound: VecDeque<(String, Payload)>,
}

/// Calls kept by default before the oldest are dropped
pub const DEFAULT_CALL_LOG_LIMIT: usize = 8192;

#[derive(Debug, Default)]
struct SimState {
    calls: VecDeque<EngineCall>,
    call_log_limit: usize,
    instances: HashMap<InstanceId, SimInstance>,
    failing: HashSet<String>,
    rejected: HashSet<String>,
    length_receivers: HashMap<String, String>,
    loopbacks: HashMap<String, String>,
}

impl SimState {
    /// Record the call and report whether it should go ahead
    fn begin(&mut self, call: EngineCall) -> bool {
        let op = call.operation();
        if self.call_log_limit > 0 {
            while self.calls.len() >= self.call_log_limit {
                self.calls.pop_front();
            }
            self.calls.push_back(call);
        }
        !self.failing.contains(op)
    }

    fn live(&mut self, instance: InstanceId) -> Option<&mut SimInstance> {
        self.instances.get_mut(&instance).filter(|i| i.initialized)
    }

    /// Destination check shared by every send
    fn accepts(&mut self, instance: InstanceId, dest: &str) -> bool {
        !self.rejected.contains(dest) && self.live(instance).is_some()
    }

    /// Queue an inbound message if `source` is subscribed on `instance`
    fn enqueue(&mut self, instance: InstanceId, source: &str, payload: Payload) -> bool {
        match self.instances.get_mut(&instance) {
            Some(inst) if inst.subscriptions.contains(source) => {
                inst.inbound.push_back((source.to_string(), payload));
                true
            }
            _ => false,
        }
    }

    /// Route a sent message back through its loopback source, if any
    fn loopback(&mut self, instance: InstanceId, dest: &str, payload: Payload) {
        if let Some(source) = self.loopbacks.get(dest).cloned() {
            self.enqueue(instance, &source, payload);
        }
    }
}

/// In-process engine used for tests and headless runs
pub struct SimEngine {
    state: Mutex<SimState>,
    handlers: OnceLock<HandlerTable>,
    init_gate: Mutex<Option<Receiver<()>>>,
    length_suffix: String,
    processed_blocks: AtomicU64,
}

impl SimEngine {
    pub fn new() -> Self {
        Self::with_length_suffix("_length")
    }

    /// Arrays are declared by a float sent to `<name><suffix>`
    pub fn with_length_suffix(suffix: &str) -> Self {
        Self {
            state: Mutex::new(SimState {
                call_log_limit: DEFAULT_CALL_LOG_LIMIT,
                ..SimState::default()
            }),
            handlers: OnceLock::new(),
            init_gate: Mutex::new(None),
            length_suffix: suffix.to_string(),
            processed_blocks: AtomicU64::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ------------------------------------------------------------------
    // Scripting
    // ------------------------------------------------------------------

    /// Make every call of `operation` report failure (see [`EngineCall::operation`])
    pub fn fail(&self, operation: &str) {
        self.state().failing.insert(operation.to_string());
    }

    /// Undo [`SimEngine::fail`]
    pub fn recover(&self, operation: &str) {
        self.state().failing.remove(operation);
    }

    /// Sends to `dest` are rejected as an unknown route
    pub fn reject_destination(&self, dest: &str) {
        self.state().rejected.insert(dest.to_string());
    }

    /// A float sent to `dest` declares the size of `array`
    pub fn add_length_receiver(&self, dest: &str, array: &str) {
        self.state()
            .length_receivers
            .insert(dest.to_string(), array.to_string());
    }

    /// Messages sent to `dest` come back as inbound messages from `source`
    pub fn loopback(&self, dest: &str, source: &str) {
        self.state()
            .loopbacks
            .insert(dest.to_string(), source.to_string());
    }

    /// Block `init` calls until the returned sender sends or is dropped
    pub fn hold_init(&self) -> Sender<()> {
        let (tx, rx) = channel::bounded(0);
        *self.init_gate.lock().unwrap_or_else(|e| e.into_inner()) = Some(rx);
        tx
    }

    // ------------------------------------------------------------------
    // Inbound emission
    // ------------------------------------------------------------------

    /// Queue a message from `source` on `instance`. Returns false (and drops
    /// the message) when the source is not subscribed.
    pub fn emit(&self, instance: InstanceId, source: &str, payload: Payload) -> bool {
        self.state().enqueue(instance, source, payload)
    }

    pub fn emit_bang(&self, instance: InstanceId, source: &str) -> bool {
        self.emit(instance, source, Payload::Bang)
    }

    pub fn emit_float(&self, instance: InstanceId, source: &str, value: f32) -> bool {
        self.emit(instance, source, Payload::Float(value))
    }

    pub fn emit_symbol(&self, instance: InstanceId, source: &str, symbol: &str) -> bool {
        self.emit(instance, source, Payload::Symbol(symbol.to_string()))
    }

    /// Messages queued for `instance` and not yet polled
    pub fn pending_inbound(&self, instance: InstanceId) -> usize {
        self.state()
            .instances
            .get(&instance)
            .map_or(0, |i| i.inbound.len())
    }

    /// Print a line through the console handler
    pub fn print(&self, line: &str) {
        if let Some(handlers) = self.handlers.get() {
            (handlers.print)(line);
        }
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    /// Recorded boundary calls, oldest first
    pub fn calls(&self) -> Vec<EngineCall> {
        self.state().calls.iter().cloned().collect()
    }

    pub fn calls_for(&self, instance: InstanceId) -> Vec<EngineCall> {
        self.state()
            .calls
            .iter()
            .filter(|c| c.instance() == Some(instance))
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Keep at most `limit` recorded calls; 0 turns recording off
    pub fn set_call_log_limit(&self, limit: usize) {
        let mut state = self.state();
        state.call_log_limit = limit;
        let excess = state.calls.len().saturating_sub(limit);
        state.calls.drain(..excess);
    }

    pub fn instance_exists(&self, instance: InstanceId) -> bool {
        self.state().instances.contains_key(&instance)
    }

    pub fn sample_rate(&self, instance: InstanceId) -> Option<u32> {
        self.state().instances.get(&instance).map(|i| i.sample_rate)
    }

    pub fn is_computing(&self, instance: InstanceId) -> bool {
        self.state()
            .instances
            .get(&instance)
            .is_some_and(|i| i.computing)
    }

    /// Contents of a declared array
    pub fn array(&self, instance: InstanceId, name: &str) -> Option<Vec<f32>> {
        self.state()
            .instances
            .get(&instance)
            .and_then(|i| i.arrays.get(name).cloned())
    }

    pub fn subscriptions(&self, instance: InstanceId) -> Vec<String> {
        let mut subs: Vec<String> = self
            .state()
            .instances
            .get(&instance)
            .map(|i| i.subscriptions.iter().cloned().collect())
            .unwrap_or_default();
        subs.sort();
        subs
    }

    pub fn open_patches(&self, instance: InstanceId) -> Vec<(PatchId, PathBuf)> {
        let mut patches: Vec<(PatchId, PathBuf)> = self
            .state()
            .instances
            .get(&instance)
            .map(|i| i.patches.iter().map(|(k, v)| (*k, v.clone())).collect())
            .unwrap_or_default();
        patches.sort_by_key(|(id, _)| *id);
        patches
    }

    /// Number of audio blocks computed so far
    pub fn processed_blocks(&self) -> u64 {
        self.processed_blocks.load(Ordering::Relaxed)
    }

    fn send_with(
        &self,
        call: EngineCall,
        instance: InstanceId,
        dest: &str,
        payload: Payload,
    ) -> bool {
        let mut state = self.state();
        if !state.begin(call) || !state.accepts(instance, dest) {
            return false;
        }
        state.loopback(instance, dest, payload);
        true
    }
}

impl Default for SimEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBackend for SimEngine {
    fn name(&self) -> &'static str {
        "sim"
    }

    fn install_handlers(&self, handlers: HandlerTable) -> bool {
        self.handlers.set(handlers).is_ok()
    }

    fn create(&self, instance: InstanceId) -> bool {
        let mut state = self.state();
        if !state.begin(EngineCall::Create(instance)) || state.instances.contains_key(&instance) {
            return false;
        }
        state.instances.insert(instance, SimInstance::default());
        true
    }

    fn init(&self, instance: InstanceId, sample_rate: u32, _inputs: u32, _outputs: u32) -> bool {
        let gate = self
            .init_gate
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(rx) = gate {
            let _ = rx.recv();
        }

        let mut state = self.state();
        if !state.begin(EngineCall::Init {
            instance,
            sample_rate,
        }) {
            return false;
        }
        match state.instances.get_mut(&instance) {
            Some(inst) => {
                inst.initialized = true;
                inst.sample_rate = sample_rate;
                true
            }
            None => false,
        }
    }

    fn release(&self, instance: InstanceId) -> bool {
        let mut state = self.state();
        state.begin(EngineCall::Release(instance)) && state.instances.remove(&instance).is_some()
    }

    fn release_all(&self) -> bool {
        let mut state = self.state();
        if !state.begin(EngineCall::ReleaseAll) {
            return false;
        }
        state.instances.clear();
        true
    }

    fn set_compute(&self, instance: InstanceId, enabled: bool) -> bool {
        let mut state = self.state();
        if !state.begin(EngineCall::SetCompute { instance, enabled }) {
            return false;
        }
        match state.live(instance) {
            Some(inst) => {
                inst.computing = enabled;
                true
            }
            None => false,
        }
    }

    fn open_patch(&self, instance: InstanceId, file: &str, dir: &Path) -> Option<PatchId> {
        let mut state = self.state();
        if !state.begin(EngineCall::OpenPatch {
            instance,
            file: file.to_string(),
            dir: dir.to_path_buf(),
        }) {
            return None;
        }

        let path = dir.join(file);
        if !path.is_file() {
            return None;
        }

        let inst = state.live(instance)?;
        inst.patch_count += 1;
        let id = inst.patch_count;
        inst.patches.insert(id, path);
        Some(id)
    }

    fn close_patch(&self, instance: InstanceId, patch: PatchId) -> bool {
        let mut state = self.state();
        state.begin(EngineCall::ClosePatch { instance, patch })
            && state
                .live(instance)
                .is_some_and(|i| i.patches.remove(&patch).is_some())
    }

    fn close_all_patches(&self, instance: InstanceId) -> bool {
        let mut state = self.state();
        if !state.begin(EngineCall::CloseAllPatches(instance)) {
            return false;
        }
        match state.live(instance) {
            Some(inst) => {
                inst.patches.clear();
                true
            }
            None => false,
        }
    }

    fn send_bang(&self, instance: InstanceId, dest: &str) -> bool {
        let call = EngineCall::SendBang {
            instance,
            dest: dest.to_string(),
        };
        self.send_with(call, instance, dest, Payload::Bang)
    }

    fn send_float(&self, instance: InstanceId, dest: &str, value: f32) -> bool {
        let call = EngineCall::SendFloat {
            instance,
            dest: dest.to_string(),
            value,
        };

        {
            let mut state = self.state();
            let array = state
                .length_receivers
                .get(dest)
                .cloned()
                .or_else(|| dest.strip_suffix(&self.length_suffix).map(str::to_string));

            if let Some(array) = array {
                // Size declarations are consumed by the array, never looped back
                if !state.begin(call) || !state.accepts(instance, dest) || value < 0.0 {
                    return false;
                }
                if let Some(inst) = state.live(instance) {
                    inst.arrays.insert(array, vec![0.0; value as usize]);
                }
                return true;
            }
        }

        self.send_with(call, instance, dest, Payload::Float(value))
    }

    fn send_symbol(&self, instance: InstanceId, dest: &str, symbol: &str) -> bool {
        let call = EngineCall::SendSymbol {
            instance,
            dest: dest.to_string(),
            symbol: symbol.to_string(),
        };
        self.send_with(call, instance, dest, Payload::Symbol(symbol.to_string()))
    }

    fn send_list(&self, instance: InstanceId, dest: &str, atoms: &[Atom]) -> bool {
        let call = EngineCall::SendList {
            instance,
            dest: dest.to_string(),
            atoms: atoms.to_vec(),
        };
        self.send_with(call, instance, dest, Payload::List(atoms.to_vec()))
    }

    fn send_message(
        &self,
        instance: InstanceId,
        dest: &str,
        selector: &str,
        atoms: &[Atom],
    ) -> bool {
        let call = EngineCall::SendMessage {
            instance,
            dest: dest.to_string(),
            selector: selector.to_string(),
            atoms: atoms.to_vec(),
        };
        let mut list = Vec::with_capacity(atoms.len() + 1);
        list.push(Atom::Symbol(selector.to_string()));
        list.extend_from_slice(atoms);
        self.send_with(call, instance, dest, Payload::List(list))
    }

    fn send_note_on(&self, instance: InstanceId, channel: i32, pitch: i32) -> bool {
        let mut state = self.state();
        state.begin(EngineCall::SendNoteOn {
            instance,
            channel,
            pitch,
        }) && state.live(instance).is_some()
    }

    fn write_array(&self, instance: InstanceId, name: &str, samples: &[f32]) -> bool {
        let mut state = self.state();
        if !state.begin(EngineCall::WriteArray {
            instance,
            name: name.to_string(),
            len: samples.len(),
        }) {
            return false;
        }
        match state.live(instance).and_then(|i| i.arrays.get_mut(name)) {
            Some(array) if array.len() == samples.len() => {
                array.copy_from_slice(samples);
                true
            }
            _ => false,
        }
    }

    fn subscribe(&self, instance: InstanceId, source: &str) -> bool {
        let mut state = self.state();
        if !state.begin(EngineCall::Subscribe {
            instance,
            source: source.to_string(),
        }) {
            return false;
        }
        match state.live(instance) {
            Some(inst) => {
                inst.subscriptions.insert(source.to_string());
                true
            }
            None => false,
        }
    }

    fn unsubscribe(&self, instance: InstanceId, source: &str) -> bool {
        let mut state = self.state();
        if !state.begin(EngineCall::Unsubscribe {
            instance,
            source: source.to_string(),
        }) {
            return false;
        }
        match state.live(instance) {
            Some(inst) => {
                inst.subscriptions.remove(source);
                true
            }
            None => false,
        }
    }

    fn poll(&self, instance: InstanceId) -> bool {
        let pending: Vec<(String, Payload)> = match self.state().instances.get_mut(&instance) {
            Some(inst) => inst.inbound.drain(..).collect(),
            None => return false,
        };

        // Handlers run without the state lock so they may call back into the engine
        if let Some(handlers) = self.handlers.get() {
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
        _channels: usize,
    ) -> bool {
        // Never wait on the control plane from the audio context
        let Ok(state) = self.state.try_lock() else {
            return false;
        };
        let computing = state
            .instances
            .get(&instance)
            .is_some_and(|i| i.initialized && i.computing);
        drop(state);

        if !computing {
            return false;
        }

        // Behaves like an [adc~] -> [dac~] patch
        for (i, out) in output.iter_mut().enumerate() {
            *out = input.get(i).copied().unwrap_or(0.0);
        }
        self.processed_blocks.fetch_add(1, Ordering::Relaxed);
        true
    }
}
