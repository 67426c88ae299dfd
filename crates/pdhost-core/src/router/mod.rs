//! Message router - typed traffic between the host and engine instances
//!
//! Outbound, [`MessageRouter::send`] delivers bang/float/symbol/list/typed
//! messages to a named destination inside one instance. Messages sent in
//! sequence to one instance reach the engine in that order: every send
//! runs under the instance's control lock.
//!
//! Inbound, the engine reports messages from subscribed sources through
//! the handler table, which lands in [`dispatch`]. Listeners are scoped to
//! the instance that owns the subscription:
//!
//! ```ignore
//! let router = host.router();
//! let rx = router.listen(0, "frequency")?;
//! router.send(0, "metroOnOff", Message::Float(1.0))?;
//! router.poll(0)?;
//! while let Ok(msg) = rx.try_recv() {
//!     println!("{} -> {:?}", msg.source, msg.payload);
//! }
//! ```

mod message;
mod subscription;

use std::sync::Arc;

use crossbeam::channel::{self, Receiver};

use crate::error::{ensure, HostError, HostResult};
use crate::host::HostShared;
use crate::registry::{InstanceRegistry, InstanceSlot};
use crate::types::InstanceId;

pub use message::{Atom, InboundMessage, Message, Payload};
pub use subscription::{Listener, ListenerId, SubscriptionTable};

/// Sends messages to instances and manages inbound subscriptions
#[derive(Clone)]
pub struct MessageRouter {
    shared: Arc<HostShared>,
}

impl MessageRouter {
    pub(crate) fn new(shared: Arc<HostShared>) -> Self {
        Self { shared }
    }

    /// Send `message` to `dest` inside `instance`
    ///
    /// Fails with `InvalidInstance` without touching the engine unless the
    /// instance is live; fails with `UnknownDestination` when the engine
    /// rejects the route.
    pub fn send(&self, instance: InstanceId, dest: &str, message: Message) -> HostResult<()> {
        let engine = &self.shared.engine;

        self.shared.registry.with_live(instance, |_, _| {
            let ok = match &message {
                Message::Bang => engine.send_bang(instance, dest),
                Message::Float(v) => engine.send_float(instance, dest, *v),
                Message::Symbol(s) => engine.send_symbol(instance, dest, s),
                Message::List(atoms) => engine.send_list(instance, dest, atoms),
                Message::Typed { selector, args } => {
                    engine.send_message(instance, dest, selector, args)
                }
            };

            ensure(ok, || HostError::UnknownDestination {
                instance,
                destination: dest.to_string(),
            })?;

            log::debug!(
                "Instance {}: sent {} to '{}'",
                instance,
                message.kind(),
                dest
            );
            Ok(())
        })
    }

    pub fn send_bang(&self, instance: InstanceId, dest: &str) -> HostResult<()> {
        self.send(instance, dest, Message::Bang)
    }

    pub fn send_float(&self, instance: InstanceId, dest: &str, value: f32) -> HostResult<()> {
        self.send(instance, dest, Message::Float(value))
    }

    pub fn send_symbol(&self, instance: InstanceId, dest: &str, symbol: &str) -> HostResult<()> {
        self.send(instance, dest, Message::Symbol(symbol.to_string()))
    }

    pub fn send_list(&self, instance: InstanceId, dest: &str, atoms: Vec<Atom>) -> HostResult<()> {
        self.send(instance, dest, Message::List(atoms))
    }

    /// Send a MIDI note-on into the instance's graph
    pub fn send_note_on(&self, instance: InstanceId, channel: i32, pitch: i32) -> HostResult<()> {
        let engine = &self.shared.engine;
        self.shared.registry.with_live(instance, |_, _| {
            ensure(engine.send_note_on(instance, channel, pitch), || {
                HostError::engine("send_note_on", instance)
            })
        })
    }

    /// Subscribe to messages from `source`; subscribing twice is a no-op
    pub fn subscribe(&self, instance: InstanceId, source: &str) -> HostResult<()> {
        self.shared
            .registry
            .with_live(instance, |slot, _| self.subscribe_locked(slot, source))
    }

    fn subscribe_locked(&self, slot: &InstanceSlot, source: &str) -> HostResult<()> {
        let instance = slot.id();
        if slot.subscriptions().contains(source) {
            return Ok(());
        }

        ensure(self.shared.engine.subscribe(instance, source), || {
            HostError::engine("subscribe", instance)
        })?;
        slot.subscriptions().insert(source);

        log::debug!("Instance {}: subscribed to '{}'", instance, source);
        Ok(())
    }

    /// Drop the subscription and its listeners; unknown sources are a no-op
    pub fn unsubscribe(&self, instance: InstanceId, source: &str) -> HostResult<()> {
        self.shared.registry.with_live(instance, |slot, _| {
            if !slot.subscriptions().contains(source) {
                return Ok(());
            }

            ensure(self.shared.engine.unsubscribe(instance, source), || {
                HostError::engine("unsubscribe", instance)
            })?;
            slot.subscriptions().remove(source);

            log::debug!("Instance {}: unsubscribed from '{}'", instance, source);
            Ok(())
        })
    }

    /// Subscribe (if needed) and receive messages from `source` on a channel
    pub fn listen(
        &self,
        instance: InstanceId,
        source: &str,
    ) -> HostResult<Receiver<InboundMessage>> {
        let (tx, rx) = channel::unbounded();
        self.add_listener(instance, source, Listener::Channel(tx))?;
        Ok(rx)
    }

    /// Subscribe (if needed) and invoke `callback` for each message from `source`
    ///
    /// The callback runs on the thread that polls the engine. It is never
    /// invoked once release of the instance has started.
    pub fn on_message<F>(
        &self,
        instance: InstanceId,
        source: &str,
        callback: F,
    ) -> HostResult<ListenerId>
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        self.add_listener(instance, source, Listener::Callback(Arc::new(callback)))
    }

    fn add_listener(
        &self,
        instance: InstanceId,
        source: &str,
        listener: Listener,
    ) -> HostResult<ListenerId> {
        self.shared.registry.with_live(instance, |slot, _| {
            self.subscribe_locked(slot, source)?;
            slot.subscriptions()
                .add_listener(source, listener)
                .ok_or_else(|| HostError::engine("subscribe", instance))
        })
    }

    /// Detach a listener; the subscription itself stays
    pub fn remove_listener(&self, instance: InstanceId, listener: ListenerId) -> HostResult<bool> {
        let slot = self.active_slot(instance)?;
        let removed = slot.subscriptions().remove_listener(listener);
        Ok(removed)
    }

    /// Last value received from `source` on this instance
    pub fn latest(&self, instance: InstanceId, source: &str) -> HostResult<Option<Payload>> {
        let slot = self.active_slot(instance)?;
        let latest = slot.subscriptions().latest(source);
        Ok(latest)
    }

    pub fn latest_float(&self, instance: InstanceId, source: &str) -> HostResult<Option<f32>> {
        Ok(self.latest(instance, source)?.and_then(|p| p.as_float()))
    }

    pub fn subscriptions(&self, instance: InstanceId) -> HostResult<Vec<String>> {
        let slot = self.active_slot(instance)?;
        let sources = slot.subscriptions().sources();
        Ok(sources)
    }

    /// Deliver messages the engine has queued for this instance
    ///
    /// Runs without the control lock so listeners may send back into the
    /// same instance.
    pub fn poll(&self, instance: InstanceId) -> HostResult<()> {
        self.active_slot(instance)?;
        ensure(self.shared.engine.poll(instance), || {
            HostError::engine("poll", instance)
        })
    }

    fn active_slot(&self, instance: InstanceId) -> HostResult<Arc<InstanceSlot>> {
        self.shared
            .registry
            .get(instance)
            .filter(|slot| slot.is_active())
            .ok_or(HostError::InvalidInstance(instance))
    }
}

/// Route one inbound message to the listeners of its instance
///
/// Messages for unknown or released instances, and for sources without a
/// subscription, are dropped without invoking user code.
pub(crate) fn dispatch(registry: &InstanceRegistry, msg: InboundMessage) {
    let Some(slot) = registry.get(msg.instance) else {
        log::trace!("Dropped inbound from '{}': unknown instance {}", msg.source, msg.instance);
        return;
    };
    let Some(_guard) = slot.enter_dispatch() else {
        log::trace!("Dropped inbound from '{}': instance {} released", msg.source, msg.instance);
        return;
    };

    let listeners = slot.subscriptions().record(&msg.source, &msg.payload);
    let Some(listeners) = listeners else {
        log::trace!(
            "Dropped inbound from '{}': not subscribed on instance {}",
            msg.source,
            msg.instance
        );
        return;
    };

    let gone: Vec<ListenerId> = listeners
        .iter()
        .filter(|(_, listener)| !listener.notify(&msg))
        .map(|(id, _)| *id)
        .collect();

    if !gone.is_empty() {
        let mut subscriptions = slot.subscriptions();
        for id in gone {
            subscriptions.remove_listener(id);
        }
    }
}
