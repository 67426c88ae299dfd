//! Process-wide table of inbound message handlers, one per message kind

use std::fmt;
use std::sync::Arc;

use crate::router::{Atom, InboundMessage, Payload};
use crate::types::InstanceId;

type PrintFn = dyn Fn(&str) + Send + Sync;
type BangFn = dyn Fn(InstanceId, &str) + Send + Sync;
type FloatFn = dyn Fn(InstanceId, &str, f32) + Send + Sync;
type SymbolFn = dyn Fn(InstanceId, &str, &str) + Send + Sync;
type ListFn = dyn Fn(InstanceId, &str, &[Atom]) + Send + Sync;

/// Handlers invoked by an engine backend for console output and for
/// messages emitted from subscribed sources
#[derive(Clone)]
pub struct HandlerTable {
    pub print: Arc<PrintFn>,
    pub bang: Arc<BangFn>,
    pub float: Arc<FloatFn>,
    pub symbol: Arc<SymbolFn>,
    pub list: Arc<ListFn>,
}

impl HandlerTable {
    /// Route every inbound kind into a single dispatch function
    pub fn routing<F>(dispatch: F) -> Self
    where
        F: Fn(InboundMessage) + Send + Sync + 'static,
    {
        let dispatch = Arc::new(dispatch);

        let bang = {
            let d = dispatch.clone();
            move |instance: InstanceId, source: &str| {
                (*d)(InboundMessage {
                    instance,
                    source: source.to_string(),
                    payload: Payload::Bang,
                })
            }
        };
        let float = {
            let d = dispatch.clone();
            move |instance: InstanceId, source: &str, value: f32| {
                (*d)(InboundMessage {
                    instance,
                    source: source.to_string(),
                    payload: Payload::Float(value),
                })
            }
        };
        let symbol = {
            let d = dispatch.clone();
            move |instance: InstanceId, source: &str, symbol: &str| {
                (*d)(InboundMessage {
                    instance,
                    source: source.to_string(),
                    payload: Payload::Symbol(symbol.to_string()),
                })
            }
        };
        let list = move |instance: InstanceId, source: &str, atoms: &[Atom]| {
            (*dispatch)(InboundMessage {
                instance,
                source: source.to_string(),
                payload: Payload::List(atoms.to_vec()),
            })
        };

        Self {
            print: Arc::new(log_engine_print),
            bang: Arc::new(bang),
            float: Arc::new(float),
            symbol: Arc::new(symbol),
            list: Arc::new(list),
        }
    }

    /// Replace the console handler
    pub fn with_print<F>(mut self, print: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.print = Arc::new(print);
        self
    }

    /// Invoke the handler matching the payload kind
    pub fn deliver(&self, instance: InstanceId, source: &str, payload: &Payload) {
        match payload {
            Payload::Bang => (self.bang)(instance, source),
            Payload::Float(v) => (self.float)(instance, source, *v),
            Payload::Symbol(s) => (self.symbol)(instance, source, s),
            Payload::List(atoms) => (self.list)(instance, source, atoms),
        }
    }
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerTable").finish_non_exhaustive()
    }
}

/// Default console handler: routes engine output to the log facade,
/// picking the level from the message content
pub fn log_engine_print(msg: &str) {
    let msg = msg.trim();
    if msg.is_empty() {
        return;
    }

    if msg.contains("error") || msg.contains("can't") || msg.contains("couldn't") {
        log::error!("[PD] {}", msg);
    } else if msg.contains("warning") || msg.contains("deprecated") {
        log::warn!("[PD] {}", msg);
    } else {
        log::info!("[PD] {}", msg);
    }
}
