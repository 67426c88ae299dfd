//! Typed messages exchanged with engine instances

use std::fmt;

use crate::types::InstanceId;

/// Element of a list or typed message
#[derive(Debug, Clone, PartialEq)]
pub enum Atom {
    Float(f32),
    Symbol(String),
}

impl From<f32> for Atom {
    fn from(value: f32) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Atom {
    fn from(value: &str) -> Self {
        Self::Symbol(value.to_string())
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Float(v) => write!(f, "{}", v),
            Self::Symbol(s) => write!(f, "{}", s),
        }
    }
}

/// Outbound message sent from the host to a named destination
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Bang,
    Float(f32),
    Symbol(String),
    List(Vec<Atom>),
    /// Message with a selector, e.g. `set 1 2`
    Typed { selector: String, args: Vec<Atom> },
}

impl Message {
    /// Short name of the message kind, used in logs and errors
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Bang => "bang",
            Self::Float(_) => "float",
            Self::Symbol(_) => "symbol",
            Self::List(_) => "list",
            Self::Typed { .. } => "message",
        }
    }

    pub fn typed(selector: &str, args: Vec<Atom>) -> Self {
        Self::Typed {
            selector: selector.to_string(),
            args,
        }
    }
}

impl From<f32> for Message {
    fn from(value: f32) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Message {
    fn from(value: &str) -> Self {
        Self::Symbol(value.to_string())
    }
}

/// Content of a message received from the engine
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Bang,
    Float(f32),
    Symbol(String),
    List(Vec<Atom>),
}

impl Payload {
    pub fn as_float(&self) -> Option<f32> {
        match self {
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_symbol(&self) -> Option<&str> {
        match self {
            Self::Symbol(s) => Some(s),
            _ => None,
        }
    }
}

/// Message emitted by an instance from a subscribed source
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub instance: InstanceId,
    pub source: String,
    pub payload: Payload,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_kind() {
        assert_eq!(Message::Bang.kind(), "bang");
        assert_eq!(Message::from(0.5f32).kind(), "float");
        assert_eq!(Message::from("on").kind(), "symbol");
        assert_eq!(Message::typed("set", vec![1.0f32.into()]).kind(), "message");
    }

    #[test]
    fn test_payload_accessors() {
        assert_eq!(Payload::Float(440.0).as_float(), Some(440.0));
        assert_eq!(Payload::Bang.as_float(), None);
        assert_eq!(Payload::Symbol("hi".into()).as_symbol(), Some("hi"));
    }

    #[test]
    fn test_atom_display() {
        let atoms: Vec<String> = vec![Atom::from(1.5f32), Atom::from("freq")]
            .iter()
            .map(|a| a.to_string())
            .collect();
        assert_eq!(atoms.join(" "), "1.5 freq");
    }
}
