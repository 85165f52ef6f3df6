//! Events emitted by the vendor session
//!
//! An `Event` carries a type tag and an ordered batch of `Message`s. Each
//! message names itself, lists the correlation identifiers it belongs to and
//! carries one payload `Element`.

use crate::correlation::CorrelationId;
use crate::element::Element;
use serde::{Deserialize, Serialize};

/// Type tag of a vendor event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    SessionStatus,
    ServiceStatus,
    Admin,
    /// Non-terminal part of a request's response
    PartialResponse,
    /// Final part of a request's response
    Response,
    /// Request-level status, e.g. `RequestFailure`; terminal
    RequestStatus,
    SubscriptionStatus,
    SubscriptionData,
    AuthorizationStatus,
    ResolutionStatus,
    TopicStatus,
    TokenStatus,
    Request,
    Unknown,
}

impl EventKind {
    /// Events routed to request handles by correlation id
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            EventKind::PartialResponse | EventKind::Response | EventKind::RequestStatus
        )
    }

    /// Response-class events that end their request
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventKind::Response | EventKind::RequestStatus)
    }
}

/// One message inside an event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub name: String,
    pub correlation_ids: Vec<CorrelationId>,
    pub element: Element,
}

impl Message {
    pub fn new(name: impl Into<String>, element: Element) -> Self {
        Self {
            name: name.into(),
            correlation_ids: Vec::new(),
            element,
        }
    }

    pub fn with_correlation_id(mut self, id: CorrelationId) -> Self {
        self.correlation_ids.push(id);
        self
    }

    /// First correlation id, if the message carries any
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.correlation_ids.first().copied()
    }

    /// Payload root, unwrapping one level of same-name nesting
    ///
    /// Some messages arrive as `name -> { name -> {...} }`; both shapes read
    /// the same through this accessor.
    pub fn payload(&self) -> &Element {
        match self.element.get(&self.name) {
            Some(inner) if !inner.is_leaf() => inner,
            _ => &self.element,
        }
    }
}

/// A batch of messages tagged with one event kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub messages: Vec<Message>,
}

impl Event {
    pub fn new(kind: EventKind, messages: Vec<Message>) -> Self {
        Self { kind, messages }
    }

    /// Single-message event
    pub fn single(kind: EventKind, message: Message) -> Self {
        Self::new(kind, vec![message])
    }

    /// True for the session's final status event
    ///
    /// The event pump uses this to know when to stop reading.
    pub fn is_session_terminated(&self) -> bool {
        self.kind == EventKind::SessionStatus
            && self.messages.iter().any(|m| m.name == "SessionTerminated")
    }
}
