//! Scripted vendor session and event builders for tests
//!
//! [`ScriptedSession`] answers lifecycle calls with the status events a real
//! session would emit and lets a test script the responses to each request.
//! Clones share state, so a test can keep one clone while the router owns
//! another.

use crate::error::SessionError;
use crate::gateway::VendorSession;
use crate::request::Request;
use crate::subscription::SubscriptionSpec;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use router_types::{CorrelationId, Element, Event, EventKind, Message};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

type Responder = Box<dyn FnMut(&Request, CorrelationId) -> Vec<Event> + Send>;

/// A request the session received
#[derive(Debug, Clone)]
pub struct SentRequest {
    pub correlation_id: CorrelationId,
    pub request: Request,
    pub at: Instant,
}

struct Inner {
    events_tx: Sender<Result<Event, SessionError>>,
    events_rx: Receiver<Result<Event, SessionError>>,
    responder: Mutex<Option<Responder>>,
    sent: Mutex<Vec<SentRequest>>,
    subscriptions: Mutex<Vec<(CorrelationId, SubscriptionSpec)>>,
    unsubscribed: Mutex<Vec<CorrelationId>>,
    failing_services: Mutex<HashSet<String>>,
    unreachable: bool,
    startup_failure: Option<String>,
    terminated: AtomicBool,
}

#[derive(Clone)]
pub struct ScriptedSession {
    inner: Arc<Inner>,
}

impl ScriptedSession {
    pub fn new() -> Self {
        Self::build(false, None)
    }

    /// `start()` fails as if the host could not be reached
    pub fn unreachable() -> Self {
        Self::build(true, None)
    }

    /// `start()` succeeds but the session reports `SessionStartupFailure`
    pub fn failing_startup(reason: impl Into<String>) -> Self {
        Self::build(false, Some(reason.into()))
    }

    fn build(unreachable: bool, startup_failure: Option<String>) -> Self {
        let (events_tx, events_rx) = unbounded();
        Self {
            inner: Arc::new(Inner {
                events_tx,
                events_rx,
                responder: Mutex::new(None),
                sent: Mutex::new(Vec::new()),
                subscriptions: Mutex::new(Vec::new()),
                unsubscribed: Mutex::new(Vec::new()),
                failing_services: Mutex::new(HashSet::new()),
                unreachable,
                startup_failure,
                terminated: AtomicBool::new(false),
            }),
        }
    }

    /// Answer every request with the events returned by `responder`
    pub fn respond_with<F>(&self, responder: F)
    where
        F: FnMut(&Request, CorrelationId) -> Vec<Event> + Send + 'static,
    {
        *self.inner.responder.lock() = Some(Box::new(responder));
    }

    /// Make opening `service` fail with `ServiceOpenFailure`
    pub fn fail_service(&self, service: &str) {
        self.inner.failing_services.lock().insert(service.to_string());
    }

    /// Emit an event as if the vendor sent it
    pub fn push_event(&self, event: Event) {
        let _ = self.inner.events_tx.send(Ok(event));
    }

    /// Make the next receive call fail
    pub fn fail_receive(&self, reason: impl Into<String>) {
        let _ = self
            .inner
            .events_tx
            .send(Err(SessionError::Vendor(reason.into())));
    }

    pub fn sent_requests(&self) -> Vec<SentRequest> {
        self.inner.sent.lock().clone()
    }

    pub fn subscriptions(&self) -> Vec<(CorrelationId, SubscriptionSpec)> {
        self.inner.subscriptions.lock().clone()
    }

    pub fn unsubscribed(&self) -> Vec<CorrelationId> {
        self.inner.unsubscribed.lock().clone()
    }
}

impl Default for ScriptedSession {
    fn default() -> Self {
        Self::new()
    }
}

impl VendorSession for ScriptedSession {
    fn start(&self) -> Result<(), SessionError> {
        if self.inner.unreachable {
            return Err(SessionError::Unreachable("localhost:8194".into()));
        }
        match &self.inner.startup_failure {
            Some(reason) => self.push_event(session_startup_failure(reason)),
            None => self.push_event(session_started()),
        }
        Ok(())
    }

    fn open_service(&self, name: &str) -> Result<(), SessionError> {
        if self.inner.failing_services.lock().contains(name) {
            self.push_event(service_open_failure(name, "Service not found"));
        } else {
            self.push_event(service_opened(name));
        }
        Ok(())
    }

    fn send_request(&self, request: &Request, cid: CorrelationId) -> Result<(), SessionError> {
        if self.inner.terminated.load(Ordering::SeqCst) {
            return Err(SessionError::NotOpen);
        }
        self.inner.sent.lock().push(SentRequest {
            correlation_id: cid,
            request: request.clone(),
            at: Instant::now(),
        });

        let events = match self.inner.responder.lock().as_mut() {
            Some(responder) => responder(request, cid),
            None => Vec::new(),
        };
        for event in events {
            self.push_event(event);
        }
        Ok(())
    }

    fn subscribe(&self, spec: &SubscriptionSpec, cid: CorrelationId) -> Result<(), SessionError> {
        self.inner.subscriptions.lock().push((cid, spec.clone()));
        self.push_event(subscription_started(cid));
        Ok(())
    }

    fn unsubscribe(&self, cid: CorrelationId) -> Result<(), SessionError> {
        self.inner.unsubscribed.lock().push(cid);
        Ok(())
    }

    fn next_event(&self, timeout: Duration) -> Result<Option<Event>, SessionError> {
        match self.inner.events_rx.recv_timeout(timeout) {
            Ok(Ok(event)) => Ok(Some(event)),
            Ok(Err(e)) => Err(e),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => Ok(None),
        }
    }

    fn stop(&self) -> Result<(), SessionError> {
        if !self.inner.terminated.swap(true, Ordering::SeqCst) {
            self.push_event(session_terminated());
        }
        Ok(())
    }
}

fn status(kind: EventKind, name: &str, element: Element) -> Event {
    Event::single(kind, Message::new(name, element))
}

pub fn session_started() -> Event {
    status(EventKind::SessionStatus, "SessionStarted", Element::empty_node())
}

pub fn session_terminated() -> Event {
    status(EventKind::SessionStatus, "SessionTerminated", Element::empty_node())
}

pub fn session_startup_failure(reason: &str) -> Event {
    status(
        EventKind::SessionStatus,
        "SessionStartupFailure",
        Element::node([(
            "reason",
            Element::node([
                ("category", Element::from("IO_ERROR")),
                ("description", Element::from(reason)),
            ]),
        )]),
    )
}

pub fn service_opened(service: &str) -> Event {
    status(
        EventKind::ServiceStatus,
        "ServiceOpened",
        Element::node([("serviceName", Element::from(service))]),
    )
}

pub fn service_open_failure(service: &str, reason: &str) -> Event {
    status(
        EventKind::ServiceStatus,
        "ServiceOpenFailure",
        Element::node([
            ("serviceName", Element::from(service)),
            ("reason", Element::node([("description", Element::from(reason))])),
        ]),
    )
}

/// Vendor `errorInfo` element
pub fn error_info(category: &str, subcategory: &str, message: &str) -> Element {
    Element::node([
        ("source", Element::from("scripted")),
        ("code", Element::from(-1)),
        ("category", Element::from(category)),
        ("subcategory", Element::from(subcategory)),
        ("message", Element::from(message)),
    ])
}

/// One `securityData` item carrying field values
pub fn security_data(security: &str, fields: &[(&str, Element)]) -> Element {
    Element::node([
        ("security", Element::from(security)),
        (
            "fieldData",
            Element::node(fields.iter().map(|(name, value)| (*name, value.clone()))),
        ),
        ("fieldExceptions", Element::array([])),
    ])
}

/// One `securityData` item with per-field exceptions
pub fn security_data_with_exceptions(
    security: &str,
    fields: &[(&str, Element)],
    exceptions: &[(&str, Element)],
) -> Element {
    Element::node([
        ("security", Element::from(security)),
        (
            "fieldData",
            Element::node(fields.iter().map(|(name, value)| (*name, value.clone()))),
        ),
        (
            "fieldExceptions",
            Element::array(exceptions.iter().map(|(field, info)| {
                Element::node([
                    ("fieldId", Element::from(*field)),
                    ("errorInfo", info.clone()),
                ])
            })),
        ),
    ])
}

/// One `securityData` item rejected as a whole
pub fn security_error(security: &str, category: &str, message: &str) -> Element {
    Element::node([
        ("security", Element::from(security)),
        (
            "securityError",
            error_info(category, "INVALID_SECURITY", message),
        ),
    ])
}

/// One `securityData` item rejected by a vendor quota, e.g. `DAILY_LIMIT_REACHED`
pub fn security_throttled(security: &str, subcategory: &str) -> Element {
    Element::node([
        ("security", Element::from(security)),
        (
            "securityError",
            error_info("LIMIT", subcategory, "Limit reached"),
        ),
    ])
}

pub fn reference_data_message(cid: CorrelationId, items: Vec<Element>) -> Message {
    Message::new(
        "ReferenceDataResponse",
        Element::node([("securityData", Element::array(items))]),
    )
    .with_correlation_id(cid)
}

/// Final reference-data response
pub fn reference_data_response(cid: CorrelationId, items: Vec<Element>) -> Event {
    Event::single(EventKind::Response, reference_data_message(cid, items))
}

/// Non-final reference-data response
pub fn reference_data_partial(cid: CorrelationId, items: Vec<Element>) -> Event {
    Event::single(EventKind::PartialResponse, reference_data_message(cid, items))
}

/// `responseError` message in its nested-leaf shape
pub fn response_error(cid: CorrelationId, subcategory: &str) -> Message {
    Message::new(
        "responseError",
        Element::node([("responseError", Element::from(subcategory))]),
    )
    .with_correlation_id(cid)
}

/// Final response holding only a daily-limit throttle
pub fn daily_limit_event(cid: CorrelationId) -> Event {
    Event::single(EventKind::Response, response_error(cid, "DAILY_LIMIT_REACHED"))
}

pub fn request_failure(cid: CorrelationId, category: &str, message: &str) -> Event {
    Event::single(
        EventKind::RequestStatus,
        Message::new(
            "RequestFailure",
            Element::node([(
                "reason",
                Element::node([
                    ("category", Element::from(category)),
                    ("description", Element::from(message)),
                ]),
            )]),
        )
        .with_correlation_id(cid),
    )
}

/// Message whose name no response handler knows
pub fn non_error_message(cid: CorrelationId) -> Message {
    Message::new(
        "validMessage",
        Element::node([("validMessage", Element::from("DAILY_LIMIT_REACHED"))]),
    )
    .with_correlation_id(cid)
}

/// Final field-search response; each entry is `(id, mnemonic)`
pub fn field_response(cid: CorrelationId, fields: &[(&str, &str)]) -> Event {
    let items = fields.iter().map(|(id, mnemonic)| {
        Element::node([
            ("id", Element::from(*id)),
            (
                "fieldInfo",
                Element::node([
                    ("mnemonic", Element::from(*mnemonic)),
                    ("description", Element::from(format!("{} description", mnemonic))),
                ]),
            ),
        ])
    });
    Event::single(
        EventKind::Response,
        Message::new(
            "fieldResponse",
            Element::node([("fieldData", Element::array(items))]),
        )
        .with_correlation_id(cid),
    )
}

/// Final instrument-lookup response; each entry is `(security, description)`
pub fn instrument_list_response(cid: CorrelationId, results: &[(&str, &str)]) -> Event {
    let items = results.iter().map(|(security, description)| {
        Element::node([
            ("security", Element::from(*security)),
            ("description", Element::from(*description)),
        ])
    });
    Event::single(
        EventKind::Response,
        Message::new(
            "InstrumentListResponse",
            Element::node([("results", Element::array(items))]),
        )
        .with_correlation_id(cid),
    )
}

pub fn subscription_started(cid: CorrelationId) -> Event {
    Event::single(
        EventKind::SubscriptionStatus,
        Message::new("SubscriptionStarted", Element::empty_node()).with_correlation_id(cid),
    )
}

/// Market data update wrapped in a same-name child, as the vendor sends it
pub fn market_data(cid: CorrelationId, fields: &[(&str, Element)]) -> Event {
    let payload = Element::node(fields.iter().map(|(name, value)| (*name, value.clone())));
    Event::single(
        EventKind::SubscriptionData,
        Message::new(
            "MarketDataEvents",
            Element::node([("MarketDataEvents", payload)]),
        )
        .with_correlation_id(cid),
    )
}

pub fn subscription_failure(cid: CorrelationId, category: &str, subcategory: &str) -> Event {
    Event::single(
        EventKind::SubscriptionStatus,
        Message::new(
            "SubscriptionFailure",
            Element::node([("reason", error_info(category, subcategory, "Subscription failed"))]),
        )
        .with_correlation_id(cid),
    )
}
