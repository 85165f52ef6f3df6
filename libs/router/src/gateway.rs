//! Session gateway
//!
//! The only component that calls into the vendor session's submission path.
//! Submissions from concurrent callers are serialized by a lock held around
//! the vendor call only, never across an await.
//!
//! Session and service readiness live in [`SessionState`], shared with the
//! dispatcher which updates it from status events.

use crate::error::{Result, RouterError, SessionError};
use crate::request::Request;
use crate::subscription::SubscriptionSpec;
use parking_lot::Mutex;
use router_types::{CorrelationId, CorrelationIdGenerator, Event};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Blocking vendor session API
///
/// Implementations must tolerate `next_event` running on the event pump
/// thread while the other methods are called from the gateway.
pub trait VendorSession: Send + Sync + 'static {
    /// Begin connecting; `SessionStarted` arrives later as an event
    fn start(&self) -> std::result::Result<(), SessionError>;

    /// Begin opening a service; `ServiceOpened` arrives later as an event
    fn open_service(&self, name: &str) -> std::result::Result<(), SessionError>;

    fn send_request(&self, request: &Request, cid: CorrelationId) -> std::result::Result<(), SessionError>;

    fn subscribe(&self, spec: &SubscriptionSpec, cid: CorrelationId) -> std::result::Result<(), SessionError>;

    fn unsubscribe(&self, cid: CorrelationId) -> std::result::Result<(), SessionError>;

    /// Wait up to `timeout` for the next event; `Ok(None)` on timeout
    fn next_event(&self, timeout: Duration) -> std::result::Result<Option<Event>, SessionError>;

    /// Begin stopping; `SessionTerminated` arrives later as an event
    fn stop(&self) -> std::result::Result<(), SessionError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Starting,
    Started,
    Terminated,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceStatus {
    Requested,
    Opened,
    Failed(String),
}

/// Process-scoped readiness of the single vendor session
#[derive(Debug)]
pub struct SessionState {
    status: watch::Sender<SessionStatus>,
    services: Mutex<HashMap<String, watch::Sender<ServiceStatus>>>,
}

impl SessionState {
    pub fn new() -> Self {
        let (status, _) = watch::channel(SessionStatus::Idle);
        Self {
            status,
            services: Mutex::new(HashMap::new()),
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    pub fn set_status(&self, status: SessionStatus) {
        debug!(?status, "Session status changed");
        self.status.send_replace(status);
    }

    pub fn service_status(&self, name: &str) -> Option<ServiceStatus> {
        self.services.lock().get(name).map(|tx| tx.borrow().clone())
    }

    /// Watch a service, marking it requested if nobody asked for it yet
    ///
    /// The flag is true when the caller must issue the open call. A service
    /// that previously failed to open is requested again.
    fn request_service(&self, name: &str) -> (watch::Receiver<ServiceStatus>, bool) {
        let mut services = self.services.lock();
        match services.get(name) {
            Some(tx) if !matches!(*tx.borrow(), ServiceStatus::Failed(_)) => (tx.subscribe(), false),
            Some(tx) => {
                tx.send_replace(ServiceStatus::Requested);
                (tx.subscribe(), true)
            }
            None => {
                let (tx, rx) = watch::channel(ServiceStatus::Requested);
                services.insert(name.to_string(), tx);
                (rx, true)
            }
        }
    }

    pub fn service_opened(&self, name: &str) {
        self.update_service(name, ServiceStatus::Opened);
    }

    pub fn service_failed(&self, name: &str, reason: impl Into<String>) {
        self.update_service(name, ServiceStatus::Failed(reason.into()));
    }

    /// Fail every service not yet opened, e.g. when the session ends
    pub fn fail_pending_services(&self, reason: &str) {
        for tx in self.services.lock().values() {
            tx.send_if_modified(|status| {
                if *status == ServiceStatus::Requested {
                    *status = ServiceStatus::Failed(reason.to_string());
                    true
                } else {
                    false
                }
            });
        }
    }

    fn update_service(&self, name: &str, status: ServiceStatus) {
        let mut services = self.services.lock();
        match services.get(name) {
            Some(tx) => {
                tx.send_replace(status);
            }
            None => {
                let (tx, _) = watch::channel(status);
                services.insert(name.to_string(), tx);
            }
        }
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SessionGateway {
    session: Arc<dyn VendorSession>,
    state: Arc<SessionState>,
    ids: CorrelationIdGenerator,
    submit_lock: Mutex<()>,
    stopped: AtomicBool,
}

impl SessionGateway {
    pub fn new(session: Arc<dyn VendorSession>, state: Arc<SessionState>) -> Self {
        Self {
            session,
            state,
            ids: CorrelationIdGenerator::new(),
            submit_lock: Mutex::new(()),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> &Arc<SessionState> {
        &self.state
    }

    pub fn next_correlation_id(&self) -> CorrelationId {
        self.ids.next_id()
    }

    /// Start the vendor session
    pub fn open(&self) -> Result<()> {
        self.state.set_status(SessionStatus::Starting);
        let _guard = self.submit_lock.lock();
        self.session.start().map_err(|e| {
            warn!(error = %e, "Failed to start session");
            self.state.set_status(SessionStatus::Failed(e.to_string()));
            RouterError::from(e)
        })
    }

    /// Wait for the session to report `SessionStarted`
    pub async fn wait_started(&self, timeout: Duration) -> Result<()> {
        let mut status = self.state.watch_status();
        let outcome = tokio::time::timeout(
            timeout,
            status.wait_for(|s| !matches!(s, SessionStatus::Idle | SessionStatus::Starting)),
        )
        .await;

        let settled = match outcome {
            Ok(Ok(current)) => (*current).clone(),
            Ok(Err(_)) => return Err(RouterError::Connection("session state dropped".into())),
            Err(_) => {
                return Err(RouterError::Connection(format!(
                    "session did not start within {:?}",
                    timeout
                )))
            }
        };

        match settled {
            SessionStatus::Started => {
                info!("Session started");
                Ok(())
            }
            SessionStatus::Failed(reason) => Err(RouterError::Connection(reason)),
            other => Err(RouterError::Connection(format!(
                "session ended during startup ({:?})",
                other
            ))),
        }
    }

    /// Open `name` unless already open and wait for it to become usable
    pub async fn ensure_service(&self, name: &str, timeout: Duration) -> Result<()> {
        let (mut status, needs_open) = self.state.request_service(name);

        if needs_open {
            self.require_started()?;
            debug!(service = name, "Opening service");
            let opened = {
                let _guard = self.submit_lock.lock();
                self.session.open_service(name)
            };
            if let Err(e) = opened {
                self.state.service_failed(name, e.to_string());
                return Err(RouterError::Connection(format!(
                    "failed to open service {}: {}",
                    name, e
                )));
            }
        }

        let outcome =
            tokio::time::timeout(timeout, status.wait_for(|s| *s != ServiceStatus::Requested)).await;

        let settled = match outcome {
            Ok(Ok(current)) => (*current).clone(),
            Ok(Err(_)) => ServiceStatus::Failed("service state dropped".into()),
            Err(_) => {
                self.state.service_failed(name, "open timed out");
                return Err(RouterError::Connection(format!(
                    "service {} not opened within {:?}",
                    name, timeout
                )));
            }
        };

        match settled {
            ServiceStatus::Opened => Ok(()),
            ServiceStatus::Failed(reason) => Err(RouterError::Connection(format!(
                "service {} failed to open: {}",
                name, reason
            ))),
            ServiceStatus::Requested => Err(RouterError::Connection(format!(
                "service {} still pending",
                name
            ))),
        }
    }

    pub fn submit(&self, request: &Request, cid: CorrelationId) -> Result<()> {
        self.require_started()?;
        let _guard = self.submit_lock.lock();
        debug!(correlation_id = %cid, operation = request.operation, "Submitting request");
        self.session.send_request(request, cid).map_err(RouterError::from)
    }

    pub fn subscribe(&self, spec: &SubscriptionSpec, cid: CorrelationId) -> Result<()> {
        self.require_started()?;
        let _guard = self.submit_lock.lock();
        debug!(correlation_id = %cid, security = %spec.security, "Subscribing");
        self.session.subscribe(spec, cid).map_err(RouterError::from)
    }

    pub fn unsubscribe(&self, cid: CorrelationId) -> Result<()> {
        let _guard = self.submit_lock.lock();
        debug!(correlation_id = %cid, "Unsubscribing");
        self.session.unsubscribe(cid).map_err(RouterError::from)
    }

    /// Stop the session; later calls do nothing
    pub fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Stopping session");
        let _guard = self.submit_lock.lock();
        self.session.stop().map_err(RouterError::from)
    }

    fn require_started(&self) -> Result<()> {
        match self.state.status() {
            SessionStatus::Started => Ok(()),
            SessionStatus::Terminated => Err(RouterError::SessionClosed("session terminated".into())),
            other => Err(RouterError::Connection(format!("session not open ({:?})", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{ReferenceDataRequest, RequestSpec, REFDATA_SERVICE};
    use crate::test_utils::ScriptedSession;

    fn gateway() -> (ScriptedSession, SessionGateway) {
        let session = ScriptedSession::new();
        let gateway = SessionGateway::new(Arc::new(session.clone()), Arc::new(SessionState::new()));
        (session, gateway)
    }

    fn request() -> Request {
        RequestSpec::from(ReferenceDataRequest::new(["F Equity"], ["PX_LAST"]))
            .split(10)
            .remove(0)
    }

    #[test]
    fn test_submit_requires_started_session() {
        let (session, gateway) = gateway();
        let err = gateway.submit(&request(), CorrelationId::new(1)).unwrap_err();
        assert!(err.is_connection_error());

        gateway.state().set_status(SessionStatus::Started);
        gateway.submit(&request(), CorrelationId::new(2)).unwrap();
        assert_eq!(session.sent_requests().len(), 1);
        assert_eq!(session.sent_requests()[0].correlation_id, CorrelationId::new(2));

        gateway.state().set_status(SessionStatus::Terminated);
        let err = gateway.submit(&request(), CorrelationId::new(3)).unwrap_err();
        assert!(matches!(err, RouterError::SessionClosed(_)));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (session, gateway) = gateway();
        gateway.stop().unwrap();
        gateway.stop().unwrap();

        let first = session.next_event(Duration::from_millis(10)).unwrap();
        assert!(first.map(|e| e.is_session_terminated()).unwrap_or(false));
        assert!(session.next_event(Duration::from_millis(10)).unwrap().is_none());
    }

    #[test]
    fn test_correlation_ids_are_unique() {
        let (_, gateway) = gateway();
        let a = gateway.next_correlation_id();
        let b = gateway.next_correlation_id();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_wait_started_reports_failure_reason() {
        let (_, gateway) = gateway();
        gateway
            .state()
            .set_status(SessionStatus::Failed("Connection refused".into()));

        let err = gateway.wait_started(Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, RouterError::Connection(reason) if reason == "Connection refused"));
    }

    #[tokio::test]
    async fn test_wait_started_times_out() {
        let (_, gateway) = gateway();
        let err = gateway.wait_started(Duration::from_millis(20)).await.unwrap_err();
        assert!(err.is_connection_error());
    }

    #[tokio::test]
    async fn test_ensure_service_waits_for_open() {
        let (_, gateway) = gateway();
        gateway.state().set_status(SessionStatus::Started);
        let state = Arc::clone(gateway.state());

        let (opened, ()) = tokio::join!(
            gateway.ensure_service(REFDATA_SERVICE, Duration::from_secs(1)),
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                state.service_opened(REFDATA_SERVICE);
            }
        );
        opened.unwrap();
        assert_eq!(
            gateway.state().service_status(REFDATA_SERVICE),
            Some(ServiceStatus::Opened)
        );

        // already open: no wait
        gateway
            .ensure_service(REFDATA_SERVICE, Duration::from_millis(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_ensure_service_timeout_marks_failed() {
        let (_, gateway) = gateway();
        gateway.state().set_status(SessionStatus::Started);

        let err = gateway
            .ensure_service(REFDATA_SERVICE, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.is_connection_error());
        assert!(matches!(
            gateway.state().service_status(REFDATA_SERVICE),
            Some(ServiceStatus::Failed(_))
        ));
    }

    #[test]
    fn test_pending_services_fail_on_session_loss() {
        let state = SessionState::new();
        let (rx, needs_open) = state.request_service(REFDATA_SERVICE);
        assert!(needs_open);

        state.fail_pending_services("session terminated");
        assert_eq!(
            *rx.borrow(),
            ServiceStatus::Failed("session terminated".into())
        );

        // a failed service is requested again
        let (_, needs_open) = state.request_service(REFDATA_SERVICE);
        assert!(needs_open);
    }
}
