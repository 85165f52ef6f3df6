//! Dispatcher
//!
//! Single consumer of the inbound queue. Vendor events from the pump and
//! commands from the orchestrators arrive on the same queue and are handled
//! strictly in arrival order. The registry, every request handle and every
//! subscription handle are touched by this task only.
//!
//! Nothing in here blocks except the vendor unsubscribe call, which goes
//! through the gateway's submission lock.

use crate::classifier::{describe, Classification, ErrorClassifier};
use crate::error::RouterError;
use crate::gateway::{SessionGateway, SessionStatus};
use crate::handle::RequestHandle;
use crate::parse;
use crate::registry::{CorrelationRegistry, RequestId};
use crate::retry::RetryPolicy;
use crate::subscription::{EndReason, SubscriptionHandle, SubscriptionUpdate};
use router_config::{ErrorBehaviour, RouterConfig};
use router_types::{CorrelationId, ErrorRecord, ErrorScope, Event, EventKind, Message, ThrottleKind};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Commands sent to the dispatcher by the orchestrators
pub enum Command {
    /// Track a request before any of its sub-requests is submitted
    Register { handle: RequestHandle },
    /// A submission failed; fail whatever owns `cid`
    SubmitFailed { cid: CorrelationId, error: RouterError },
    Subscribe { handle: SubscriptionHandle },
    Unsubscribe { cid: CorrelationId },
    Shutdown,
}

/// Everything the dispatcher consumes
pub enum Inbound {
    Event(Event),
    /// The event pump could not read from the session
    SessionFatal(String),
    Command(Command),
}

/// What handling one response message did to its request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Applied,
    Retried,
    Resolved,
    Ignored,
}

pub struct Dispatcher {
    inbound: mpsc::UnboundedReceiver<Inbound>,
    control: mpsc::UnboundedSender<Inbound>,
    gateway: Arc<SessionGateway>,
    registry: CorrelationRegistry<RequestHandle>,
    subscriptions: HashMap<CorrelationId, SubscriptionHandle>,
    classifier: ErrorClassifier,
    retry: RetryPolicy,
    load: watch::Sender<usize>,
}

impl Dispatcher {
    pub fn new(
        inbound: mpsc::UnboundedReceiver<Inbound>,
        control: mpsc::UnboundedSender<Inbound>,
        gateway: Arc<SessionGateway>,
        config: &RouterConfig,
        load: watch::Sender<usize>,
    ) -> Self {
        Self {
            inbound,
            control,
            gateway,
            registry: CorrelationRegistry::new(),
            subscriptions: HashMap::new(),
            classifier: ErrorClassifier::new(&config.classifier),
            retry: RetryPolicy::from_config(&config.retry),
            load,
        }
    }

    pub async fn run(mut self) {
        info!("Dispatcher started");
        while let Some(inbound) = self.inbound.recv().await {
            match inbound {
                Inbound::Event(event) => self.handle_event(event),
                Inbound::SessionFatal(reason) => {
                    error!(%reason, "Event pump failed");
                    self.session_lost(
                        SessionStatus::Failed(reason.clone()),
                        RouterError::SessionClosed(format!("event pump failed: {}", reason)),
                    );
                }
                Inbound::Command(Command::Shutdown) => {
                    self.session_lost(
                        SessionStatus::Terminated,
                        RouterError::SessionClosed("router stopped".into()),
                    );
                    self.publish_load();
                    break;
                }
                Inbound::Command(command) => self.handle_command(command),
            }
            self.publish_load();
        }
        info!("Dispatcher stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Register { handle } => {
                let request_id = handle.id();
                let cids = handle.correlation_ids();
                debug!(%request_id, subrequests = cids.len(), "Registering request");
                if !self.registry.insert(request_id, cids, handle) {
                    // the rejected handle was dropped and its caller told
                    error!(%request_id, "Correlation id collision, request rejected");
                }
            }
            Command::SubmitFailed { cid, error } => {
                if let Some(request_id) = self.registry.owner(cid) {
                    warn!(correlation_id = %cid, %error, "Submission failed");
                    if let Some(handle) = self.registry.remove(request_id) {
                        handle.fail(error);
                    }
                } else if self.subscriptions.remove(&cid).is_some() {
                    warn!(correlation_id = %cid, %error, "Subscription failed to submit");
                }
            }
            Command::Subscribe { handle } => {
                debug!(correlation_id = %handle.correlation_id(), "Registering subscription");
                self.subscriptions.insert(handle.correlation_id(), handle);
            }
            Command::Unsubscribe { cid } => {
                let Some(handle) = self.subscriptions.remove(&cid) else {
                    debug!(correlation_id = %cid, "Unsubscribe for unknown subscription");
                    return;
                };
                if let Err(e) = self.gateway.unsubscribe(cid) {
                    warn!(correlation_id = %cid, error = %e, "Unsubscribe failed");
                }
                handle.end(EndReason::Cancelled);
            }
            Command::Shutdown => {}
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event.kind {
            EventKind::SessionStatus => {
                for msg in &event.messages {
                    self.on_session_status(msg);
                }
            }
            EventKind::ServiceStatus => {
                for msg in &event.messages {
                    self.on_service_status(msg);
                }
            }
            EventKind::Admin => {
                for msg in &event.messages {
                    on_admin(msg);
                }
            }
            kind if kind.is_response() => self.on_response(&event),
            EventKind::SubscriptionStatus | EventKind::SubscriptionData => {
                for msg in &event.messages {
                    self.on_subscription(event.kind, msg);
                }
            }
            other => {
                warn!(kind = ?other, messages = event.messages.len(), "Dropping unexpected event");
            }
        }
    }

    fn on_session_status(&mut self, msg: &Message) {
        match msg.name.as_str() {
            "SessionStarted" => {
                info!("Session started");
                self.gateway.state().set_status(SessionStatus::Started);
            }
            "SessionStartupFailure" => {
                let reason = describe(&msg.element);
                error!(%reason, "Session startup failed");
                self.session_lost(
                    SessionStatus::Failed(reason.clone()),
                    RouterError::Connection(reason),
                );
            }
            "SessionTerminated" => {
                info!(
                    pending = self.registry.len(),
                    subscriptions = self.subscriptions.len(),
                    "Session terminated"
                );
                self.session_lost(
                    SessionStatus::Terminated,
                    RouterError::SessionClosed("session terminated".into()),
                );
            }
            "SessionConnectionUp" => info!("Session connection up"),
            "SessionConnectionDown" => warn!("Session connection down"),
            "SessionClusterInfo" | "SessionClusterUpdate" => debug!(name = %msg.name, "Cluster status"),
            other => warn!(name = other, "Malformed session status message dropped"),
        }
    }

    fn on_service_status(&mut self, msg: &Message) {
        let Some(service) = msg.element.get_str("serviceName") else {
            warn!(name = %msg.name, "Service status without serviceName dropped");
            return;
        };
        match msg.name.as_str() {
            "ServiceOpened" => {
                info!(service, "Service opened");
                self.gateway.state().service_opened(service);
            }
            "ServiceOpenFailure" => {
                let reason = describe(&msg.element);
                warn!(service, %reason, "Service failed to open");
                self.gateway.state().service_failed(service, reason);
            }
            other => warn!(name = other, service, "Malformed service status message dropped"),
        }
    }

    fn on_response(&mut self, event: &Event) {
        let terminal = event.kind.is_terminal();
        let mut finished: Vec<CorrelationId> = Vec::new();

        for msg in &event.messages {
            if msg.correlation_ids.is_empty() {
                warn!(name = %msg.name, "Response message without correlation id dropped");
                continue;
            }
            for &cid in &msg.correlation_ids {
                if self.on_response_message(cid, msg) == Outcome::Applied && !finished.contains(&cid) {
                    finished.push(cid);
                }
            }
        }

        if terminal {
            for cid in finished {
                self.finish_subrequest(cid);
            }
        }
    }

    fn on_response_message(&mut self, cid: CorrelationId, msg: &Message) -> Outcome {
        let Some((request_id, handle)) = self.registry.lookup_mut(cid) else {
            debug!(correlation_id = %cid, name = %msg.name, "Message for unknown correlation id dropped");
            return Outcome::Ignored;
        };

        let extracted = match parse::extract(handle.kind(), msg) {
            Ok(Some(extracted)) => extracted,
            Ok(None) => {
                let err = RouterError::MalformedEvent(format!("unexpected message '{}'", msg.name));
                warn!(correlation_id = %cid, error = %err, "Dropping message");
                return Outcome::Ignored;
            }
            Err(e) => {
                let err = RouterError::MalformedEvent(format!("{}: {}", msg.name, e));
                warn!(correlation_id = %cid, error = %err, "Dropping message");
                return Outcome::Ignored;
            }
        };

        let mut records = Vec::with_capacity(extracted.errors.len());
        let mut throttle: Option<(ThrottleKind, ErrorRecord)> = None;
        let mut fatal = false;
        for raw in extracted.errors {
            let (class, mut record) = self.classifier.record(raw.scope, &raw.element);
            record.correlation_id = Some(cid);
            record.security = raw.security;
            record.field = raw.field;
            match class {
                Classification::Ignorable => {
                    debug!(correlation_id = %cid, error = %record, "Ignorable error");
                    records.push(record);
                }
                Classification::Recoverable(kind) => {
                    if throttle.is_none() {
                        throttle = Some((kind, record));
                    }
                }
                Classification::Fatal => {
                    debug!(correlation_id = %cid, error = %record, "Fatal error");
                    records.push(record);
                    fatal = true;
                }
            }
        }

        if let Some((kind, record)) = throttle {
            let attempts = handle.subrequest(cid).map(|sub| sub.attempts).unwrap_or(0);
            if self.retry.should_retry(attempts) {
                // the whole attempt is redone, this message included
                return self.resubmit(request_id, cid, kind);
            }
            warn!(
                %request_id,
                correlation_id = %cid,
                throttle = %kind,
                attempts,
                "Retries exhausted"
            );
            records.push(record);
            fatal = true;
        }

        for record in records {
            handle.record_error(cid, record);
        }
        for (key, row) in extracted.rows {
            handle.merge_row(cid, key, row);
        }

        if fatal && handle.behaviour() == ErrorBehaviour::Raise {
            self.fail_request(request_id);
            return Outcome::Resolved;
        }
        Outcome::Applied
    }

    /// Rebind a throttled sub-request to a fresh correlation id and resubmit
    /// it after the backoff delay
    fn resubmit(&mut self, request_id: RequestId, cid: CorrelationId, kind: ThrottleKind) -> Outcome {
        let new_cid = self.gateway.next_correlation_id();
        let Some(handle) = self.registry.get_mut(request_id) else {
            return Outcome::Ignored;
        };
        let Some((request, attempt)) = handle.rebind(cid, new_cid) else {
            return Outcome::Ignored;
        };
        self.registry.rebind(cid, new_cid);

        let delay = self.retry.delay(attempt);
        info!(
            %request_id,
            correlation_id = %new_cid,
            previous = %cid,
            throttle = %kind,
            attempt = attempt + 1,
            ?delay,
            "Throttled, resubmitting"
        );

        let gateway = Arc::clone(&self.gateway);
        let control = self.control.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(error) = gateway.submit(&request, new_cid) {
                let _ = control.send(Inbound::Command(Command::SubmitFailed { cid: new_cid, error }));
            }
        });
        Outcome::Retried
    }

    fn finish_subrequest(&mut self, cid: CorrelationId) {
        let Some((request_id, remaining)) = self.registry.release(cid) else {
            return;
        };
        if let Some(handle) = self.registry.get_mut(request_id) {
            handle.finish_subrequest(cid);
        }
        if remaining == 0 {
            if let Some(handle) = self.registry.remove(request_id) {
                debug!(%request_id, errors = handle.error_count(), "Request complete");
                handle.complete();
            }
        }
    }

    fn fail_request(&mut self, request_id: RequestId) {
        if let Some(handle) = self.registry.remove(request_id) {
            debug!(%request_id, errors = handle.error_count(), "Request failed");
            handle.fail_request();
        }
    }

    fn on_subscription(&mut self, kind: EventKind, msg: &Message) {
        for &cid in &msg.correlation_ids {
            if !self.subscriptions.contains_key(&cid) {
                debug!(correlation_id = %cid, name = %msg.name, "Subscription message for unknown correlation id dropped");
                continue;
            }

            if kind == EventKind::SubscriptionData {
                self.on_subscription_data(cid, msg);
            } else {
                self.on_subscription_status(cid, msg);
            }
        }
    }

    fn on_subscription_data(&mut self, cid: CorrelationId, msg: &Message) {
        let row = match parse::subscription_row(msg) {
            Ok(row) => row,
            Err(e) => {
                warn!(correlation_id = %cid, error = %e, "Malformed subscription data dropped");
                return;
            }
        };
        let delivered = self
            .subscriptions
            .get_mut(&cid)
            .map(|sub| sub.deliver(SubscriptionUpdate::Data(row)))
            .unwrap_or(false);
        if !delivered {
            debug!(correlation_id = %cid, "Subscriber gone");
        }
    }

    fn on_subscription_status(&mut self, cid: CorrelationId, msg: &Message) {
        match msg.name.as_str() {
            "SubscriptionStarted" => info!(correlation_id = %cid, "Subscription started"),
            "SubscriptionStreamsActivated" | "SubscriptionStreamsDeactivated" => {
                debug!(correlation_id = %cid, name = %msg.name, "Subscription streams changed")
            }
            "SubscriptionFailure" | "SubscriptionTerminated" => {
                let reason = msg.element.get("reason").unwrap_or(&msg.element);
                let (class, mut record) = self.classifier.record(ErrorScope::Request, reason);
                record.correlation_id = Some(cid);

                if let Classification::Recoverable(_) = class {
                    warn!(correlation_id = %cid, error = %record, "Subscription throttled");
                    if let Some(sub) = self.subscriptions.get_mut(&cid) {
                        sub.deliver(SubscriptionUpdate::Error(record));
                    }
                    return;
                }

                warn!(correlation_id = %cid, error = %record, name = %msg.name, "Subscription ended by session");
                if let Some(sub) = self.subscriptions.remove(&cid) {
                    sub.end(EndReason::Failed(record));
                }
            }
            other => warn!(correlation_id = %cid, name = other, "Malformed subscription status dropped"),
        }
    }

    /// Fail every pending request and end every subscription
    fn session_lost(&mut self, status: SessionStatus, error: RouterError) {
        self.gateway.state().set_status(status);
        self.gateway.state().fail_pending_services(&error.to_string());

        for (request_id, handle) in self.registry.drain() {
            debug!(%request_id, "Failing pending request");
            handle.fail(error.clone());
        }
        for (_, sub) in self.subscriptions.drain() {
            sub.end(EndReason::SessionTerminated);
        }
    }

    fn publish_load(&self) {
        let pending = self.registry.len();
        self.load.send_if_modified(|current| {
            if *current == pending {
                false
            } else {
                *current = pending;
                true
            }
        });
    }
}

fn on_admin(msg: &Message) {
    match msg.name.as_str() {
        "SlowConsumerWarning" => warn!("Slow consumer: events are not drained fast enough"),
        "SlowConsumerWarningCleared" => warn!("Slow consumer warning cleared"),
        "DataLoss" => warn!(details = ?msg.element, "Data lost due to event queue overflow"),
        "RequestTemplateAvailable" | "RequestTemplatePending" | "RequestTemplateTerminated" => {
            debug!(name = %msg.name, "Request template status")
        }
        other => warn!(name = other, "Malformed admin message dropped"),
    }
}
