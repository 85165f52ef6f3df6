//! Public request and subscription API
//!
//! [`Router`] wires the gateway, the event pump and the dispatcher together
//! and exposes awaitable request/response calls plus subscription streams.
//!
//! A request is registered with the dispatcher before its first sub-request
//! is submitted, so a response can never overtake its registration on the
//! queue.

use crate::dispatcher::{Command, Dispatcher, Inbound};
use crate::error::{Result, RouterError};
use crate::gateway::{SessionGateway, SessionState, SessionStatus, VendorSession};
use crate::handle::{RequestHandle, ResponseData};
use crate::pump::EventPump;
use crate::registry::RequestId;
use crate::request::{
    FieldSearchRequest, InstrumentLookupRequest, ReferenceDataRequest, Request, RequestSpec,
    MKTDATA_SERVICE,
};
use crate::subscription::{SubscriptionHandle, SubscriptionSpec, SubscriptionStream};
use parking_lot::Mutex;
use router_config::{ErrorBehaviour, RouterConfig};
use router_types::{CorrelationId, ErrorRecord};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

struct Workers {
    pump: EventPump,
    dispatcher: JoinHandle<()>,
}

pub struct Router {
    config: RouterConfig,
    gateway: Arc<SessionGateway>,
    control: mpsc::UnboundedSender<Inbound>,
    load: watch::Receiver<usize>,
    request_ids: AtomicU64,
    closing: AtomicBool,
    workers: Mutex<Option<Workers>>,
}

impl Router {
    /// Start the session and wait until it accepts requests
    pub async fn start<S: VendorSession>(session: S, config: RouterConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| RouterError::Config(format!("{:#}", e)))?;

        let session: Arc<dyn VendorSession> = Arc::new(session);
        let state = Arc::new(SessionState::new());
        let gateway = Arc::new(SessionGateway::new(Arc::clone(&session), state));

        let (control, inbound) = mpsc::unbounded_channel();
        let (load_tx, load) = watch::channel(0usize);

        let pump = EventPump::spawn(session, control.clone(), config.session.poll_interval())
            .map_err(|e| RouterError::Connection(format!("failed to spawn event pump: {}", e)))?;
        let dispatcher = Dispatcher::new(
            inbound,
            control.clone(),
            Arc::clone(&gateway),
            &config,
            load_tx,
        );
        let dispatcher = tokio::spawn(dispatcher.run());

        let router = Self {
            config,
            gateway,
            control,
            load,
            request_ids: AtomicU64::new(1),
            closing: AtomicBool::new(false),
            workers: Mutex::new(Some(Workers { pump, dispatcher })),
        };

        let connect_timeout = router.config.session.connect_timeout();
        let started = match router.gateway.open() {
            Ok(()) => router.gateway.wait_started(connect_timeout).await,
            Err(e) => Err(e),
        };
        if let Err(e) = started {
            error!(error = %e, "Router failed to start");
            router.abort().await;
            return Err(e);
        }

        info!("Router started");
        Ok(router)
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Logical requests registered and not yet resolved
    pub fn pending_requests(&self) -> usize {
        *self.load.borrow()
    }

    pub fn session_status(&self) -> SessionStatus {
        self.gateway.state().status()
    }

    pub async fn reference_data<S, F>(
        &self,
        securities: impl IntoIterator<Item = S>,
        fields: impl IntoIterator<Item = F>,
    ) -> Result<(ResponseData, Vec<ErrorRecord>)>
    where
        S: Into<String>,
        F: Into<String>,
    {
        self.submit_request(ReferenceDataRequest::new(securities, fields))
            .await
    }

    pub async fn search_fields<Q: Into<String>>(
        &self,
        queries: impl IntoIterator<Item = Q>,
    ) -> Result<(ResponseData, Vec<ErrorRecord>)> {
        self.submit_request(FieldSearchRequest::new(queries)).await
    }

    pub async fn security_lookup(
        &self,
        query: &str,
        yellow_key: Option<&str>,
        max_results: u32,
    ) -> Result<(ResponseData, Vec<ErrorRecord>)> {
        let mut request = InstrumentLookupRequest::new(query).with_max_results(max_results);
        if let Some(yellow_key) = yellow_key {
            request = request.with_yellow_key(yellow_key);
        }
        self.submit_request(request).await
    }

    /// Submit under the configured error behaviour
    pub async fn submit_request(
        &self,
        spec: impl Into<RequestSpec>,
    ) -> Result<(ResponseData, Vec<ErrorRecord>)> {
        self.submit_request_with(spec, self.config.error_behaviour)
            .await
    }

    /// Submit and stop waiting after `deadline`
    ///
    /// The request itself is not cancelled; its late response is discarded.
    pub async fn submit_request_timeout(
        &self,
        spec: impl Into<RequestSpec>,
        deadline: Duration,
    ) -> Result<(ResponseData, Vec<ErrorRecord>)> {
        tokio::time::timeout(deadline, self.submit_request(spec))
            .await
            .map_err(|_| RouterError::Timeout(deadline))?
    }

    pub async fn submit_request_with(
        &self,
        spec: impl Into<RequestSpec>,
        behaviour: ErrorBehaviour,
    ) -> Result<(ResponseData, Vec<ErrorRecord>)> {
        self.ensure_accepting()?;
        let spec = spec.into();
        spec.validate()?;

        self.gateway
            .ensure_service(spec.service(), self.config.session.service_timeout())
            .await?;

        let subrequests: Vec<(CorrelationId, Arc<Request>)> = spec
            .split(self.config.max_securities_per_request)
            .into_iter()
            .map(|request| (self.gateway.next_correlation_id(), Arc::new(request)))
            .collect();

        let request_id = RequestId::new(self.request_ids.fetch_add(1, Ordering::Relaxed));
        let (reply, response) = oneshot::channel();
        let handle = RequestHandle::new(request_id, &spec, behaviour, &subrequests, reply);
        debug!(%request_id, kind = ?spec.kind(), subrequests = subrequests.len(), %behaviour, "Submitting request");

        self.send(Command::Register { handle })?;
        for (cid, request) in &subrequests {
            if let Err(error) = self.gateway.submit(request, *cid) {
                let _ = self.send(Command::SubmitFailed { cid: *cid, error });
                break;
            }
        }

        let response = response.await.map_err(|_| RouterError::DispatcherStopped)??;
        Ok(response.into_parts())
    }

    /// Open a market data subscription
    pub async fn subscribe(&self, spec: SubscriptionSpec) -> Result<SubscriptionStream> {
        self.ensure_accepting()?;
        spec.validate()?;

        self.gateway
            .ensure_service(MKTDATA_SERVICE, self.config.session.service_timeout())
            .await?;

        let cid = self.gateway.next_correlation_id();
        let (handle, updates, end) = SubscriptionHandle::channel(cid, self.config.subscription_buffer);
        self.send(Command::Subscribe { handle })?;

        if let Err(error) = self.gateway.subscribe(&spec, cid) {
            let _ = self.send(Command::SubmitFailed {
                cid,
                error: error.clone(),
            });
            return Err(error);
        }

        Ok(SubscriptionStream::new(cid, updates, end, self.control.clone()))
    }

    /// Drain in-flight requests, stop the session and the background workers
    ///
    /// Later calls return immediately.
    pub async fn stop(&self) -> Result<()> {
        if self.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let timeout = self.config.session.shutdown_timeout();
        info!(pending = self.pending_requests(), "Stopping router");

        let mut load = self.load.clone();
        if tokio::time::timeout(timeout, load.wait_for(|pending| *pending == 0))
            .await
            .is_err()
        {
            warn!(
                pending = self.pending_requests(),
                "Shutdown timeout elapsed with requests in flight"
            );
        }

        if let Err(e) = self.gateway.stop() {
            warn!(error = %e, "Session stop failed");
        }

        let workers = self.workers.lock().take();
        if let Some(workers) = workers {
            self.join_workers(workers, timeout).await;
        }
        info!("Router stopped");
        Ok(())
    }

    /// Tear down after a failed start
    async fn abort(&self) {
        self.closing.store(true, Ordering::SeqCst);
        let _ = self.gateway.stop();
        let workers = self.workers.lock().take();
        if let Some(workers) = workers {
            workers.pump.request_shutdown();
            self.join_workers(workers, self.config.session.shutdown_timeout())
                .await;
        }
    }

    async fn join_workers(&self, workers: Workers, timeout: Duration) {
        let Workers {
            mut pump,
            dispatcher,
        } = workers;

        if !pump.wait(timeout).await {
            warn!("Event pump did not exit in time");
            pump.request_shutdown();
        }

        let _ = self.control.send(Inbound::Command(Command::Shutdown));
        if let Err(e) = dispatcher.await {
            error!(error = %e, "Dispatcher task failed");
        }
    }

    fn ensure_accepting(&self) -> Result<()> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(RouterError::ShuttingDown);
        }
        Ok(())
    }

    fn send(&self, command: Command) -> Result<()> {
        self.control
            .send(Inbound::Command(command))
            .map_err(|_| RouterError::DispatcherStopped)
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Router dropped without stop, shutting down in background");
        let _ = self.gateway.stop();
        if let Some(workers) = self.workers.get_mut().take() {
            workers.pump.request_shutdown();
        }
        let _ = self.control.send(Inbound::Command(Command::Shutdown));
    }
}
