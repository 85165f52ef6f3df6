//! Per-request accumulator and completion signal
//!
//! A `RequestHandle` is created by the orchestrator, handed to the dispatcher
//! at registration and from then on mutated by the dispatcher only. The
//! caller keeps the receiving half of the completion channel.
//!
//! Rows and errors are staged per sub-request and only committed to the
//! request once that sub-request reaches its terminal event. Resubmitting a
//! throttled sub-request discards whatever its superseded attempt staged.

use crate::error::{Result, RouterError};
use crate::registry::RequestId;
use crate::request::{Request, RequestKind, RequestSpec};
use router_config::ErrorBehaviour;
use router_types::{CorrelationId, Element, ErrorRecord};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

/// Columns of one item, keyed by field name
pub type Row = BTreeMap<String, Element>;

/// Rows keyed by item (security, field id, ...)
pub type ResponseData = BTreeMap<String, Row>;

/// Outcome of a completed request
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Response {
    pub data: ResponseData,
    pub errors: Vec<ErrorRecord>,
}

impl Response {
    pub fn into_parts(self) -> (ResponseData, Vec<ErrorRecord>) {
        (self.data, self.errors)
    }

    fn merge(&mut self, other: Response) {
        for (key, row) in other.data {
            self.data.entry(key).or_default().extend(row);
        }
        self.errors.extend(other.errors);
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty() && self.errors.is_empty()
    }
}

/// One vendor request owned by a handle
#[derive(Debug, Clone)]
pub struct SubRequest {
    pub request: Arc<Request>,
    /// Resubmissions made so far
    pub attempts: u32,
    /// Results of the current attempt, not yet committed
    staged: Response,
}

#[derive(Debug)]
pub struct RequestHandle {
    id: RequestId,
    kind: RequestKind,
    behaviour: ErrorBehaviour,
    columns: Vec<String>,
    subrequests: HashMap<CorrelationId, SubRequest>,
    committed: Response,
    reply: Option<oneshot::Sender<Result<Response>>>,
}

impl RequestHandle {
    pub fn new(
        id: RequestId,
        spec: &RequestSpec,
        behaviour: ErrorBehaviour,
        subrequests: &[(CorrelationId, Arc<Request>)],
        reply: oneshot::Sender<Result<Response>>,
    ) -> Self {
        Self {
            id,
            kind: spec.kind(),
            behaviour,
            columns: spec.requested_fields().to_vec(),
            subrequests: subrequests
                .iter()
                .map(|(cid, request)| {
                    (
                        *cid,
                        SubRequest {
                            request: Arc::clone(request),
                            attempts: 0,
                            staged: Response::default(),
                        },
                    )
                })
                .collect(),
            committed: Response::default(),
            reply: Some(reply),
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn behaviour(&self) -> ErrorBehaviour {
        self.behaviour
    }

    pub fn correlation_ids(&self) -> Vec<CorrelationId> {
        self.subrequests.keys().copied().collect()
    }

    pub fn subrequest(&self, cid: CorrelationId) -> Option<&SubRequest> {
        self.subrequests.get(&cid)
    }

    /// Move a sub-request to a fresh correlation id for resubmission
    ///
    /// The superseded attempt's staged results are dropped. Returns the
    /// request to resubmit and the attempt number it was issued under (zero
    /// for the first resubmission).
    pub fn rebind(&mut self, old: CorrelationId, new: CorrelationId) -> Option<(Arc<Request>, u32)> {
        let mut sub = self.subrequests.remove(&old)?;
        let discarded = std::mem::take(&mut sub.staged);
        if !discarded.is_empty() {
            debug!(
                request_id = %self.id,
                correlation_id = %old,
                rows = discarded.data.len(),
                errors = discarded.errors.len(),
                "Discarding results of superseded attempt"
            );
        }
        let attempt = sub.attempts;
        sub.attempts += 1;
        let request = Arc::clone(&sub.request);
        self.subrequests.insert(new, sub);
        Some((request, attempt))
    }

    /// Commit a sub-request's staged results; it expects no further messages
    pub fn finish_subrequest(&mut self, cid: CorrelationId) {
        if let Some(sub) = self.subrequests.remove(&cid) {
            self.committed.merge(sub.staged);
        }
    }

    /// Stage a row for `cid`, later values overwriting earlier ones per column
    pub fn merge_row(&mut self, cid: CorrelationId, key: String, row: Row) {
        match self.subrequests.get_mut(&cid) {
            Some(sub) => sub.staged.data.entry(key).or_default().extend(row),
            None => debug!(request_id = %self.id, correlation_id = %cid, "Row for finished sub-request dropped"),
        }
    }

    pub fn record_error(&mut self, cid: CorrelationId, record: ErrorRecord) {
        match self.subrequests.get_mut(&cid) {
            Some(sub) => sub.staged.errors.push(record),
            None => debug!(request_id = %self.id, correlation_id = %cid, "Error for finished sub-request dropped"),
        }
    }

    /// Errors committed or staged so far
    pub fn error_count(&self) -> usize {
        self.committed.errors.len()
            + self
                .subrequests
                .values()
                .map(|sub| sub.staged.errors.len())
                .sum::<usize>()
    }

    /// Resolve successfully, shaping data per the error behaviour
    pub fn complete(mut self) {
        self.commit_all();
        self.apply_behaviour();
        let response = std::mem::take(&mut self.committed);
        self.resolve(Ok(response));
    }

    /// Resolve with the composed per-item failure
    pub fn fail_request(mut self) {
        self.commit_all();
        let Response { data, errors } = std::mem::take(&mut self.committed);
        self.resolve(Err(RouterError::RequestFailed {
            errors,
            partial: data,
        }));
    }

    pub fn fail(mut self, err: RouterError) {
        self.resolve(Err(err));
    }

    /// Commit every sub-request still in flight, in submission order
    fn commit_all(&mut self) {
        let mut cids = self.correlation_ids();
        cids.sort();
        for cid in cids {
            self.finish_subrequest(cid);
        }
    }

    fn resolve(&mut self, result: Result<Response>) {
        let Some(reply) = self.reply.take() else {
            debug!(request_id = %self.id, "Handle already resolved");
            return;
        };
        if reply.send(result).is_err() {
            debug!(request_id = %self.id, "Caller stopped waiting, discarding result");
        }
    }

    fn apply_behaviour(&mut self) {
        let Self {
            behaviour,
            columns,
            committed: Response { data, errors },
            ..
        } = self;

        match behaviour {
            ErrorBehaviour::Raise => {}
            ErrorBehaviour::Return => {
                for error in errors.iter() {
                    match (&error.security, &error.field) {
                        (Some(item), Some(column)) => {
                            data.entry(item.clone())
                                .or_default()
                                .entry(column.clone())
                                .or_insert_with(Element::null);
                        }
                        (Some(item), None) => {
                            let row = data.entry(item.clone()).or_default();
                            for column in columns.iter() {
                                row.entry(column.clone()).or_insert_with(Element::null);
                            }
                        }
                        (None, Some(item)) => {
                            data.entry(item.clone()).or_default();
                        }
                        (None, None) => {}
                    }
                }
            }
            ErrorBehaviour::Skip => {
                for error in errors.iter() {
                    match (&error.security, &error.field) {
                        (Some(item), Some(column)) => {
                            if let Some(row) = data.get_mut(item) {
                                row.remove(column);
                                if row.is_empty() {
                                    data.remove(item);
                                }
                            }
                        }
                        (Some(item), None) | (None, Some(item)) => {
                            data.remove(item);
                        }
                        (None, None) => {}
                    }
                }
            }
        }
    }
}

impl Drop for RequestHandle {
    fn drop(&mut self) {
        if self.reply.is_some() {
            self.resolve(Err(RouterError::DispatcherStopped));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::ReferenceDataRequest;
    use proptest::prelude::*;
    use router_types::{ErrorScope, ThrottleKind};

    const CID: CorrelationId = CorrelationId::new(1);

    fn handle(behaviour: ErrorBehaviour) -> (RequestHandle, oneshot::Receiver<Result<Response>>) {
        let spec = RequestSpec::from(ReferenceDataRequest::new(
            ["F Equity", "BAD Equity"],
            ["PX_LAST", "VOLUME"],
        ));
        let requests: Vec<_> = spec
            .split(50)
            .into_iter()
            .map(|r| (CID, Arc::new(r)))
            .collect();
        let (tx, rx) = oneshot::channel();
        (RequestHandle::new(RequestId::new(1), &spec, behaviour, &requests, tx), rx)
    }

    fn row(pairs: &[(&str, f64)]) -> Row {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), Element::from(*value)))
            .collect()
    }

    fn populated(behaviour: ErrorBehaviour) -> (RequestHandle, oneshot::Receiver<Result<Response>>) {
        let (mut handle, rx) = handle(behaviour);
        handle.merge_row(CID, "F Equity".into(), row(&[("PX_LAST", 42.5)]));
        handle.record_error(
            CID,
            ErrorRecord::new(ErrorScope::Field, "Field not applicable")
                .with_security("F Equity")
                .with_field("VOLUME"),
        );
        handle.record_error(
            CID,
            ErrorRecord::new(ErrorScope::Security, "Unknown/Invalid security")
                .with_security("BAD Equity"),
        );
        (handle, rx)
    }

    #[test]
    fn test_return_inserts_placeholders() {
        let (handle, mut rx) = populated(ErrorBehaviour::Return);
        handle.complete();

        let response = rx.try_recv().unwrap().unwrap();
        assert_eq!(response.errors.len(), 2);
        assert_eq!(response.data["F Equity"]["PX_LAST"], Element::from(42.5));
        assert_eq!(response.data["F Equity"]["VOLUME"], Element::null());
        assert_eq!(response.data["BAD Equity"]["PX_LAST"], Element::null());
        assert_eq!(response.data["BAD Equity"]["VOLUME"], Element::null());
    }

    #[test]
    fn test_skip_removes_erroring_items() {
        let (handle, mut rx) = populated(ErrorBehaviour::Skip);
        handle.complete();

        let response = rx.try_recv().unwrap().unwrap();
        assert_eq!(response.errors.len(), 2);
        assert!(!response.data.contains_key("BAD Equity"));
        assert!(!response.data["F Equity"].contains_key("VOLUME"));
        assert_eq!(response.data["F Equity"]["PX_LAST"], Element::from(42.5));
    }

    #[test]
    fn test_fail_request_carries_partial_data() {
        let (handle, mut rx) = populated(ErrorBehaviour::Raise);
        handle.fail_request();

        match rx.try_recv().unwrap() {
            Err(RouterError::RequestFailed { errors, partial }) => {
                assert_eq!(errors.len(), 2);
                assert_eq!(partial["F Equity"]["PX_LAST"], Element::from(42.5));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_rebind_counts_attempts() {
        let (mut handle, _rx) = handle(ErrorBehaviour::Raise);
        let (_, attempt) = handle.rebind(CorrelationId::new(1), CorrelationId::new(2)).unwrap();
        assert_eq!(attempt, 0);
        let (_, attempt) = handle.rebind(CorrelationId::new(2), CorrelationId::new(3)).unwrap();
        assert_eq!(attempt, 1);
        assert_eq!(handle.correlation_ids(), vec![CorrelationId::new(3)]);
        assert!(handle.rebind(CorrelationId::new(1), CorrelationId::new(4)).is_none());
    }

    #[test]
    fn test_rebind_discards_superseded_attempt() {
        let (mut handle, mut rx) = populated(ErrorBehaviour::Return);
        assert_eq!(handle.error_count(), 2);

        let retry = CorrelationId::new(2);
        handle.rebind(CID, retry).unwrap();
        assert_eq!(handle.error_count(), 0);

        handle.merge_row(retry, "F Equity".into(), row(&[("PX_LAST", 43.0)]));
        handle.record_error(
            retry,
            ErrorRecord::new(ErrorScope::Security, "Unknown/Invalid security")
                .with_security("BAD Equity"),
        );
        // the superseded id no longer stages anything
        handle.merge_row(CID, "STALE Equity".into(), row(&[("PX_LAST", 1.0)]));
        handle.finish_subrequest(retry);
        handle.complete();

        let response = rx.try_recv().unwrap().unwrap();
        assert_eq!(response.errors.len(), 1);
        assert!(!response.data.contains_key("STALE Equity"));
        assert!(!response.data["F Equity"].contains_key("VOLUME"));
        assert_eq!(response.data["F Equity"]["PX_LAST"], Element::from(43.0));
    }

    #[test]
    fn test_finished_subrequests_commit_in_order() {
        let spec = RequestSpec::from(ReferenceDataRequest::new(["A Equity", "B Equity"], ["PX_LAST"]));
        let requests: Vec<_> = spec
            .split(1)
            .into_iter()
            .enumerate()
            .map(|(n, r)| (CorrelationId::new(n as u64 + 1), Arc::new(r)))
            .collect();
        let (tx, mut rx) = oneshot::channel();
        let mut handle = RequestHandle::new(RequestId::new(7), &spec, ErrorBehaviour::Raise, &requests, tx);

        handle.merge_row(CorrelationId::new(2), "B Equity".into(), row(&[("PX_LAST", 2.0)]));
        handle.merge_row(CorrelationId::new(1), "A Equity".into(), row(&[("PX_LAST", 1.0)]));
        handle.finish_subrequest(CorrelationId::new(2));
        // a row after the terminal event of its sub-request is not applied
        handle.merge_row(CorrelationId::new(2), "B Equity".into(), row(&[("PX_LAST", 9.0)]));
        handle.fail_request();

        match rx.try_recv().unwrap() {
            Err(RouterError::RequestFailed { partial, .. }) => {
                assert_eq!(partial["A Equity"]["PX_LAST"], Element::from(1.0));
                assert_eq!(partial["B Equity"]["PX_LAST"], Element::from(2.0));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_dropped_handle_reports_dispatcher_stopped() {
        let (handle, mut rx) = handle(ErrorBehaviour::Raise);
        drop(handle);
        assert!(matches!(rx.try_recv().unwrap(), Err(RouterError::DispatcherStopped)));
    }

    #[test]
    fn test_orphaned_handle_resolves_quietly() {
        let (mut handle, rx) = handle(ErrorBehaviour::Return);
        drop(rx);
        handle.record_error(CID, ErrorRecord::throttle(ThrottleKind::DailyLimit, None));
        handle.complete();
    }

    proptest! {
        #[test]
        fn prop_last_write_wins(
            writes in prop::collection::vec((0usize..3, 0usize..3, -1e6f64..1e6), 1..40)
        ) {
            let securities = ["A Equity", "B Equity", "C Equity"];
            let fields = ["PX_LAST", "BID", "ASK"];

            let (mut handle, mut rx) = handle(ErrorBehaviour::Raise);
            let mut expected: BTreeMap<(usize, usize), f64> = BTreeMap::new();
            for (security, field, value) in &writes {
                handle.merge_row(
                    CID,
                    securities[*security].to_string(),
                    row(&[(fields[*field], *value)]),
                );
                expected.insert((*security, *field), *value);
            }
            handle.complete();

            let response = rx.try_recv().unwrap().unwrap();
            let cells: usize = response.data.values().map(|r| r.len()).sum();
            prop_assert_eq!(cells, expected.len());
            for ((security, field), value) in expected {
                prop_assert_eq!(
                    &response.data[securities[security]][fields[field]],
                    &Element::from(value)
                );
            }
        }
    }
}
