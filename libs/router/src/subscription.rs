//! Subscription streams
//!
//! The dispatcher owns a [`SubscriptionHandle`] per live subscription and
//! pushes updates into a bounded buffer without ever waiting on the consumer.
//! When the buffer is full updates are dropped and counted; the count is
//! delivered as [`SubscriptionUpdate::Lagged`] ahead of the next update that
//! fits.
//!
//! The consumer side is a [`SubscriptionStream`]. It ends with exactly one
//! [`SubscriptionUpdate::End`] and then returns `None`.

use crate::dispatcher::{Command, Inbound};
use crate::error::{Result, RouterError};
use crate::handle::Row;
use futures::Stream;
use router_types::{CorrelationId, ErrorRecord};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Market data subscription on one security
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSpec {
    pub security: String,
    pub fields: Vec<String>,
    /// Vendor subscription options, e.g. `interval=5`
    pub options: Vec<String>,
}

impl SubscriptionSpec {
    pub fn new<F: Into<String>>(security: impl Into<String>, fields: impl IntoIterator<Item = F>) -> Self {
        Self {
            security: security.into(),
            fields: fields.into_iter().map(Into::into).collect(),
            options: Vec::new(),
        }
    }

    pub fn with_option(mut self, option: impl Into<String>) -> Self {
        self.options.push(option.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.security.trim().is_empty() {
            return Err(RouterError::InvalidRequest("empty subscription security".into()));
        }
        if self.fields.is_empty() {
            return Err(RouterError::InvalidRequest("no subscription fields".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionUpdate {
    Data(Row),
    /// Non-terminal error, e.g. a throttle
    Error(ErrorRecord),
    /// This many updates were dropped because the consumer fell behind
    Lagged(u64),
    End(EndReason),
}

#[derive(Debug, Clone, PartialEq)]
pub enum EndReason {
    Cancelled,
    SessionTerminated,
    Failed(ErrorRecord),
}

/// Dispatcher-side end of a subscription
#[derive(Debug)]
pub struct SubscriptionHandle {
    cid: CorrelationId,
    updates: mpsc::Sender<SubscriptionUpdate>,
    end: Option<oneshot::Sender<EndReason>>,
    dropped: u64,
}

impl SubscriptionHandle {
    pub(crate) fn channel(
        cid: CorrelationId,
        capacity: usize,
    ) -> (
        Self,
        mpsc::Receiver<SubscriptionUpdate>,
        oneshot::Receiver<EndReason>,
    ) {
        let (updates, updates_rx) = mpsc::channel(capacity.max(1));
        let (end, end_rx) = oneshot::channel();
        (
            Self {
                cid,
                updates,
                end: Some(end),
                dropped: 0,
            },
            updates_rx,
            end_rx,
        )
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.cid
    }

    /// Push an update without waiting
    ///
    /// Returns false once the consumer is gone.
    pub(crate) fn deliver(&mut self, update: SubscriptionUpdate) -> bool {
        if self.dropped > 0 {
            match self.updates.try_send(SubscriptionUpdate::Lagged(self.dropped)) {
                Ok(()) => self.dropped = 0,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped += 1;
                    return true;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return false,
            }
        }

        match self.updates.try_send(update) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped += 1;
                debug!(correlation_id = %self.cid, dropped = self.dropped, "Subscriber lagging");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Close the stream with its terminal marker
    pub(crate) fn end(mut self, reason: EndReason) {
        debug!(correlation_id = %self.cid, ?reason, "Ending subscription");
        if let Some(end) = self.end.take() {
            let _ = end.send(reason);
        }
    }
}

/// Consumer side of a subscription
#[derive(Debug)]
pub struct SubscriptionStream {
    cid: CorrelationId,
    updates: mpsc::Receiver<SubscriptionUpdate>,
    end: Option<oneshot::Receiver<EndReason>>,
    control: mpsc::UnboundedSender<Inbound>,
    cancelled: bool,
    finished: bool,
}

impl SubscriptionStream {
    pub(crate) fn new(
        cid: CorrelationId,
        updates: mpsc::Receiver<SubscriptionUpdate>,
        end: oneshot::Receiver<EndReason>,
        control: mpsc::UnboundedSender<Inbound>,
    ) -> Self {
        Self {
            cid,
            updates,
            end: Some(end),
            control,
            cancelled: false,
            finished: false,
        }
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.cid
    }

    /// Unsubscribe; buffered updates are still yielded before `End(Cancelled)`
    pub fn cancel(&mut self) {
        if self.cancelled || self.finished {
            return;
        }
        self.cancelled = true;
        let _ = self
            .control
            .send(Inbound::Command(Command::Unsubscribe { cid: self.cid }));
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub async fn next_update(&mut self) -> Option<SubscriptionUpdate> {
        futures::StreamExt::next(self).await
    }
}

impl Stream for SubscriptionStream {
    type Item = SubscriptionUpdate;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        match this.updates.poll_recv(cx) {
            Poll::Ready(Some(update)) => return Poll::Ready(Some(update)),
            Poll::Ready(None) => {}
            Poll::Pending => return Poll::Pending,
        }

        let reason = match this.end.as_mut() {
            Some(end) => match Pin::new(end).poll(cx) {
                Poll::Ready(Ok(reason)) => reason,
                Poll::Ready(Err(_)) => EndReason::SessionTerminated,
                Poll::Pending => return Poll::Pending,
            },
            None => EndReason::SessionTerminated,
        };
        this.end = None;
        this.finished = true;
        Poll::Ready(Some(SubscriptionUpdate::End(reason)))
    }
}

impl Drop for SubscriptionStream {
    fn drop(&mut self) {
        if !self.finished {
            self.cancel();
        }
    }
}
