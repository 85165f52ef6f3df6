//! Event pump
//!
//! A dedicated OS thread that blocks on the vendor session's receive call
//! and forwards every event, unchanged, onto the dispatcher queue. It stops
//! after forwarding `SessionTerminated`, when the dispatcher is gone, when a
//! receive fails (after forwarding `SessionFatal`), or when asked to.

use crate::dispatcher::Inbound;
use crate::gateway::VendorSession;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

pub struct EventPump {
    shutdown: Arc<AtomicBool>,
    done: oneshot::Receiver<()>,
    thread: Option<thread::JoinHandle<()>>,
}

impl EventPump {
    pub fn spawn(
        session: Arc<dyn VendorSession>,
        queue: mpsc::UnboundedSender<Inbound>,
        poll_interval: Duration,
    ) -> std::io::Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let (done_tx, done) = oneshot::channel();

        let flag = Arc::clone(&shutdown);
        let thread = thread::Builder::new()
            .name("event-pump".to_string())
            .spawn(move || {
                run(session.as_ref(), &queue, poll_interval, &flag);
                let _ = done_tx.send(());
            })?;

        Ok(Self {
            shutdown,
            done,
            thread: Some(thread),
        })
    }

    /// Ask the thread to exit at its next poll
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// Wait up to `timeout` for the thread to exit on its own
    pub async fn wait(&mut self, timeout: Duration) -> bool {
        if tokio::time::timeout(timeout, &mut self.done).await.is_err() {
            return false;
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Event pump thread panicked");
            }
        }
        true
    }
}

impl Drop for EventPump {
    fn drop(&mut self) {
        self.request_shutdown();
    }
}

fn run(
    session: &dyn VendorSession,
    queue: &mpsc::UnboundedSender<Inbound>,
    poll_interval: Duration,
    shutdown: &AtomicBool,
) {
    info!("Event pump started");
    while !shutdown.load(Ordering::Acquire) {
        match session.next_event(poll_interval) {
            Ok(Some(event)) => {
                let terminated = event.is_session_terminated();
                if queue.send(Inbound::Event(event)).is_err() {
                    debug!("Dispatcher gone, event pump exiting");
                    return;
                }
                if terminated {
                    info!("Session terminated, event pump exiting");
                    return;
                }
            }
            Ok(None) => {}
            Err(e) => {
                error!(error = %e, "Receiving from session failed");
                let _ = queue.send(Inbound::SessionFatal(e.to_string()));
                return;
            }
        }
    }
    info!("Event pump stopped");
}
