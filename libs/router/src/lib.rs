//! # Request Router
//!
//! Non-blocking request/response and streaming access to a vendor market
//! data session whose native interface is one blocking, event-driven session.
//!
//! ## Architecture
//!
//! ```text
//! caller ──► Router ──► SessionGateway ──► vendor session
//!                                              │
//!            Dispatcher ◄── queue ◄── EventPump ┘
//!                │
//!                └──► CorrelationRegistry ──► RequestHandle ──► caller
//! ```
//!
//! - **EventPump**: dedicated thread, the only reader of the session
//! - **Dispatcher**: single consumer of the queue; owns the registry and every
//!   handle, classifies errors and schedules retries
//! - **SessionGateway**: serializes submissions and tracks session readiness
//! - **Router**: public API; registers a handle, submits, awaits completion
//!
//! ## Usage
//!
//! ```rust,no_run
//! use request_router::{test_utils::ScriptedSession, Router};
//! use router_config::RouterConfig;
//!
//! # async fn example() -> request_router::Result<()> {
//! let router = Router::start(ScriptedSession::new(), RouterConfig::default()).await?;
//! let (data, errors) = router.reference_data(["F Equity"], ["PX_LAST"]).await?;
//! println!("{:?} {:?}", data.get("F Equity"), errors);
//! router.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod classifier;
mod dispatcher;
pub mod error;
pub mod gateway;
pub mod handle;
pub mod orchestrator;
mod parse;
mod pump;
pub mod registry;
pub mod request;
pub mod retry;
pub mod subscription;
pub mod test_utils;

pub use classifier::{Classification, ErrorClassifier};
pub use error::{Result, RouterError, SessionError};
pub use gateway::{ServiceStatus, SessionGateway, SessionState, SessionStatus, VendorSession};
pub use handle::{Response, ResponseData, Row};
pub use orchestrator::Router;
pub use registry::{CorrelationRegistry, RequestId};
pub use request::{
    FieldSearchRequest, InstrumentLookupRequest, ReferenceDataRequest, Request, RequestKind,
    RequestSpec, FIELDS_SERVICE, INSTRUMENTS_SERVICE, MKTDATA_SERVICE, REFDATA_SERVICE,
};
pub use retry::RetryPolicy;
pub use subscription::{EndReason, SubscriptionSpec, SubscriptionStream, SubscriptionUpdate};

pub use router_config::ErrorBehaviour;
pub use router_types::{CorrelationId, Element, ErrorRecord, ErrorScope, ThrottleKind, Value};
