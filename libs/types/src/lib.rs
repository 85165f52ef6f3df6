//! # Router Types
//!
//! Shared vocabulary between the vendor session boundary and the request
//! router: correlation identifiers, the tree-shaped message payload, events
//! as they leave the vendor session, and per-item error records.
//!
//! ## Design Philosophy
//!
//! - **Opaque tags**: `CorrelationId` is the only link between a submission
//!   and its asynchronous responses
//! - **Typed trees**: message payloads are `Element` values with accessors that
//!   fail with `SchemaError` instead of panicking on shape mismatch
//! - **No I/O**: everything here is plain data and can be built in tests
//!
//! ## Quick Start
//!
//! ```rust
//! use router_types::{CorrelationId, Element, Event, EventKind, Message};
//!
//! let payload = Element::node([("PX_LAST", Element::from(42.5))]);
//! let message = Message::new("ReferenceDataResponse", payload)
//!     .with_correlation_id(CorrelationId::new(7));
//! let event = Event::new(EventKind::Response, vec![message]);
//!
//! assert!(event.kind.is_terminal());
//! assert_eq!(event.messages[0].element.child("PX_LAST")?.as_f64()?, 42.5);
//! # Ok::<(), router_types::SchemaError>(())
//! ```

pub mod correlation;
pub mod element;
pub mod errors;
pub mod event;

pub use correlation::{CorrelationId, CorrelationIdGenerator};
pub use element::{Element, Value};
pub use errors::{ErrorRecord, ErrorScope, SchemaError, ThrottleKind};
pub use event::{Event, EventKind, Message};
