//! automation-bridge: request correlation and adaptive timeouts for editor
//! automation workers.
//!
//! [`RequestTracker`] is the engine: it hands out a [`RequestId`] and an
//! awaitable [`Completion`] per dispatched request, extends soft deadlines on
//! progress, enforces an absolute cap, and coalesces identical read-only
//! requests. [`AutomationBridge`] layers dispatch, capacity queueing and
//! inbound routing on top of any [`Transport`].

mod pending;
mod request_id;

pub mod bridge;
pub mod coalesce;
pub mod completion;
pub mod config;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod timer;
pub mod tracker;

pub use bridge::{AutomationBridge, BridgeStatus, Transport};
pub use coalesce::{ActionCatalog, ActionClass};
pub use completion::{Completion, CompletionResult};
pub use config::{BridgeConfig, TrackerConfig};
pub use error::{BridgeError, ErrorKind};
pub use logging::init_tracing;
pub use pending::ProgressState;
pub use protocol::{
    AutomationEvent, AutomationResponse, InboundMessage, OutboundMessage, Payload, ProgressUpdate,
};
pub use request_id::RequestId;
pub use tracker::{Admission, PendingDetail, PendingSnapshot, RequestTracker};
