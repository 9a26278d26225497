//! Sub-bot linking engine - opens ephemeral protocol connections, pairs them
//! by code or QR, and persists the ones that authenticate.

pub mod attempt;
pub mod bridge;
pub mod cooldown;
pub mod error;
pub mod maintenance;
pub mod messenger;
pub mod orchestrator;
pub mod pairing;
pub mod persist;
pub mod protocol;
pub mod qr;
pub mod registry;
pub mod watchdog;

#[cfg(test)]
mod testing;

pub use attempt::{AttemptState, LinkMode, LinkRequest, SessionId};
pub use bridge::BridgeClient;
pub use cooldown::{CooldownDecision, CooldownTracker};
pub use error::LinkError;
pub use maintenance::MaintenanceScheduler;
pub use messenger::Messenger;
pub use orchestrator::{
    AttemptHandle, AttemptOutcome, CONNECT_FAILED_NOTICE, LinkSettings, LinkStart, Linker, NO_CODE_NOTICE, failure_notice,
};
pub use protocol::{BrowserLabel, ConnectionUpdate, DisconnectReason, ProtocolClient};
pub use registry::{ActiveConnections, SessionRecord, SessionRegistry};
