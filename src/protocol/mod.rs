//! Bus-facing protocol: wire payloads, device identity and topic validation

pub mod identity;
pub mod messages;
pub mod topics;

pub use identity::*;
pub use messages::*;
pub use topics::*;
