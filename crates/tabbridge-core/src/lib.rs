pub mod errors;
pub mod ids;
pub mod rpc;
pub mod wire;

pub use errors::BridgeError;
pub use ids::{ConnectionId, RequestId, SessionId};
