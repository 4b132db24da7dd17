pub mod correlator;
pub mod session;
pub mod store;

pub use correlator::Correlator;
pub use session::{
    Delivery, DuplexHandle, Health, HealthReason, QueuedMessage, Session, SessionSnapshot,
};
pub use store::{SessionStore, StoreConfig};
