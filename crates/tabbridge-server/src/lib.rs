pub mod auth;
pub mod gateway;
pub mod server;
pub mod ws;

pub use auth::{CredentialDecoder, UnverifiedJwtDecoder};
pub use server::{start, AppState, ServerConfig, ServerHandle};
