//! HTTP surface of the gateway
//!
//! - Health and identity endpoints
//! - Forwarding of every other path
//! - Problem-details error rendering

mod problem;
mod routes;
mod server;

pub use problem::{status_for, ApiError, Problem};
pub use routes::{Authenticated, IdentityView};
pub use server::{AppState, GatewayApp, GatewayAppBuilder};
