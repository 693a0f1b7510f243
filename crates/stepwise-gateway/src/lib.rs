//! HTTP front door for Stepwise: graph validation, runs streamed as
//! server-sent events, approval resume and cancellation.

mod routes;
mod server;
mod state;
mod stream;

pub use server::{router, GatewayServer};
pub use state::AppState;
