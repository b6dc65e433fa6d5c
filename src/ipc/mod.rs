//! Line-delimited JSON IPC: request types, handler families, and the router.

mod error;
mod handlers;
mod helpers;
mod router;
mod types;

pub use router::handle_request;
pub use types::{AppState, Request};
