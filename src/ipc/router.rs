use super::handlers;
use super::types::{AppState, Request};
use crate::ipc::error::err;

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    if let Some(resp) = handlers::core::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::sync::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::warnings::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::priority::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::overview::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::tracking::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::settings::try_handle(state, &req) {
        return resp;
    }

    err(
        &req.id,
        "not_implemented",
        format!("unknown method: {}", req.method),
        None,
    )
}
