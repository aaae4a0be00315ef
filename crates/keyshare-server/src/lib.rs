//! # keyshare-server
//!
//! HTTP surface around [`keyshare_core`]: enrollment, PIN-authenticated
//! access tokens, challenge-response authentication, PIN change, and the
//! two-phase proof participation protocol.

pub mod config;
pub mod db;
pub mod email;
pub mod state;

mod api;
mod error;
mod pin;
mod sessions;

pub use pin::PinStatus;

use axum::{routing::post, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use state::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/client/register", post(api::register::register))
        .route("/users/start_auth", post(api::auth::start_auth))
        .route("/users/verify/pin", post(api::auth::verify_pin))
        .route(
            "/users/verify/pin_challengeresponse",
            post(api::auth::verify_pin_challenge_response),
        )
        .route("/users/change/pin", post(api::auth::change_pin))
        .route(
            "/users/register_publickey",
            post(api::auth::register_public_key),
        )
        .route("/prove/getCommitments", post(api::prove::get_commitments))
        .route("/prove/getResponse", post(api::prove::get_response))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
