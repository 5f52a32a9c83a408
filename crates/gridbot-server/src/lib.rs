//! HTTP control surface for the grid trading bot.
//!
//! axum router over the controller, risk supervisor, price feed, and
//! the webhook alert router. Read endpoints serve snapshots; write
//! endpoints enqueue worker commands and map engine errors onto HTTP
//! status codes (403 for the kill latch, 404 for unknown symbols, 409
//! for a refused kill reset, 401 for a bad webhook signature).

pub mod alerts;
pub mod routes;

pub use alerts::{AlertOutcome, AlertPayload, AlertRecord, AlertRouter, GridAction};
pub use routes::{create_router, run_server, AppState};
