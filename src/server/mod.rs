//! Node HTTP endpoints
//!
//! Peers dial `POST /v1/cluster/authorize` once and then deliver packets to
//! `POST /v1/cluster/packets`. `/health` and `/status` are for operators.

pub mod handlers;
pub mod state;

pub use handlers::create_router;
pub use state::AppState;
