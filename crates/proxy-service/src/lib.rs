pub mod auth;
pub mod dispatch;
pub mod errors;
pub mod history;
pub mod models;
pub mod orchestrator;
pub mod routes;
pub mod state;
pub mod upstream_stream;

pub use state::AppState;
