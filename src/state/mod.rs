//! Runtime state
//!
//! Run store, log channels and the agent's shared state

pub mod app_state;
pub mod log_hub;
pub mod run_store;

pub use app_state::AppState;
pub use log_hub::{LogHub, RunLog};
pub use run_store::RunStore;
