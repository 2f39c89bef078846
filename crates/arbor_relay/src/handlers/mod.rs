pub mod hydrate;
pub mod ws;

pub use hydrate::hydrate_handler;
pub use ws::ws_handler;

use std::sync::Arc;

use crate::config::Config;
use crate::room::RelayState;

/// Shared state for the relay's endpoints.
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<RelayState>,
    pub config: Arc<Config>,
}
