//! Application state shared by all HTTP handlers.

use std::sync::Arc;
use std::time::Instant;

use crate::transfer::TransferCoordinator;

/// State reachable from every handler.
#[derive(Debug)]
pub struct AppState {
    /// The transfer engine
    pub coordinator: Arc<TransferCoordinator>,
    /// When the server started
    pub started_at: Instant,
}

/// Shared application state type.
pub type SharedState = Arc<AppState>;

impl AppState {
    /// Wrap a coordinator into shared state.
    #[must_use]
    pub fn new(coordinator: Arc<TransferCoordinator>) -> SharedState {
        Arc::new(Self {
            coordinator,
            started_at: Instant::now(),
        })
    }
}
