use crate::services::orchestrator::Orchestrator;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    /// Buffer size of each server-sent-events subscription.
    pub relay_capacity: usize,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator, relay_capacity: usize) -> Self {
        Self {
            orchestrator,
            relay_capacity,
        }
    }
}
