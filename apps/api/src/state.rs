use crate::dispatcher::Dispatcher;
use crate::pipeline::Orchestrator;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    /// Synchronous operations (analyze, manual compile) and ledger/store reads.
    pub orchestrator: Orchestrator,
    /// Hands long-running work to the background workers.
    pub dispatcher: Dispatcher,
}
