use genlb_core::Engine;

/// Shared application state for both the worker-compatible FrontAPI and the
/// ControlAPI — both are thin HTTP shells over the same `Engine` facade.
#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
}
