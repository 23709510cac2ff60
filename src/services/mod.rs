pub mod converter;
pub mod notify;
pub mod orchestrator;
pub mod relay;
pub mod state_machine;
pub mod storage;
pub mod workspace;
