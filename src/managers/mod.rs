pub mod orchestrator;
pub mod session;
