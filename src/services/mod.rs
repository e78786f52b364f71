pub mod executor;
pub mod orchestrator;
pub mod provider;
pub mod queue;
pub mod router;
pub mod storage;
pub mod strategy;
pub mod vision;
