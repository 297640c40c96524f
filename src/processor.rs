//! Processor orchestration covering the coordinator, reference intake,
//! lifecycle management, and worker pool coordination.

pub mod coordinator;
pub mod fetcher;
pub mod intake;
pub mod lifecycle;
pub mod worker_pool;
