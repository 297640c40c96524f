//! Fetch worker module split across focused submodules:
//! - `types`: completion events and the dispatch/completion channels
//! - `shared`: state shared across workers (location intake, telemetry, activity)
//! - `process`: worker struct plus run/fetch logic
//! - `tests`: worker unit tests

mod process;
mod shared;
mod types;


pub use process::Worker;
pub use shared::{FetchActivityGuard, FetchActivityTracker, WorkerShared, WorkerSharedParams};
pub use types::{
    completion_channel, dispatch_channel, Completion, CompletionReceiver, CompletionSender,
    DispatchSender, SharedDispatchReceiver,
};
