pub mod processor;
pub mod runtime;
pub mod worker;

pub use processor::coordinator::ProtocolViolation;
pub use processor::fetcher::CoalescingFetcher;
pub use processor::intake::ReferenceSender;
pub use runtime::config::{CoalescerConfig, CoalescerConfigBuilder, CoalescerConfigParams};
pub use runtime::fatal::FatalErrorHandler;
pub use runtime::protocol::{
    Delivery, FetchFailure, FetchFailureKind, FetchProtocol, ProtocolError, ProtocolFetchFuture,
    ProtocolFuture, ProtocolStage, ResolutionFailure,
};
pub use runtime::runner::Runner;
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
pub use worker::FetchActivityTracker;
