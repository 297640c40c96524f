use core::future::Future;
use tokio_util::sync::CancellationToken;

/// Outcome of a protocol hook that can be interrupted by shutdown signals.
pub(crate) enum HookDecision<T> {
    Finished(T),
    Cancelled,
}

/// Drives `hook` to completion unless `shutdown` fires first.
pub(crate) async fn await_hook<F>(hook: F, shutdown: &CancellationToken) -> HookDecision<F::Output>
where
    F: Future,
{
    tokio::pin!(hook);
    tokio::select! {
        result = &mut hook => HookDecision::Finished(result),
        _ = shutdown.cancelled() => HookDecision::Cancelled,
    }
}
