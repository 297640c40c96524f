use anyhow::Error as AnyError;
use core::fmt;
use core::future::Future;
use core::hash::Hash;
use core::pin::Pin;
use std::sync::Arc;

pub type ProtocolFuture<'a> = Pin<Box<dyn Future<Output = Result<(), ProtocolError>> + Send + 'a>>;
pub type ProtocolFetchFuture<T> = Pin<Box<dyn Future<Output = Result<T, AnyError>> + Send + 'static>>;

/// Outcome handed to [`FetchProtocol::process`] for every waiting reference.
///
/// The content is shared by all references coalesced onto the same location.
pub type Delivery<C> = Result<Arc<C>, FetchFailure>;

/// Enumerates the protocol hooks whose failures abort the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolStage {
    Process,
    Unresolved,
    Shutdown,
}

/// Error surfaced by protocol hooks. Every instance is considered fatal.
#[derive(Debug)]
pub struct ProtocolError {
    stage: ProtocolStage,
    source: AnyError,
}

impl ProtocolError {
    pub fn new(stage: ProtocolStage, source: AnyError) -> Self {
        Self { stage, source }
    }

    pub fn stage(&self) -> ProtocolStage {
        self.stage
    }

    pub fn into_source(self) -> AnyError {
        self.source
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} protocol error: {}", self.stage, self.source)
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

/// Why a dispatched fetch produced no content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchFailureKind {
    /// The fetch capability returned an error.
    Failed,
    /// The worker abandoned the fetch because the pipeline was shutting down.
    Cancelled,
}

/// Fetch error fanned out to every reference waiting on the failed location.
///
/// Cheap to clone: the underlying error is shared.
#[derive(Clone)]
pub struct FetchFailure {
    kind: FetchFailureKind,
    location: Arc<str>,
    source: Arc<AnyError>,
}

impl FetchFailure {
    pub fn failed(location: &impl fmt::Debug, source: AnyError) -> Self {
        Self {
            kind: FetchFailureKind::Failed,
            location: Arc::from(format!("{location:?}")),
            source: Arc::new(source),
        }
    }

    pub fn cancelled(location: &impl fmt::Debug) -> Self {
        Self {
            kind: FetchFailureKind::Cancelled,
            location: Arc::from(format!("{location:?}")),
            source: Arc::new(anyhow::anyhow!("fetch cancelled by shutdown")),
        }
    }

    pub fn kind(&self) -> FetchFailureKind {
        self.kind
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == FetchFailureKind::Cancelled
    }

    /// Debug rendering of the location whose fetch failed.
    pub fn location(&self) -> &str {
        &self.location
    }
}

impl fmt::Debug for FetchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchFailure")
            .field("kind", &self.kind)
            .field("location", &self.location)
            .field("source", &self.source)
            .finish()
    }
}

impl fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            FetchFailureKind::Failed => {
                write!(f, "fetch for {} failed: {}", self.location, self.source)
            }
            FetchFailureKind::Cancelled => write!(f, "fetch for {} cancelled", self.location),
        }
    }
}

impl std::error::Error for FetchFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref().as_ref())
    }
}

/// A reference that could not be mapped to a location. The reference is dropped
/// from the pipeline after being reported.
#[derive(Debug)]
pub struct ResolutionFailure<R> {
    reference: R,
    source: AnyError,
}

impl<R> ResolutionFailure<R> {
    pub fn new(reference: R, source: AnyError) -> Self {
        Self { reference, source }
    }

    pub fn reference(&self) -> &R {
        &self.reference
    }

    pub fn into_parts(self) -> (R, AnyError) {
        (self.reference, self.source)
    }
}

impl<R: fmt::Debug> fmt::Display for ResolutionFailure<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "could not resolve location for {:?}: {}",
            self.reference, self.source
        )
    }
}

impl<R: fmt::Debug> std::error::Error for ResolutionFailure<R> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

/// Capabilities injected by the consumer of the pipeline.
pub trait FetchProtocol: Send + Sync + 'static {
    type Reference: fmt::Debug + Send + 'static;
    type Location: fmt::Debug + Clone + Eq + Hash + Send + Sync + 'static;
    type Content: Send + Sync + 'static;

    /// Maps a reference to the location it should be fetched from. Called by the
    /// coordinator for every submitted reference; must not block.
    fn resolve(&self, reference: &Self::Reference) -> Result<Self::Location, AnyError>;

    /// Executed by worker tasks, at most once concurrently per location.
    fn fetch(&self, location: Self::Location) -> ProtocolFetchFuture<Self::Content>;

    /// Executed sequentially by the coordinator once per waiting reference.
    fn process<'a>(
        &'a mut self,
        reference: Self::Reference,
        delivery: Delivery<Self::Content>,
    ) -> ProtocolFuture<'a>;

    /// Invoked when `resolve` rejects a reference.
    fn unresolved<'a>(
        &'a mut self,
        _failure: ResolutionFailure<Self::Reference>,
    ) -> ProtocolFuture<'a> {
        Box::pin(async { Ok(()) })
    }

    /// Called once during shutdown to allow graceful cleanup.
    fn shutdown<'a>(&'a mut self) -> ProtocolFuture<'a> {
        Box::pin(async { Ok(()) })
    }
}
