//! Events a resolution reports to its caller.

use crate::error::FetchFailure;
use bytes::Bytes;
use cask_bucket::{Bucket, BucketResult, TempBucket};
use cask_core::ClientMetadata;
use tokio::sync::mpsc;

/// Final data of a successful resolution. Owns its bucket.
#[derive(Debug)]
pub struct FetchResult {
    pub bucket: TempBucket,
    pub client: ClientMetadata,
}

impl FetchResult {
    pub fn mime_type(&self) -> Option<&str> {
        self.client.mime_type.as_deref()
    }

    pub fn size(&self) -> u64 {
        self.bucket.size()
    }

    pub async fn bytes(&self) -> BucketResult<Bytes> {
        self.bucket.read_to_bytes().await
    }
}

/// One notification from a resolution. Exactly one of `Found`,
/// `FailedRestartable` and `FailedFatal` is sent, and it is the last event,
/// unless the resolution was cancelled, in which case none is.
#[derive(Debug)]
pub enum ResolverEvent {
    Found(FetchResult),
    FailedRestartable(FetchFailure),
    FailedFatal(FetchFailure),
    ExpectedSize(u64),
    ExpectedMime(String),
    /// The block layout of a splitfile was handed to the scheduler.
    BlockSetFinalized,
    Progress { fetched: usize, total: usize },
    SentToNetwork,
}

impl ResolverEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ResolverEvent::Found(_)
                | ResolverEvent::FailedRestartable(_)
                | ResolverEvent::FailedFatal(_)
        )
    }

    pub(crate) fn from_outcome(outcome: Result<FetchResult, FetchFailure>) -> Self {
        match outcome {
            Ok(result) => ResolverEvent::Found(result),
            Err(failure) if failure.is_restartable() => ResolverEvent::FailedRestartable(failure),
            Err(failure) => ResolverEvent::FailedFatal(failure),
        }
    }
}

/// Sending half of a resolution's event channel. Child resolutions get a
/// muted copy so only the top level reports progress.
#[derive(Clone, Debug)]
pub(crate) struct Emitter {
    tx: mpsc::UnboundedSender<ResolverEvent>,
    progress: bool,
}

impl Emitter {
    pub(crate) fn new(tx: mpsc::UnboundedSender<ResolverEvent>) -> Self {
        Self { tx, progress: true }
    }

    pub(crate) fn muted(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            progress: false,
        }
    }

    pub(crate) fn progress(&self, event: ResolverEvent) {
        if self.progress {
            // Receiver gone means nobody is listening; nothing to do.
            let _ = self.tx.send(event);
        }
    }

    pub(crate) fn terminal(&self, event: ResolverEvent) {
        let _ = self.tx.send(event);
    }
}
