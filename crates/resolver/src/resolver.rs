//! The metadata resolution loop.
//!
//! A resolution fetches the block behind a URI and follows the metadata it
//! finds until it reaches plain data. Every block goes through the
//! [`RequestScheduler`]; nested fetches (archive bodies, multi-level
//! metadata blobs) run as child resolutions that share the parent's slot,
//! so cancelling the top level always reaches whatever is in flight.

use crate::archive::{ArchiveId, ArchiveProvider};
use crate::compression::CodecRegistry;
use crate::editions::EditionTracker;
use crate::error::{FetchError, FetchFailure, PathOrigin, ResolveResult};
use crate::events::{Emitter, FetchResult, ResolverEvent};
use crate::slot::{Occupant, ResolutionSlot};
use crate::state::ResolutionState;
use bytes::Bytes;
use cask_bucket::{Bucket, BucketError, BucketWriter, TempBucket, TieredBufferAllocator};
use cask_core::{
    ArchiveKind, ClientMetadata, ClientUri, ContextMask, FetchContext, GetOptions, Key, KeyBlock,
    Metadata, PriorityClass, SplitfileInfo,
};
use cask_scheduler::{BlockFailure, GetEvent, GetRequest, RequestScheduler, SendableRequest};
use futures::Stream;
use futures::future::BoxFuture;
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How much the resolver says about itself.
#[derive(Clone, Copy, Debug, Default)]
pub struct Verbosity {
    /// Log every metadata transition at `info` instead of `trace`.
    pub trace_transitions: bool,
}

/// Long-lived collaborators shared by every resolution.
pub struct ResolverServices {
    pub scheduler: RequestScheduler,
    pub allocator: TieredBufferAllocator,
    pub archives: Arc<dyn ArchiveProvider>,
    pub codecs: Arc<CodecRegistry>,
    pub editions: Arc<EditionTracker>,
    pub verbosity: Verbosity,
    /// Priority of the block requests this resolver registers.
    pub priority: PriorityClass,
}

/// Starts resolutions. Cheap to clone.
#[derive(Clone)]
pub struct MetadataResolver {
    services: Arc<ResolverServices>,
}

impl MetadataResolver {
    pub fn new(services: ResolverServices) -> Self {
        Self {
            services: Arc::new(services),
        }
    }

    pub fn services(&self) -> &ResolverServices {
        &self.services
    }

    /// Start resolving `uri` in the background.
    pub fn start(&self, uri: ClientUri, ctx: FetchContext) -> ResolutionHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let slot = Arc::new(ResolutionSlot::new(self.services.scheduler.clone()));
        let resolution = Resolution {
            services: self.services.clone(),
            slot: slot.clone(),
            events: Emitter::new(tx),
        };

        let task = tokio::spawn(async move {
            tracing::debug!(%uri, "resolution started");
            let outcome = resolution.run(ResolutionState::new(uri, ctx)).await;
            // Claiming the slot fails once cancelled; the outcome is dropped
            // along with any bucket it holds.
            if resolution.slot.become_(Occupant::Finished).is_err() {
                tracing::debug!("resolution cancelled");
                return;
            }
            match &outcome {
                Ok(result) => tracing::debug!(size = result.size(), "resolution finished"),
                Err(failure) => tracing::debug!(error = %failure, "resolution failed"),
            }
            resolution.events.terminal(ResolverEvent::from_outcome(outcome));
        });

        ResolutionHandle {
            events: rx,
            slot,
            task,
        }
    }

    /// Resolve `uri` and wait for the outcome.
    pub async fn resolve(&self, uri: ClientUri, ctx: FetchContext) -> ResolveResult<FetchResult> {
        self.start(uri, ctx).outcome().await
    }
}

impl std::fmt::Debug for MetadataResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataResolver")
            .field("priority", &self.services.priority)
            .field("codecs", &self.services.codecs)
            .finish()
    }
}

/// Caller's side of a running resolution.
#[derive(Debug)]
pub struct ResolutionHandle {
    events: mpsc::UnboundedReceiver<ResolverEvent>,
    slot: Arc<ResolutionSlot>,
    task: JoinHandle<()>,
}

impl ResolutionHandle {
    /// Cancel the resolution. No further events are reported and any
    /// buffer it holds is freed. Returns false if already cancelled.
    pub fn cancel(&self) -> bool {
        self.slot.cancel()
    }

    pub fn is_cancelled(&self) -> bool {
        self.slot.is_cancelled()
    }

    /// Whether the background task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn events(&mut self) -> &mut mpsc::UnboundedReceiver<ResolverEvent> {
        &mut self.events
    }

    /// Events as a stream ending after the terminal event.
    pub fn into_stream(self) -> Pin<Box<dyn Stream<Item = ResolverEvent> + Send>> {
        let mut events = self.events;
        Box::pin(async_stream::stream! {
            while let Some(event) = events.recv().await {
                let terminal = event.is_terminal();
                yield event;
                if terminal {
                    break;
                }
            }
        })
    }

    /// Wait for the terminal event, skipping progress.
    pub async fn outcome(mut self) -> ResolveResult<FetchResult> {
        while let Some(event) = self.events.recv().await {
            match event {
                ResolverEvent::Found(result) => return Ok(result),
                ResolverEvent::FailedRestartable(failure) | ResolverEvent::FailedFatal(failure) => {
                    return Err(failure);
                }
                _ => {}
            }
        }
        Err(FetchFailure::new(FetchError::Cancelled))
    }
}

/// Next thing the loop has to handle.
enum Step {
    Metadata(Metadata),
    Data(Payload),
}

/// Final data before it is handed out.
enum Payload {
    Bytes(Bytes),
    Bucket(TempBucket),
}

impl Payload {
    fn len(&self) -> u64 {
        match self {
            Payload::Bytes(data) => data.len() as u64,
            Payload::Bucket(bucket) => bucket.size(),
        }
    }

    async fn into_bytes(self) -> Result<Bytes, BucketError> {
        match self {
            Payload::Bytes(data) => Ok(data),
            Payload::Bucket(bucket) => bucket.read_to_bytes().await,
        }
    }
}

/// One resolution or nested child. Children share the slot and report
/// through a muted emitter.
struct Resolution {
    services: Arc<ResolverServices>,
    slot: Arc<ResolutionSlot>,
    events: Emitter,
}

impl Resolution {
    fn child(&self) -> Resolution {
        Resolution {
            services: self.services.clone(),
            slot: self.slot.clone(),
            events: self.events.muted(),
        }
    }

    async fn run(&self, mut state: ResolutionState) -> ResolveResult<FetchResult> {
        let max = state.ctx().max_path_components();
        let given = state.remaining_meta_strings();
        if given > max {
            return Err(FetchError::TooManyPathComponents {
                origin: PathOrigin::Caller,
                suggested: Some(state.uri().drop_last_meta_strings(given - max)),
            }
            .into());
        }
        let block = self.fetch_block(&mut state).await?;
        let step = self.classify(&state, block)?;
        self.follow(state, step).await
    }

    /// Drive the loop from `step` until data is produced.
    fn follow(
        &self,
        mut state: ResolutionState,
        mut step: Step,
    ) -> BoxFuture<'_, ResolveResult<FetchResult>> {
        Box::pin(async move {
            loop {
                self.slot.check()?;
                let metadata = match step {
                    Step::Data(payload) => return self.finish(state, payload).await,
                    Step::Metadata(metadata) => metadata,
                };
                self.trace_transition(&state, &metadata);
                step = match metadata {
                    Metadata::SimpleManifest { entries } => self.enter_manifest(&mut state, entries)?,
                    Metadata::SymbolicShortlink { target } => {
                        return Err(FetchError::InvalidMetadata(format!(
                            "shortlink to {target} outside a manifest"
                        ))
                        .into());
                    }
                    Metadata::ArchiveManifest {
                        archive_kind,
                        compression,
                        source,
                        client,
                    } => {
                        if state.remaining_meta_strings() == 0 && state.ctx().return_archives() {
                            Step::Metadata(*source)
                        } else {
                            let manifest = Metadata::ArchiveManifest {
                                archive_kind,
                                compression,
                                source,
                                client,
                            };
                            self.enter_archive(&mut state, archive_kind, manifest).await?
                        }
                    }
                    Metadata::ArchiveMetadataRedirect { name } => {
                        let data = self.archive_member(&mut state, &name).await?;
                        Step::Metadata(self.parse_metadata(&state, &data)?)
                    }
                    Metadata::ArchiveInternalRedirect { name, client } => {
                        self.merge_client(&mut state, &client);
                        self.check_mime(&state)?;
                        let data = self.archive_member(&mut state, &name).await?;
                        Step::Data(Payload::Bytes(data))
                    }
                    Metadata::MultiLevelRedirect { source } => {
                        state.next_hop()?;
                        let child_state =
                            state.child(state.this_key().clone(), state.ctx().clone());
                        self.slot.become_(Occupant::Child {
                            purpose: "multi-level metadata",
                        })?;
                        let blob = self
                            .child()
                            .follow(child_state, Step::Metadata(*source))
                            .await?;
                        let data = blob.bytes().await?;
                        Step::Metadata(self.parse_metadata(&state, &data)?)
                    }
                    redirect @ Metadata::SingleRedirect { .. } => {
                        self.follow_redirect(&mut state, redirect).await?
                    }
                    Metadata::Splitfile(info) => self.enter_splitfile(&mut state, info).await?,
                };
            }
        })
    }

    fn enter_manifest(
        &self,
        state: &mut ResolutionState,
        mut entries: BTreeMap<String, Metadata>,
    ) -> ResolveResult<Step> {
        if entries.len() == 1 && matches!(entries.get(""), Some(Metadata::SimpleManifest { .. })) {
            tracing::error!(uri = %state.this_key(), "manifest's only entry is an unnamed manifest");
            return Err(FetchError::InvalidMetadata(
                "manifest's default entry is itself a manifest".to_string(),
            )
            .into());
        }

        let Some(mut name) = state.pop_meta_string() else {
            let default = entries
                .remove("")
                .ok_or_else(|| FetchError::NotEnoughPathComponents {
                    suggested: Some(state.uri().add_meta_strings([""])),
                })?;
            return Ok(Step::Metadata(default));
        };

        let mut entry = entries.remove(&name);
        if let Some(Metadata::SymbolicShortlink { target }) = entry {
            if target == name {
                return Err(FetchError::InvalidMetadata(format!("redirect loop: {name}")).into());
            }
            entry = entries.remove(&target);
            name = target;
        }
        state.push_this_key_component(&name);
        let entry = entry.ok_or(FetchError::NotInArchive(name))?;
        Ok(Step::Metadata(entry))
    }

    async fn enter_archive(
        &self,
        state: &mut ResolutionState,
        kind: ArchiveKind,
        manifest: Metadata,
    ) -> ResolveResult<Step> {
        let archive = ArchiveId {
            uri: state.this_key().clone(),
            kind,
        };
        state.enter_archive(archive.clone(), manifest)?;

        let index = match self.services.archives.index(&archive).await? {
            Some(index) => index,
            None => {
                self.fetch_archive(state).await?;
                self.services
                    .archives
                    .index(&archive)
                    .await?
                    .ok_or_else(|| FetchError::internal("archive has no index after extraction"))?
            }
        };
        Ok(Step::Metadata(self.parse_metadata(state, &index)?))
    }

    /// A member of the current archive, fetching the archive if it is not
    /// extracted yet.
    async fn archive_member(&self, state: &mut ResolutionState, name: &str) -> ResolveResult<Bytes> {
        let Some(archive) = state.archive().cloned() else {
            return Err(FetchError::UnknownMetadata(format!(
                "archive member {name} requested outside an archive"
            ))
            .into());
        };
        if let Some(data) = self.services.archives.member(&archive, name).await? {
            return Ok(data);
        }
        self.fetch_archive(state).await?;
        self.services
            .archives
            .member(&archive, name)
            .await?
            .ok_or_else(|| FetchError::NotInArchive(name.to_string()).into())
    }

    /// Fetch the body of the current archive through a child resolution
    /// and extract it.
    async fn fetch_archive(&self, state: &mut ResolutionState) -> ResolveResult<()> {
        let (Some(archive), Some(manifest)) =
            (state.archive().cloned(), state.archive_manifest().cloned())
        else {
            return Err(FetchError::internal("archive fetch without an open archive").into());
        };
        let compression = match &manifest {
            Metadata::ArchiveManifest { compression, .. } => *compression,
            _ => None,
        };

        state.next_hop()?;
        let mut child_state = state.child(
            state.this_key().clone(),
            state.ctx().derive(ContextMask::ReturnArchives),
        );
        if let Some(codec) = compression {
            child_state.push_decompressor(codec);
        }
        self.slot.become_(Occupant::Child { purpose: "archive" })?;
        tracing::debug!(uri = %archive.uri, kind = ?archive.kind, "fetching archive");

        let body = self
            .child()
            .follow(child_state, Step::Metadata(manifest.into_archive_source()))
            .await?;
        let data = body.bytes().await?;
        drop(body);
        self.services.archives.extract(&archive, data).await?;
        Ok(())
    }

    async fn follow_redirect(
        &self,
        state: &mut ResolutionState,
        redirect: Metadata,
    ) -> ResolveResult<Step> {
        let Metadata::SingleRedirect {
            target,
            client,
            compression,
        } = redirect
        else {
            return Err(FetchError::internal("follow_redirect on a non-redirect").into());
        };

        self.merge_client(state, &client);
        if let Some(kind) = self.implicit_archive(state) {
            tracing::debug!(uri = %target, "redirect is an implicit archive");
            state.clear_client();
            let redirect = Metadata::SingleRedirect {
                target,
                client,
                compression,
            };
            return Ok(Step::Metadata(redirect.into_implicit_archive(kind)));
        }
        self.check_mime(state)?;

        state.prepend_meta_strings(target.meta_strings());
        if let Some(codec) = compression {
            state.push_decompressor(codec);
        }
        state.set_this_key(target.without_meta_strings());
        state.next_hop()?;

        let block = self.fetch_block(state).await?;
        self.classify(state, block)
    }

    async fn enter_splitfile(
        &self,
        state: &mut ResolutionState,
        mut info: SplitfileInfo,
    ) -> ResolveResult<Step> {
        if !state.ctx().allow_splitfiles() {
            return Err(FetchError::InvalidMetadata("splitfiles are not allowed".to_string()).into());
        }

        self.merge_client(state, &info.client);
        if let Some(kind) = self.implicit_archive(state) {
            tracing::debug!("splitfile is an implicit archive");
            state.clear_client();
            info.client.clear();
            return Ok(Step::Metadata(Metadata::Splitfile(info).into_implicit_archive(kind)));
        }
        self.check_mime(state)?;

        if let Some(codec) = info.compression {
            state.push_decompressor(codec);
        }

        let length = info.max_length();
        state.check_path_consumed().map_err(|error| {
            FetchFailure::new(error)
                .with_size(length, false)
                .with_mime(state.client().mime_type.clone())
        })?;

        let ctx = state.ctx();
        if length > ctx.max_output_length() || length > ctx.max_temp_length() {
            let pending = usize::from(info.compression.is_some());
            return Err(FetchFailure::new(FetchError::TooBig {
                size: Some(length),
                metadata: false,
            })
            .with_size(length, state.size_finalized(pending))
            .with_mime(state.client().mime_type.clone()));
        }
        for (index, segment) in info.segments.iter().enumerate() {
            if segment.data_keys.len() > ctx.max_data_blocks_per_segment()
                || segment.check_keys.len() > ctx.max_check_blocks_per_segment()
            {
                return Err(FetchError::InvalidMetadata(format!(
                    "segment {index} has too many blocks: {} data, {} check",
                    segment.data_keys.len(),
                    segment.check_keys.len()
                ))
                .into());
            }
        }

        if info.data_block_count() == 0 {
            if info.data_length > 0 || info.compression.is_some() {
                return Err(FetchError::InvalidMetadata(format!(
                    "splitfile declares {} bytes but has no data blocks",
                    info.data_length
                ))
                .into());
            }
            self.events.progress(ResolverEvent::ExpectedSize(0));
            return Ok(Step::Data(Payload::Bytes(Bytes::new())));
        }

        self.events.progress(ResolverEvent::ExpectedSize(length));
        let bucket = self.fetch_splitfile(state, &info).await?;
        Ok(Step::Data(Payload::Bucket(bucket)))
    }

    /// Fetch every data block of a splitfile as one request and write them
    /// in layout order, truncated to the declared data length.
    async fn fetch_splitfile(
        &self,
        state: &ResolutionState,
        info: &SplitfileInfo,
    ) -> ResolveResult<TempBucket> {
        let layout: Vec<Key> = info.data_keys().cloned().collect();
        let total = layout.len();
        let mut positions: HashMap<Key, Vec<usize>> = HashMap::new();
        for (index, key) in layout.iter().enumerate() {
            positions.entry(key.clone()).or_default().push(index);
        }

        let options = GetOptions::from_context(&state.ctx().derive(ContextMask::SplitfileDefaultBlock))
            .with_bulk_failure();
        let (request, mut rx) = GetRequest::new(layout, options);
        let handle = self
            .services
            .scheduler
            .register_sendable(SendableRequest::Get(request), self.services.priority, false)
            .map_err(|e| FetchError::internal(format!("failed to register splitfile: {e}")))?;
        self.slot.become_(Occupant::Splitfile {
            handle,
            blocks: total,
        })?;
        self.events.progress(ResolverEvent::BlockSetFinalized);

        let bucket = self.services.allocator.allocate(info.data_length)?;
        let mut writer = bucket.open_writer()?;
        let mut held: BTreeMap<usize, Bytes> = BTreeMap::new();
        let mut next = 0;
        let mut fetched = 0;
        let mut written = 0u64;

        while next < total {
            let event = tokio::select! {
                biased;
                _ = self.slot.cancelled() => return Err(FetchError::Cancelled.into()),
                event = rx.recv() => event,
            };
            match event {
                Some(GetEvent::Found(block)) => {
                    let Some(slots) = positions.remove(block.key()) else {
                        continue;
                    };
                    if block.is_metadata() {
                        return Err(FetchError::InvalidMetadata(format!(
                            "metadata block {} inside a splitfile",
                            block.key()
                        ))
                        .into());
                    }
                    verify(&block)?;
                    fetched += slots.len();
                    for index in slots {
                        held.insert(index, block.payload().clone());
                    }
                    while let Some(data) = held.remove(&next) {
                        let room = info.data_length.saturating_sub(written);
                        let take = (data.len() as u64).min(room) as usize;
                        writer = write_chunk(writer, data.slice(..take)).await?;
                        written += take as u64;
                        next += 1;
                    }
                    self.events.progress(ResolverEvent::Progress { fetched, total });
                }
                Some(GetEvent::SentToNetwork) => self.events.progress(ResolverEvent::SentToNetwork),
                Some(GetEvent::Failed { key, failure }) => {
                    tracing::debug!(%key, %failure, "splitfile block failed");
                    return Err(FetchError::BlockFetch(failure).into());
                }
                Some(GetEvent::BulkFailed(failures)) => {
                    tracing::debug!(failed = failures.len(), "splitfile blocks failed");
                    return Err(FetchError::BlockFetch(first_failure(failures)).into());
                }
                None => {
                    return Err(FetchError::internal("scheduler dropped the splitfile request").into());
                }
            }
        }
        drop(writer);
        self.slot.become_(Occupant::Idle)?;

        if written < info.data_length {
            return Err(FetchError::InvalidMetadata(format!(
                "splitfile blocks hold {written} bytes, {} declared",
                info.data_length
            ))
            .into());
        }
        Ok(bucket)
    }

    /// Fetch the block behind `state.this_key()`.
    async fn fetch_block(&self, state: &mut ResolutionState) -> ResolveResult<KeyBlock> {
        let target = state.this_key().clone();
        if let Some(newer) = self.services.editions.check(&target) {
            let uri = if state.uri().key() == target.key() {
                state.uri().with_edition(edition_of(&newer))
            } else {
                newer
            };
            return Err(FetchError::PermanentRedirect { uri }.into());
        }

        let key = target.key().clone();
        let (request, mut rx) = GetRequest::new([key.clone()], GetOptions::from_context(state.ctx()));
        let handle = self
            .services
            .scheduler
            .register_sendable(SendableRequest::Get(request), self.services.priority, false)
            .map_err(|e| FetchError::internal(format!("failed to register fetch: {e}")))?;
        self.slot.become_(Occupant::Fetching {
            key: key.clone(),
            handle,
        })?;

        let block = loop {
            let event = tokio::select! {
                biased;
                _ = self.slot.cancelled() => return Err(FetchError::Cancelled.into()),
                event = rx.recv() => event,
            };
            match event {
                Some(GetEvent::Found(block)) => break block,
                Some(GetEvent::SentToNetwork) => self.events.progress(ResolverEvent::SentToNetwork),
                Some(GetEvent::Failed { failure, .. }) => {
                    return Err(FetchError::BlockFetch(failure).into());
                }
                Some(GetEvent::BulkFailed(failures)) => {
                    return Err(FetchError::BlockFetch(first_failure(failures)).into());
                }
                None => return Err(FetchError::internal("scheduler dropped the fetch").into()),
            }
        };
        self.slot.become_(Occupant::Idle)?;

        verify(&block)?;
        if let Key::Subspace(subspace) = block.key() {
            self.services.editions.observe(subspace);
        }
        tracing::trace!(%key, size = block.payload().len(), metadata = block.is_metadata(), "block fetched");
        Ok(block)
    }

    /// Data blocks are final; metadata blocks are parsed.
    fn classify(&self, state: &ResolutionState, block: KeyBlock) -> ResolveResult<Step> {
        if !block.is_metadata() {
            return Ok(Step::Data(Payload::Bytes(block.payload().clone())));
        }
        if !state.ctx().follow_redirects() {
            return Err(FetchError::InvalidMetadata(
                "metadata found where redirects are not allowed".to_string(),
            )
            .into());
        }
        Ok(Step::Metadata(self.parse_metadata(state, block.payload())?))
    }

    fn parse_metadata(&self, state: &ResolutionState, data: &[u8]) -> ResolveResult<Metadata> {
        let max = state.ctx().max_metadata_size();
        let size = data.len() as u64;
        if size > max {
            return Err(FetchError::TooBig {
                size: Some(size),
                metadata: true,
            }
            .into());
        }
        Metadata::parse(data, max)
            .map_err(|e| FetchError::InvalidMetadata(e.to_string()).into())
    }

    /// Apply pending decompressors, most recent first, and hand the data
    /// out in a bucket.
    async fn finish(&self, mut state: ResolutionState, payload: Payload) -> ResolveResult<FetchResult> {
        let ctx = state.ctx().clone();
        let mime = state.client().mime_type.clone();

        let payload = if state.decompressors().is_empty() {
            payload
        } else {
            let ceiling = ctx.max_temp_length().max(ctx.max_output_length());
            let mut data = payload.into_bytes().await?;
            while let Some(kind) = state.pop_decompressor() {
                let codec = self.services.codecs.get(kind)?;
                data = codec
                    .decompress(&data, ceiling)
                    .await
                    .map_err(|e| FetchFailure::from(e).with_mime(mime.clone()))?;
                tracing::trace!(codec = kind.as_str(), size = data.len(), "decompressed");
            }
            Payload::Bytes(data)
        };

        let size = payload.len();
        state
            .check_path_consumed()
            .map_err(|e| FetchFailure::new(e).with_size(size, true).with_mime(mime.clone()))?;

        let limit = if state.is_final() {
            ctx.max_output_length()
        } else {
            ctx.max_temp_length()
        };
        if size > limit {
            return Err(FetchFailure::new(FetchError::TooBig {
                size: Some(size),
                metadata: false,
            })
            .with_size(size, state.is_final())
            .with_mime(mime));
        }

        let bucket = match payload {
            Payload::Bucket(bucket) => bucket,
            Payload::Bytes(data) => self.services.allocator.store_bytes(data).await?,
        };
        Ok(FetchResult {
            bucket,
            client: state.client().clone(),
        })
    }

    fn merge_client(&self, state: &mut ResolutionState, client: &ClientMetadata) {
        if let Some(mime) = state.merge_client(client) {
            self.events.progress(ResolverEvent::ExpectedMime(mime));
        }
    }

    /// Archive kind of a redirect whose MIME type is a container and that
    /// still has path components to resolve.
    fn implicit_archive(&self, state: &ResolutionState) -> Option<ArchiveKind> {
        if state.remaining_meta_strings() == 0 || state.ctx().dont_enter_implicit_archives() {
            return None;
        }
        state.client().mime_type_no_params().and_then(ArchiveKind::from_mime)
    }

    fn check_mime(&self, state: &ResolutionState) -> ResolveResult<()> {
        if state.remaining_meta_strings() > 0 || !state.is_final() {
            return Ok(());
        }
        match state.client().mime_type_no_params() {
            Some(mime) if !state.ctx().mime_allowed(mime) => {
                let full = state.client().mime_type.clone();
                Err(FetchFailure::new(FetchError::WrongMimeType(mime.to_string())).with_mime(full))
            }
            _ => Ok(()),
        }
    }

    fn trace_transition(&self, state: &ResolutionState, metadata: &Metadata) {
        if self.services.verbosity.trace_transitions {
            tracing::info!(
                kind = metadata.kind_name(),
                uri = %state.this_key(),
                level = state.recursion_level(),
                remaining = state.remaining_meta_strings(),
                "metadata transition"
            );
        } else {
            tracing::trace!(
                kind = metadata.kind_name(),
                uri = %state.this_key(),
                level = state.recursion_level(),
                remaining = state.remaining_meta_strings(),
                "metadata transition"
            );
        }
    }
}

fn verify(block: &KeyBlock) -> Result<(), FetchError> {
    cask_signer::verify_block(block)
        .map_err(|e| FetchError::BlockFetch(BlockFailure::Verification(e.to_string())))
}

fn first_failure(failures: Vec<(Key, BlockFailure)>) -> BlockFailure {
    failures
        .into_iter()
        .map(|(_, failure)| failure)
        .next()
        .unwrap_or(BlockFailure::DataNotFound)
}

fn edition_of(uri: &ClientUri) -> u64 {
    uri.key().as_subspace().map_or(0, |key| key.edition())
}

/// Append `chunk` on the blocking pool and hand the writer back.
async fn write_chunk(mut writer: BucketWriter, chunk: Bytes) -> Result<BucketWriter, FetchError> {
    if chunk.is_empty() {
        return Ok(writer);
    }
    tokio::task::spawn_blocking(move || -> std::io::Result<BucketWriter> {
        writer.write_all(&chunk)?;
        Ok(writer)
    })
    .await
    .map_err(|e| BucketError::Task(e.to_string()))?
    .map_err(|e| BucketError::Io(e).into())
}
