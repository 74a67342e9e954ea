//! Per-resolution bookkeeping.

use crate::archive::ArchiveId;
use crate::error::{FetchError, FetchFailure, PathOrigin};
use cask_core::{ClientMetadata, ClientUri, CompressionCodec, FetchContext, Metadata};
use std::collections::VecDeque;

/// State of one resolution. Owned by the task driving it; nested
/// resolutions get their own through [`ResolutionState::child`].
#[derive(Clone, Debug)]
pub struct ResolutionState {
    /// URI as requested by the caller.
    uri: ClientUri,
    /// Key being resolved plus the components consumed so far.
    this_key: ClientUri,
    meta_strings: VecDeque<String>,
    /// Leading components of `meta_strings` introduced by redirects.
    added_meta_strings: usize,
    client: ClientMetadata,
    recursion_level: u32,
    decompressors: Vec<CompressionCodec>,
    archive: Option<ArchiveId>,
    /// Manifest of the open archive, used to refetch its body.
    archive_manifest: Option<Metadata>,
    archive_levels: u32,
    /// Output goes to the caller rather than to a parent resolution.
    is_final: bool,
    ctx: FetchContext,
}

impl ResolutionState {
    pub fn new(uri: ClientUri, ctx: FetchContext) -> Self {
        Self {
            this_key: uri.without_meta_strings(),
            meta_strings: uri.meta_strings().iter().cloned().collect(),
            uri,
            added_meta_strings: 0,
            client: ClientMetadata::default(),
            recursion_level: 0,
            decompressors: Vec::new(),
            archive: None,
            archive_manifest: None,
            archive_levels: 0,
            is_final: true,
            ctx,
        }
    }

    /// State for a nested fetch of `target`. The child starts at the
    /// parent's recursion level, with no path components, client hints or
    /// decompressors of its own.
    pub fn child(&self, target: ClientUri, ctx: FetchContext) -> Self {
        Self {
            uri: target.clone(),
            this_key: target,
            meta_strings: VecDeque::new(),
            added_meta_strings: 0,
            client: ClientMetadata::default(),
            recursion_level: self.recursion_level,
            decompressors: Vec::new(),
            archive: None,
            archive_manifest: None,
            archive_levels: self.archive_levels,
            is_final: false,
            ctx,
        }
    }

    pub fn uri(&self) -> &ClientUri {
        &self.uri
    }

    pub fn this_key(&self) -> &ClientUri {
        &self.this_key
    }

    pub fn ctx(&self) -> &FetchContext {
        &self.ctx
    }

    pub fn client(&self) -> &ClientMetadata {
        &self.client
    }

    pub fn recursion_level(&self) -> u32 {
        self.recursion_level
    }

    pub fn is_final(&self) -> bool {
        self.is_final
    }

    pub fn remaining_meta_strings(&self) -> usize {
        self.meta_strings.len()
    }

    pub fn added_meta_strings(&self) -> usize {
        self.added_meta_strings
    }

    pub fn decompressors(&self) -> &[CompressionCodec] {
        &self.decompressors
    }

    /// Consume the next path component.
    pub fn pop_meta_string(&mut self) -> Option<String> {
        let name = self.meta_strings.pop_front()?;
        self.added_meta_strings = self.added_meta_strings.saturating_sub(1);
        Some(name)
    }

    /// Put components in front of the remaining ones, keeping their order.
    pub fn prepend_meta_strings(&mut self, extra: &[String]) {
        for name in extra.iter().rev() {
            self.meta_strings.push_front(name.clone());
        }
        self.added_meta_strings += extra.len();
    }

    pub(crate) fn set_this_key(&mut self, key: ClientUri) {
        self.this_key = key;
    }

    pub(crate) fn push_this_key_component(&mut self, name: &str) {
        self.this_key.push_meta_string(name);
    }

    /// Merge hints without overwriting ones already set. Returns the MIME
    /// type if this call set it.
    pub(crate) fn merge_client(&mut self, other: &ClientMetadata) -> Option<String> {
        let had_mime = self.client.mime_type.is_some();
        self.client.merge_no_overwrite(other);
        if had_mime {
            return None;
        }
        self.client.mime_type.clone()
    }

    pub(crate) fn clear_client(&mut self) {
        self.client.clear();
    }

    pub(crate) fn push_decompressor(&mut self, codec: CompressionCodec) {
        self.decompressors.push(codec);
    }

    /// Most recently pushed codec first.
    pub(crate) fn pop_decompressor(&mut self) -> Option<CompressionCodec> {
        self.decompressors.pop()
    }

    pub(crate) fn archive(&self) -> Option<&ArchiveId> {
        self.archive.as_ref()
    }

    pub(crate) fn archive_manifest(&self) -> Option<&Metadata> {
        self.archive_manifest.as_ref()
    }

    /// Open `archive`, replacing any other. Re-entering the same archive
    /// keeps the handle and does not count as a new level.
    pub(crate) fn enter_archive(
        &mut self,
        archive: ArchiveId,
        manifest: Metadata,
    ) -> Result<(), FetchError> {
        if self.archive.as_ref() == Some(&archive) {
            self.archive_manifest = Some(manifest);
            return Ok(());
        }
        self.archive_levels += 1;
        if self.archive_levels > self.ctx.max_archive_levels() {
            return Err(FetchError::ArchiveFailure {
                restartable: false,
                message: format!(
                    "too many archive levels: {} exceeds {}",
                    self.archive_levels,
                    self.ctx.max_archive_levels()
                ),
            });
        }
        self.archive = Some(archive);
        self.archive_manifest = Some(manifest);
        Ok(())
    }

    /// Count one hop through a fetched key. Fails once the level exceeds
    /// the context maximum.
    pub fn next_hop(&mut self) -> Result<(), FetchFailure> {
        self.recursion_level += 1;
        let max = self.ctx.max_recursion_level();
        if self.recursion_level > max {
            return Err(FetchFailure::new(FetchError::TooMuchRecursion {
                level: self.recursion_level,
                max,
            }));
        }
        Ok(())
    }

    /// Fail if path components are left over at a terminal node.
    pub fn check_path_consumed(&self) -> Result<(), FetchError> {
        if !self.is_final || self.ctx.ignore_too_many_path_components() {
            return Ok(());
        }
        let left = self.meta_strings.len();
        if left == 0 {
            return Ok(());
        }
        if self.added_meta_strings > 0 {
            return Err(FetchError::TooManyPathComponents {
                origin: PathOrigin::Redirect,
                suggested: None,
            });
        }
        Err(FetchError::TooManyPathComponents {
            origin: PathOrigin::Caller,
            suggested: Some(self.uri.drop_last_meta_strings(left)),
        })
    }

    /// Size of the final data is known exactly once no decompressor other
    /// than `pending` remains to change it.
    pub(crate) fn size_finalized(&self, pending: usize) -> bool {
        self.is_final && self.decompressors.len() <= pending
    }
}
