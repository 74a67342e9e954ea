//! Per-request fetch policy.
//!
//! A [`FetchContext`] is built once per top-level request through
//! [`FetchContextBuilder`] and never mutated afterwards. Sub-fetches get a
//! copy through [`FetchContext::derive`] with one of the named
//! [`ContextMask`]s.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Named overrides applied when copying a context for a sub-fetch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContextMask {
    /// Plain copy.
    Identical,
    /// Fetching a single block of a splitfile: no redirects, archives or
    /// nested splitfiles, one level of recursion.
    SplitfileDefaultBlock,
    /// Return raw archive bytes instead of entering the archive.
    ReturnArchives,
}

/// Immutable fetch limits and switches.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchContext {
    max_output_length: u64,
    max_temp_length: u64,
    max_metadata_size: u64,
    max_recursion_level: u32,
    max_archive_levels: u32,
    max_path_components: usize,
    dont_enter_implicit_archives: bool,
    allow_splitfiles: bool,
    follow_redirects: bool,
    local_request_only: bool,
    ignore_store: bool,
    return_archives: bool,
    ignore_too_many_path_components: bool,
    allowed_mime_types: Option<BTreeSet<String>>,
    max_data_blocks_per_segment: usize,
    max_check_blocks_per_segment: usize,
}

impl FetchContext {
    pub fn builder() -> FetchContextBuilder {
        FetchContextBuilder::default()
    }

    /// Copy this context with a mask applied.
    pub fn derive(&self, mask: ContextMask) -> Self {
        let mut ctx = self.clone();
        match mask {
            ContextMask::Identical => {}
            ContextMask::SplitfileDefaultBlock => {
                ctx.max_recursion_level = 1;
                ctx.max_archive_levels = 0;
                ctx.dont_enter_implicit_archives = true;
                ctx.allow_splitfiles = false;
                ctx.follow_redirects = false;
                ctx.max_data_blocks_per_segment = 0;
                ctx.max_check_blocks_per_segment = 0;
                ctx.return_archives = false;
            }
            ContextMask::ReturnArchives => {
                ctx.return_archives = true;
            }
        }
        ctx
    }

    pub fn max_output_length(&self) -> u64 {
        self.max_output_length
    }

    pub fn max_temp_length(&self) -> u64 {
        self.max_temp_length
    }

    pub fn max_metadata_size(&self) -> u64 {
        self.max_metadata_size
    }

    pub fn max_recursion_level(&self) -> u32 {
        self.max_recursion_level
    }

    pub fn max_archive_levels(&self) -> u32 {
        self.max_archive_levels
    }

    pub fn max_path_components(&self) -> usize {
        self.max_path_components
    }

    pub fn dont_enter_implicit_archives(&self) -> bool {
        self.dont_enter_implicit_archives
    }

    pub fn allow_splitfiles(&self) -> bool {
        self.allow_splitfiles
    }

    pub fn follow_redirects(&self) -> bool {
        self.follow_redirects
    }

    pub fn local_request_only(&self) -> bool {
        self.local_request_only
    }

    pub fn ignore_store(&self) -> bool {
        self.ignore_store
    }

    pub fn return_archives(&self) -> bool {
        self.return_archives
    }

    pub fn ignore_too_many_path_components(&self) -> bool {
        self.ignore_too_many_path_components
    }

    pub fn max_data_blocks_per_segment(&self) -> usize {
        self.max_data_blocks_per_segment
    }

    pub fn max_check_blocks_per_segment(&self) -> usize {
        self.max_check_blocks_per_segment
    }

    /// Whether `mime` may be returned. No allow-list means anything goes.
    pub fn mime_allowed(&self, mime: &str) -> bool {
        match &self.allowed_mime_types {
            Some(allowed) => allowed.contains(mime),
            None => true,
        }
    }

    pub fn allowed_mime_types(&self) -> Option<&BTreeSet<String>> {
        self.allowed_mime_types.as_ref()
    }
}

impl Default for FetchContext {
    fn default() -> Self {
        FetchContextBuilder::default().build_unchecked()
    }
}

/// Builder for [`FetchContext`].
#[derive(Clone, Debug)]
pub struct FetchContextBuilder {
    ctx: FetchContext,
}

impl Default for FetchContextBuilder {
    fn default() -> Self {
        Self {
            ctx: FetchContext {
                max_output_length: crate::DEFAULT_MAX_OUTPUT_LENGTH,
                max_temp_length: crate::DEFAULT_MAX_OUTPUT_LENGTH,
                max_metadata_size: crate::DEFAULT_MAX_METADATA_SIZE,
                max_recursion_level: 10,
                max_archive_levels: 4,
                max_path_components: 64,
                dont_enter_implicit_archives: false,
                allow_splitfiles: true,
                follow_redirects: true,
                local_request_only: false,
                ignore_store: false,
                return_archives: false,
                ignore_too_many_path_components: false,
                allowed_mime_types: None,
                max_data_blocks_per_segment: 128,
                max_check_blocks_per_segment: 128,
            },
        }
    }
}

impl FetchContextBuilder {
    pub fn max_output_length(mut self, v: u64) -> Self {
        self.ctx.max_output_length = v;
        self
    }

    pub fn max_temp_length(mut self, v: u64) -> Self {
        self.ctx.max_temp_length = v;
        self
    }

    pub fn max_metadata_size(mut self, v: u64) -> Self {
        self.ctx.max_metadata_size = v;
        self
    }

    pub fn max_recursion_level(mut self, v: u32) -> Self {
        self.ctx.max_recursion_level = v;
        self
    }

    pub fn max_archive_levels(mut self, v: u32) -> Self {
        self.ctx.max_archive_levels = v;
        self
    }

    pub fn max_path_components(mut self, v: usize) -> Self {
        self.ctx.max_path_components = v;
        self
    }

    pub fn dont_enter_implicit_archives(mut self, v: bool) -> Self {
        self.ctx.dont_enter_implicit_archives = v;
        self
    }

    pub fn allow_splitfiles(mut self, v: bool) -> Self {
        self.ctx.allow_splitfiles = v;
        self
    }

    pub fn follow_redirects(mut self, v: bool) -> Self {
        self.ctx.follow_redirects = v;
        self
    }

    pub fn local_request_only(mut self, v: bool) -> Self {
        self.ctx.local_request_only = v;
        self
    }

    pub fn ignore_store(mut self, v: bool) -> Self {
        self.ctx.ignore_store = v;
        self
    }

    pub fn return_archives(mut self, v: bool) -> Self {
        self.ctx.return_archives = v;
        self
    }

    pub fn ignore_too_many_path_components(mut self, v: bool) -> Self {
        self.ctx.ignore_too_many_path_components = v;
        self
    }

    pub fn allowed_mime_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ctx.allowed_mime_types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    pub fn max_blocks_per_segment(mut self, data: usize, check: usize) -> Self {
        self.ctx.max_data_blocks_per_segment = data;
        self.ctx.max_check_blocks_per_segment = check;
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<FetchContext> {
        let ctx = &self.ctx;
        if ctx.max_output_length == 0 {
            return Err(Error::InvalidContext(
                "max_output_length must be positive".to_string(),
            ));
        }
        if ctx.max_metadata_size == 0 {
            return Err(Error::InvalidContext(
                "max_metadata_size must be positive".to_string(),
            ));
        }
        if ctx.max_temp_length < ctx.max_output_length {
            return Err(Error::InvalidContext(format!(
                "max_temp_length ({}) must be at least max_output_length ({})",
                ctx.max_temp_length, ctx.max_output_length
            )));
        }
        Ok(self.ctx)
    }

    fn build_unchecked(self) -> FetchContext {
        self.ctx
    }
}
