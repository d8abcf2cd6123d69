//! Code metadata and frame-metadata resolution.
//!
//! Every installed code blob has a constant total frame size, a
//! [`FrameKind`], and a sorted table of call sites. Each call site names the
//! reference map that describes the frame while the call is in progress.
//! Code compiled together forms a [`CodeImage`] whose blobs share one
//! reference-map encoding, so all frames of a capture agree on the encoding.
//!
//! # Example
//!
//! ```ignore
//! use prism_continuation::{CodeImageBuilder, CodeInfoTable, FrameKind};
//!
//! let mut builder = CodeImageBuilder::new();
//! builder.add_code(0x4000, 0x100, 64, FrameKind::Regular, &[(0x10, 0b0011)]);
//! builder.add_code(0x5000, 0x80, 32, FrameKind::Regular, &[(0x08, 0)]);
//!
//! let table = CodeInfoTable::new(Arc::new(ReferenceMapRegistry::new()));
//! table.install_image(builder.finish());
//!
//! let meta = table.resolve(CodeInfoId(0x4000), 0x4014);
//! assert_eq!(meta.frame_size, 64);
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use prism_gc::{
    NO_REFERENCE_MAP, ReferenceMapEncoder, ReferenceMapEncoding, ReferenceMapHandle,
    ReferenceMapRegistry, guarantee,
};

use crate::walker::{CodeInfoId, FrameKind};

// =============================================================================
// CallSite
// =============================================================================

/// A call site inside a code blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite {
    /// Offset of the return address from the code start.
    pub code_offset: u32,
    /// Reference map in effect while the call is in progress.
    pub reference_map_index: i32,
}

// =============================================================================
// CodeInfo
// =============================================================================

/// Metadata for one installed code blob.
#[derive(Debug, Clone)]
pub struct CodeInfo {
    /// Start address of the code.
    pub code_start: usize,
    /// Size of the code in bytes.
    pub code_size: u32,
    /// Total frame size of every activation of this code.
    pub frame_size: u32,
    /// Role of the code.
    pub kind: FrameKind,
    /// Reference maps shared by the code image.
    reference_maps: Arc<ReferenceMapEncoding>,
    /// Call sites sorted by code offset.
    call_sites: Box<[CallSite]>,
}

impl CodeInfo {
    /// Create metadata for a code blob.
    pub fn new(
        code_start: usize,
        code_size: u32,
        frame_size: u32,
        kind: FrameKind,
        reference_maps: Arc<ReferenceMapEncoding>,
        mut call_sites: Vec<CallSite>,
    ) -> Self {
        // Sort by code offset for binary search
        call_sites.sort_by_key(|site| site.code_offset);

        Self {
            code_start,
            code_size,
            frame_size,
            kind,
            reference_maps,
            call_sites: call_sites.into_boxed_slice(),
        }
    }

    /// Metadata handle of this code.
    #[inline]
    pub fn id(&self) -> CodeInfoId {
        CodeInfoId(self.code_start)
    }

    /// Check if an address falls within this code.
    #[inline]
    pub fn contains_address(&self, addr: usize) -> bool {
        addr >= self.code_start && addr < self.code_end()
    }

    /// Get the code end address.
    #[inline]
    pub fn code_end(&self) -> usize {
        self.code_start + self.code_size as usize
    }

    /// Handle of the shared reference-map encoding.
    #[inline]
    pub fn reference_map_encoding(&self) -> ReferenceMapHandle {
        self.reference_maps.handle()
    }

    /// The shared reference-map encoding.
    #[inline]
    pub fn reference_maps(&self) -> &Arc<ReferenceMapEncoding> {
        &self.reference_maps
    }

    /// Call sites sorted by code offset.
    #[inline]
    pub fn call_sites(&self) -> &[CallSite] {
        &self.call_sites
    }

    /// Reference-map index for a return address inside this code.
    ///
    /// Uses the call site at or immediately before the address. An address
    /// before the first call site has no live references.
    pub fn reference_map_index_at(&self, ip: usize) -> i32 {
        if !self.contains_address(ip) {
            return NO_REFERENCE_MAP;
        }
        let offset = (ip - self.code_start) as u32;

        // Binary search for exact match or predecessor
        match self
            .call_sites
            .binary_search_by_key(&offset, |site| site.code_offset)
        {
            Ok(idx) => self.call_sites[idx].reference_map_index,
            Err(0) => NO_REFERENCE_MAP,
            Err(idx) => self.call_sites[idx - 1].reference_map_index,
        }
    }
}

// =============================================================================
// CodeImageBuilder
// =============================================================================

/// Code blobs compiled together, sharing one reference-map encoding.
#[derive(Debug, Clone)]
pub struct CodeImage {
    /// The shared encoding.
    pub reference_maps: Arc<ReferenceMapEncoding>,
    /// Metadata of every blob in the image.
    pub code: Vec<CodeInfo>,
}

struct PendingCode {
    code_start: usize,
    code_size: u32,
    frame_size: u32,
    kind: FrameKind,
    call_sites: Vec<CallSite>,
}

/// Builder for a [`CodeImage`].
#[derive(Default)]
pub struct CodeImageBuilder {
    encoder: ReferenceMapEncoder,
    pending: Vec<PendingCode>,
}

impl CodeImageBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a code blob with `(code offset, slot bitmap)` call sites.
    pub fn add_code(
        &mut self,
        code_start: usize,
        code_size: u32,
        frame_size: u32,
        kind: FrameKind,
        call_sites: &[(u32, u64)],
    ) -> CodeInfoId {
        let call_sites = call_sites
            .iter()
            .map(|&(code_offset, bitmap)| CallSite {
                code_offset,
                reference_map_index: self.encoder.add(bitmap),
            })
            .collect();
        self.pending.push(PendingCode {
            code_start,
            code_size,
            frame_size,
            kind,
            call_sites,
        });
        CodeInfoId(code_start)
    }

    /// Number of blobs added so far.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Check if no blobs were added.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Build the image.
    pub fn finish(self) -> CodeImage {
        let reference_maps = self.encoder.finish();
        let code = self
            .pending
            .into_iter()
            .map(|p| {
                CodeInfo::new(
                    p.code_start,
                    p.code_size,
                    p.frame_size,
                    p.kind,
                    Arc::clone(&reference_maps),
                    p.call_sites,
                )
            })
            .collect();
        CodeImage {
            reference_maps,
            code,
        }
    }
}

// =============================================================================
// FrameMetadataResolver
// =============================================================================

/// Size and reference map of one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMetadata {
    /// Total frame size in bytes.
    pub frame_size: u32,
    /// Handle of the reference-map encoding of the frame's code.
    pub reference_map_encoding: ReferenceMapHandle,
    /// Reference-map index at the frame's return address.
    pub reference_map_index: i32,
}

/// Resolves frame metadata from a code handle and return address.
pub trait FrameMetadataResolver {
    /// Resolve the metadata of the frame running `code` at `ip`.
    fn resolve(&self, code: CodeInfoId, ip: usize) -> FrameMetadata;
}

// =============================================================================
// CodeInfoTable
// =============================================================================

/// Table of installed code.
///
/// Uses a sorted BTreeMap for O(log n) lookup by code address. Encodings of
/// installed code are registered with the shared [`ReferenceMapRegistry`],
/// which the collector uses to decode stored continuations, and unregistered
/// once no installed blob uses them.
#[derive(Debug)]
pub struct CodeInfoTable {
    code: RwLock<InstalledCode>,
    /// Decoder registry for installed encodings.
    reference_maps: Arc<ReferenceMapRegistry>,
}

#[derive(Debug, Default)]
struct InstalledCode {
    /// Maps code start address → metadata.
    by_start: BTreeMap<usize, Arc<CodeInfo>>,
    /// Number of installed blobs using each encoding.
    encoding_users: FxHashMap<ReferenceMapHandle, usize>,
}

impl CodeInfoTable {
    /// Create an empty table registering encodings with `reference_maps`.
    pub fn new(reference_maps: Arc<ReferenceMapRegistry>) -> Self {
        Self {
            code: RwLock::new(InstalledCode::default()),
            reference_maps,
        }
    }

    /// Install one code blob, replacing any blob at the same address.
    pub fn install(&self, info: CodeInfo) -> CodeInfoId {
        let id = info.id();
        let mut code = self.code.write();
        self.insert(&mut code, info);
        log::trace!("installed code at {:#x}", id.0);
        id
    }

    /// Install every blob of an image.
    pub fn install_image(&self, image: CodeImage) {
        let mut code = self.code.write();
        for info in image.code {
            self.insert(&mut code, info);
        }
        log::trace!(
            "installed image with encoding {:#x}",
            image.reference_maps.handle().raw()
        );
    }

    /// Remove a code blob.
    pub fn remove(&self, id: CodeInfoId) -> Option<Arc<CodeInfo>> {
        let mut code = self.code.write();
        let removed = code.by_start.remove(&id.0)?;
        self.release_encoding(&mut code, removed.reference_map_encoding());
        Some(removed)
    }

    fn insert(&self, code: &mut InstalledCode, info: CodeInfo) {
        let handle = info.reference_map_encoding();
        let users = code.encoding_users.entry(handle).or_insert(0);
        if *users == 0 {
            self.reference_maps.register(info.reference_maps());
        }
        *users += 1;

        if let Some(replaced) = code.by_start.insert(info.code_start, Arc::new(info)) {
            self.release_encoding(code, replaced.reference_map_encoding());
        }
    }

    fn release_encoding(&self, code: &mut InstalledCode, handle: ReferenceMapHandle) {
        let Some(users) = code.encoding_users.get_mut(&handle) else {
            return;
        };
        *users -= 1;
        if *users == 0 {
            code.encoding_users.remove(&handle);
            self.reference_maps.unregister(handle);
            log::trace!("unregistered encoding {:#x}", handle.raw());
        }
    }

    /// Lookup the code containing an address.
    pub fn lookup(&self, addr: usize) -> Option<Arc<CodeInfo>> {
        let code = self.code.read();

        // Find the entry with the largest key <= addr
        code.by_start
            .range(..=addr)
            .next_back()
            .filter(|(_, info)| info.contains_address(addr))
            .map(|(_, info)| Arc::clone(info))
    }

    /// Get code metadata by handle.
    pub fn get(&self, id: CodeInfoId) -> Option<Arc<CodeInfo>> {
        self.code.read().by_start.get(&id.0).cloned()
    }

    /// The decoder registry shared with the collector.
    pub fn reference_maps(&self) -> &Arc<ReferenceMapRegistry> {
        &self.reference_maps
    }

    /// Get the number of installed blobs.
    pub fn len(&self) -> usize {
        self.code.read().by_start.len()
    }

    /// Check if no code is installed.
    pub fn is_empty(&self) -> bool {
        self.code.read().by_start.is_empty()
    }
}

impl FrameMetadataResolver for CodeInfoTable {
    fn resolve(&self, code: CodeInfoId, ip: usize) -> FrameMetadata {
        let Some(info) = self.get(code) else {
            guarantee::fail(format_args!("unknown code {:#x}", code.0))
        };
        guarantee!(
            info.contains_address(ip),
            "return address {:#x} outside code {:#x}..{:#x}",
            ip,
            info.code_start,
            info.code_end()
        );

        FrameMetadata {
            frame_size: info.frame_size,
            reference_map_encoding: info.reference_map_encoding(),
            reference_map_index: info.reference_map_index_at(ip),
        }
    }
}
