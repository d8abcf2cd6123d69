//! GC-managed object references.
//!
//! `ObjectRef` is an untyped pointer to the start of a heap object. Every
//! object starts with an 8-byte hub word that identifies its kind; the rest
//! of the layout belongs to that kind.

use std::ptr::NonNull;

/// Size of the hub word at the start of every object.
pub const HUB_SIZE: usize = 8;

/// Type word stored at offset 0 of every heap object.
///
/// The collector uses the hub to decide how to interpret the bytes that
/// follow it. A zero hub marks memory that has not been claimed by any kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ObjectHub(u64);

impl ObjectHub {
    /// Hub of memory that has not been initialized as any object kind.
    pub const UNINITIALIZED: ObjectHub = ObjectHub(0);

    /// Hub of a stored continuation (`b"PRSMCONT"`).
    pub const STORED_CONTINUATION: ObjectHub = ObjectHub(u64::from_le_bytes(*b"PRSMCONT"));

    /// Create a hub from its raw word.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw hub word.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// A reference to a GC-managed object.
///
/// ObjectRef is just an address: it does NOT keep the object alive. The
/// owner of the object (for example a `Continuation`) is responsible for
/// keeping it reachable or releasing it.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    /// Pointer to the first byte of the object (its hub word).
    ptr: NonNull<u8>,
}

impl ObjectRef {
    /// Create a new ObjectRef from a raw pointer.
    ///
    /// # Safety
    ///
    /// The pointer must be non-null, 8-byte aligned and point to a live heap
    /// object whose first word is its hub.
    #[inline]
    pub unsafe fn from_raw(ptr: *mut u8) -> Self {
        Self {
            // SAFETY: the caller guarantees the pointer is non-null.
            ptr: unsafe { NonNull::new_unchecked(ptr) },
        }
    }

    /// Create an ObjectRef from NonNull.
    ///
    /// # Safety
    ///
    /// Same requirements as [`ObjectRef::from_raw`].
    #[inline]
    pub unsafe fn from_non_null(ptr: NonNull<u8>) -> Self {
        Self { ptr }
    }

    /// Get the raw pointer.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Get the object's address.
    #[inline]
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Read the object's hub word.
    #[inline]
    pub fn hub(&self) -> ObjectHub {
        // SAFETY: construction requires an aligned, live object with a hub word.
        ObjectHub(unsafe { self.ptr.as_ptr().cast::<u64>().read() })
    }

    /// Write the object's hub word.
    ///
    /// # Safety
    ///
    /// Only the allocator may claim an object for a kind, before the object
    /// is visible to anyone else.
    #[inline]
    pub(crate) unsafe fn set_hub(&self, hub: ObjectHub) {
        // SAFETY: see the function contract.
        unsafe { self.ptr.as_ptr().cast::<u64>().write(hub.0) }
    }
}

impl std::fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjectRef({:#x})", self.addr())
    }
}

// Safety: ObjectRef is only an address. Synchronizing access to the object's
// contents is the responsibility of the object kind (stored continuations
// publish their contents with release/acquire ordering).
unsafe impl Send for ObjectRef {}
unsafe impl Sync for ObjectRef {}
