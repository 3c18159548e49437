//! Registered memory
//!
//! A [`RegisteredBuffer`] owns both its page-aligned allocation and the
//! transport registration covering it. Dropping the buffer deregisters the
//! region and then frees the memory, exactly once, so raw buffer/key pairs
//! never escape their owning connection.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fmt;
use std::ptr::NonNull;

use crate::{Result, TransportError, PAGE_SIZE};

/// Memory region handle for RMA transfers
pub trait MemoryRegion: Send {
    /// Local key (used in our own scatter-gather entries)
    fn lkey(&self) -> u32;

    /// Remote key (embedded in keyed SGL descriptors sent to peers)
    fn rkey(&self) -> u32;

    /// Base address of the registered range
    fn addr(&self) -> *mut u8;

    /// Length of the registered range in bytes
    fn length(&self) -> usize;
}

/// Zeroed, page-aligned heap allocation
pub struct AlignedBuf {
    ptr: NonNull<u8>,
    layout: Layout,
}

// The allocation is uniquely owned; access goes through &self / &mut self.
unsafe impl Send for AlignedBuf {}
unsafe impl Sync for AlignedBuf {}

impl AlignedBuf {
    pub fn zeroed(len: usize) -> Result<Self> {
        if len == 0 {
            return Err(TransportError::ResourceExhausted(
                "zero-length buffer requested".into(),
            ));
        }

        let layout = Layout::from_size_align(len, PAGE_SIZE)
            .map_err(|e| TransportError::ResourceExhausted(e.to_string()))?;

        // SAFETY: layout has a non-zero size
        let ptr = unsafe { alloc_zeroed(layout) };

        NonNull::new(ptr)
            .map(|ptr| Self { ptr, layout })
            .ok_or_else(|| {
                TransportError::ResourceExhausted(format!("allocation of {} bytes failed", len))
            })
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for layout.size() initialised bytes
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self guarantees exclusivity
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        // SAFETY: allocated in `zeroed` with this exact layout
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// Peer memory named by a keyed SGL descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteBuffer {
    pub addr: u64,
    pub len: usize,
    pub key: u32,
}

/// Page-aligned buffer plus the registration that makes it RMA-capable
pub struct RegisteredBuffer {
    // Field order matters: the registration is dropped before the memory.
    region: Box<dyn MemoryRegion>,
    mem: AlignedBuf,
}

impl RegisteredBuffer {
    /// Allocate `len` zeroed bytes and register them with `register`
    ///
    /// # Arguments
    /// * `len` - Size of the buffer in bytes
    /// * `register` - Transport-specific registration of (addr, len)
    pub fn allocate<F>(len: usize, register: F) -> Result<Self>
    where
        F: FnOnce(*mut u8, usize) -> Result<Box<dyn MemoryRegion>>,
    {
        let mem = AlignedBuf::zeroed(len)?;
        let region = register(mem.as_ptr(), mem.len())?;
        Ok(Self { region, mem })
    }

    pub fn lkey(&self) -> u32 {
        self.region.lkey()
    }

    pub fn rkey(&self) -> u32 {
        self.region.rkey()
    }

    /// Address peers use in RMA requests against this buffer
    pub fn addr(&self) -> u64 {
        self.mem.as_ptr() as u64
    }

    pub fn len(&self) -> usize {
        self.mem.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mem.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        self.mem.as_slice()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.mem.as_mut_slice()
    }

    pub fn clear(&mut self) {
        self.mem.as_mut_slice().fill(0);
    }

    /// Descriptor for the first `len` bytes, for embedding in a command
    pub fn remote(&self, len: usize) -> Result<RemoteBuffer> {
        if len > self.len() {
            return Err(TransportError::ResourceExhausted(format!(
                "descriptor of {} bytes exceeds {} byte buffer",
                len,
                self.len()
            )));
        }
        Ok(RemoteBuffer {
            addr: self.addr(),
            len,
            key: self.rkey(),
        })
    }
}

impl fmt::Debug for RegisteredBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredBuffer")
            .field("addr", &format_args!("0x{:x}", self.addr()))
            .field("len", &self.len())
            .field("rkey", &format_args!("0x{:x}", self.rkey()))
            .finish()
    }
}
