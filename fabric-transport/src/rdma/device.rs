//! RDMA protection domain and memory registration
//!
//! The device context comes from the connection manager (`cm_id->verbs`);
//! each endpoint allocates its own protection domain on it.

use log::debug;
use std::sync::Arc;

use super::ffi::*;
use crate::buffer::MemoryRegion;
use crate::{Result, TransportError};

/// Protection domain on a CM-provided device context
pub struct ProtectionDomain {
    pd: *mut ibv_pd,
}

unsafe impl Send for ProtectionDomain {}
unsafe impl Sync for ProtectionDomain {}

impl ProtectionDomain {
    /// Allocate a protection domain
    ///
    /// # Arguments
    /// * `context` - Verbs context of the device the connection resolved to
    pub fn alloc(context: *mut ibv_context) -> Result<Arc<Self>> {
        if context.is_null() {
            return Err(TransportError::Rdma("no device context on cm id".into()));
        }

        let pd = unsafe { ibv_alloc_pd(context) };
        if pd.is_null() {
            return Err(TransportError::ResourceExhausted(
                "failed to allocate protection domain".into(),
            ));
        }

        debug!("Allocated protection domain {:?}", pd);
        Ok(Arc::new(Self { pd }))
    }

    /// Pin `len` bytes at `addr` so the peer can read and write them
    /// through the returned rkey
    pub fn register(self: &Arc<Self>, addr: *mut u8, len: usize) -> Result<RdmaMemoryRegion> {
        let flags = ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
            | ibv_access_flags::IBV_ACCESS_REMOTE_READ
            | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE;

        // SAFETY: addr/len describe a live allocation owned by the caller's
        // RegisteredBuffer, which drops the region before freeing it
        let mr = unsafe { ibv_reg_mr(self.pd, addr.cast(), len, flags.0 as i32) };
        if mr.is_null() {
            return Err(TransportError::Registration(format!(
                "{} byte region at {:p}: {}",
                len,
                addr,
                std::io::Error::last_os_error()
            )));
        }

        let region = RdmaMemoryRegion {
            mr,
            _pd: Arc::clone(self),
        };
        debug!(
            "Registered {} bytes, lkey {:#x} rkey {:#x}",
            len,
            region.lkey(),
            region.rkey()
        );
        Ok(region)
    }

    pub(crate) fn as_ptr(&self) -> *mut ibv_pd {
        self.pd
    }
}

impl Drop for ProtectionDomain {
    fn drop(&mut self) {
        // SAFETY: every region holds an Arc to its domain, so none is left
        unsafe { ibv_dealloc_pd(self.pd) };
    }
}

/// Verbs memory registration; deregistered on drop
pub struct RdmaMemoryRegion {
    mr: *mut ibv_mr,
    // A region must not outlive the domain it was registered in
    _pd: Arc<ProtectionDomain>,
}

unsafe impl Send for RdmaMemoryRegion {}

impl RdmaMemoryRegion {
    fn raw(&self) -> &ibv_mr {
        // SAFETY: mr is non-null and valid until Drop
        unsafe { &*self.mr }
    }
}

impl MemoryRegion for RdmaMemoryRegion {
    fn lkey(&self) -> u32 {
        self.raw().lkey
    }

    fn rkey(&self) -> u32 {
        self.raw().rkey
    }

    fn addr(&self) -> *mut u8 {
        self.raw().addr.cast()
    }

    fn length(&self) -> usize {
        self.raw().length
    }
}

impl Drop for RdmaMemoryRegion {
    fn drop(&mut self) {
        // SAFETY: registered in ProtectionDomain::register, released once
        unsafe { ibv_dereg_mr(self.mr) };
    }
}
