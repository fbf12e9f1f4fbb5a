//! User memory access seam
//!
//! The dispatcher never dereferences user pointers itself. Every kernel
//! entry receives raw address/length pairs and routes them through the
//! memory-management collaborator behind the `UserMem` trait, which
//! validates the range against the owning process's address space before
//! copying (the verify-and-copy contract). A range that is not mapped
//! with the required permissions fails with `BadAddress`; no bytes move.
//!
//! `FlatMem` is a hosted implementation backed by one flat byte array per
//! process. It exists for unit tests and for embedding the dispatcher in
//! simulators; a real port implements `UserMem` over its page tables.

use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};
use crate::pcb::Pid;

/// Verify-and-copy contract with the memory-management collaborator
///
/// Addresses are in the target process's address space. Implementations
/// must validate the entire range before copying any byte.
pub trait UserMem {
    /// Copy `len` bytes out of `pid`'s address space starting at `addr`
    fn copy_in(&mut self, pid: Pid, addr: u64, len: usize) -> KernelResult<Vec<u8>>;

    /// Copy `bytes` into `pid`'s address space starting at `addr`
    fn copy_out(&mut self, pid: Pid, addr: u64, bytes: &[u8]) -> KernelResult<()>;
}

/// Flat per-process memory for hosted use
///
/// Each process sees a single zero-based region of fixed size. Accesses
/// outside the region fail validation exactly like an unmapped page.
pub struct FlatMem {
    /// Region size given to every process
    region_size: usize,
    /// Backing storage, indexed by PCB slot
    regions: Vec<Vec<u8>>,
}

impl FlatMem {
    /// Create flat memory with `region_size` bytes per process slot
    pub fn new(slots: usize, region_size: usize) -> Self {
        let mut regions = Vec::with_capacity(slots);
        for _ in 0..slots {
            regions.push(alloc::vec![0u8; region_size]);
        }
        Self {
            region_size,
            regions,
        }
    }

    fn range_ok(&self, addr: u64, len: usize) -> bool {
        // Overflow check first, then bounds
        match addr.checked_add(len as u64) {
            Some(end) => end <= self.region_size as u64,
            None => false,
        }
    }

    fn region_mut(&mut self, pid: Pid) -> KernelResult<&mut Vec<u8>> {
        self.regions
            .get_mut(pid.slot())
            .ok_or(KernelError::BadAddress)
    }
}

impl UserMem for FlatMem {
    fn copy_in(&mut self, pid: Pid, addr: u64, len: usize) -> KernelResult<Vec<u8>> {
        if !self.range_ok(addr, len) {
            return Err(KernelError::BadAddress);
        }
        let region = self.region_mut(pid)?;
        let start = addr as usize;
        Ok(region[start..start + len].to_vec())
    }

    fn copy_out(&mut self, pid: Pid, addr: u64, bytes: &[u8]) -> KernelResult<()> {
        if !self.range_ok(addr, bytes.len()) {
            return Err(KernelError::BadAddress);
        }
        let region = self.region_mut(pid)?;
        let start = addr as usize;
        region[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}
