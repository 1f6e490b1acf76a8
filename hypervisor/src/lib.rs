//! The abstract hypervisor interface (spec §1, SPEC_FULL §2): a `VmHandle`
//! / `VcpuHandle` trait pair modeling the kernel-provided hardware
//! virtualization facility the VM loop runs against, plus one concrete
//! Linux/KVM-backed implementation gated behind the `kvm` feature.
//! Mirrors the shape of crosvm's `hypervisor` crate (`Vm`/`Vcpu` traits,
//! `VcpuExit`), trimmed to exactly what the 386EX device model needs:
//! memory-slot programming and the IO/MMIO/Hlt/Debug exit surface.

pub mod fake;
#[cfg(feature = "kvm")]
pub mod kvm;

use std::ptr;
use std::slice;

use base::event::Event;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("host syscall failed: {0}")]
    Errno(#[from] base::errno::Error),
    #[error("hypervisor operation unsupported on this backend: {0}")]
    Unsupported(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A guest-physical address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct GuestAddress(pub u64);

/// An anonymous host memory mapping backing one guest memory slot. Owns the
/// mapping for its lifetime; `Drop` unmaps it.
pub struct MemoryMapping {
    addr: *mut u8,
    size: usize,
}

// The mapping is exclusively owned through `MemoryMapping` and never
// aliased outside of it; sharing the raw pointer across threads is safe
// because all access goes through `&mut self` methods.
unsafe impl Send for MemoryMapping {}
unsafe impl Sync for MemoryMapping {}

impl MemoryMapping {
    pub fn new(size: usize) -> Result<MemoryMapping> {
        // Safe because we pass a valid, non-zero length and check the
        // return value for MAP_FAILED before using the pointer.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(Error::Errno(base::errno::Error::last()));
        }
        Ok(MemoryMapping {
            addr: addr as *mut u8,
            size,
        })
    }

    /// Maps `size` bytes of `fd` starting at `offset`, aligned to the host
    /// page size (spec §5 "Resource policy": `mmap` regions are 4 KiB
    /// aligned). Used for the virtual-disk LBA window (SPEC_FULL §6).
    pub fn from_file(fd: std::os::unix::io::RawFd, offset: u64, size: usize) -> Result<MemoryMapping> {
        // Safe because we pass a valid fd, a page-aligned offset (caller's
        // responsibility per spec §5), and check the return value.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                offset as libc::off_t,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(Error::Errno(base::errno::Error::last()));
        }
        Ok(MemoryMapping {
            addr: addr as *mut u8,
            size,
        })
    }

    pub fn host_addr(&self) -> *mut u8 {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        // Safe because the mapping is valid for `size` bytes for the
        // lifetime of `self`.
        unsafe { slice::from_raw_parts(self.addr, self.size) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // Safe because the mapping is valid for `size` bytes for the
        // lifetime of `self`, and `&mut self` proves exclusive access.
        unsafe { slice::from_raw_parts_mut(self.addr, self.size) }
    }
}

impl Drop for MemoryMapping {
    fn drop(&mut self) {
        // Safe because `addr`/`size` describe exactly the mapping created
        // in `new`, and no other reference to it can outlive `self`.
        unsafe {
            libc::munmap(self.addr as *mut libc::c_void, self.size);
        }
    }
}

/// The reason a `VcpuHandle::run` call returned control to user space.
/// Mirrors crosvm's `VcpuExit`, trimmed to the variants the 386EX VM loop
/// (spec §4.9) actually dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuExit {
    IoIn { port: u16, size: u32 },
    IoOut { port: u16, size: u32, data: [u8; 8] },
    MmioRead { address: u64, size: u32 },
    MmioWrite { address: u64, size: u32, data: [u8; 8] },
    Hlt,
    Debug,
    Shutdown,
    InternalError,
}

/// A guest virtual machine: owns the memory-slot table and spawns VCPUs.
/// Only the VCPU thread is permitted to call into the VCPU handles it
/// creates (spec §5).
pub trait VmHandle: Send + Sync {
    /// Installs or replaces the mapping at `slot` so that the `size` bytes
    /// of `mapping` starting at `host_offset` appear at `guest_addr` in
    /// guest-physical address space. `host_offset`/`size` let several slots
    /// share one host allocation at different windows (e.g. the BIOS/DOS
    /// shadow windows into the flash array, spec §6 "flash.bin" layout).
    fn set_memory_region(
        &self,
        slot: u32,
        mapping: &MemoryMapping,
        host_offset: usize,
        size: usize,
        guest_addr: GuestAddress,
        read_only: bool,
    ) -> Result<()>;

    /// Removes the mapping previously installed at `slot`, if any.
    fn remove_memory_region(&self, slot: u32) -> Result<()>;

    fn create_vcpu(&self, id: usize) -> Result<Box<dyn VcpuHandle>>;

    /// Creates the in-kernel interrupt controller backing every GSI line.
    /// Must be called exactly once per VM, before any `register_irqfd` call
    /// (spec §1 "IRQ/PIC surface").
    fn create_irq_chip(&self) -> Result<()>;

    /// Binds `irq_evt` to guest system interrupt `gsi`: signaling it raises
    /// the line. `resample_evt` is signaled by the hypervisor once the guest
    /// has serviced (EOI'd) a level-triggered line, letting the device
    /// re-assert if the condition still holds (spec §4.3 "IRQ edge pair").
    fn register_irqfd(&self, irq_evt: &Event, resample_evt: &Event, gsi: u32) -> Result<()>;
}

/// A single guest virtual CPU.
pub trait VcpuHandle: Send {
    /// Resumes guest execution until the next exit condition.
    fn run(&mut self) -> Result<VcpuExit>;

    /// The guest instruction pointer at the most recent exit, used by the
    /// VM loop's diagnostic single-step disassembly (spec §4.9 "Debug").
    fn instruction_pointer(&self) -> Result<u64>;
}
