//! The Linux/KVM-backed implementation of `VmHandle`/`VcpuHandle`, gated
//! behind the `kvm` feature. Grounded on crosvm's `hypervisor::kvm` split
//! (the real device is a thin layer over `/dev/kvm` ioctls); built here on
//! the `kvm-ioctls`/`kvm-bindings` crates (the rust-vmm project's public
//! equivalents of crosvm's internal `kvm_sys`, which isn't a standalone
//! fetchable crate) rather than hand-rolled ioctl numbers.

use std::mem::ManuallyDrop;
use std::os::unix::io::AsRawFd;
use std::os::unix::io::FromRawFd;

use kvm_bindings::kvm_userspace_memory_region;
use kvm_ioctls::Kvm;
use kvm_ioctls::VcpuExit as KvmRawExit;
use kvm_ioctls::VcpuFd;
use kvm_ioctls::VmFd;
use vmm_sys_util::eventfd::EventFd as VmmEventFd;

use base::event::Event;

use crate::Error;
use crate::GuestAddress;
use crate::MemoryMapping;
use crate::Result;
use crate::VcpuExit;
use crate::VcpuHandle;
use crate::VmHandle;

pub struct KvmVm {
    vm_fd: VmFd,
}

impl KvmVm {
    pub fn new() -> Result<KvmVm> {
        let kvm = Kvm::new().map_err(kvm_err)?;
        let vm_fd = kvm.create_vm().map_err(kvm_err)?;
        Ok(KvmVm { vm_fd })
    }
}

impl VmHandle for KvmVm {
    fn set_memory_region(
        &self,
        slot: u32,
        mapping: &MemoryMapping,
        host_offset: usize,
        size: usize,
        guest_addr: GuestAddress,
        read_only: bool,
    ) -> Result<()> {
        let region = kvm_userspace_memory_region {
            slot,
            guest_phys_addr: guest_addr.0,
            memory_size: size as u64,
            userspace_addr: mapping.host_addr() as u64 + host_offset as u64,
            flags: if read_only { 1 /* KVM_MEM_READONLY */ } else { 0 },
        };
        // Safe because `region` describes a mapping owned by `mapping` for
        // at least the lifetime of this call, as required by the ioctl.
        unsafe { self.vm_fd.set_user_memory_region(region) }.map_err(kvm_err)
    }

    fn remove_memory_region(&self, slot: u32) -> Result<()> {
        let region = kvm_userspace_memory_region {
            slot,
            guest_phys_addr: 0,
            memory_size: 0,
            userspace_addr: 0,
            flags: 0,
        };
        // Safe: a zero-length region deregisters the slot without
        // requiring live host memory behind it.
        unsafe { self.vm_fd.set_user_memory_region(region) }.map_err(kvm_err)
    }

    fn create_vcpu(&self, id: usize) -> Result<Box<dyn VcpuHandle>> {
        let vcpu_fd = self.vm_fd.create_vcpu(id as u64).map_err(kvm_err)?;
        Ok(Box::new(KvmVcpu { vcpu_fd }))
    }

    fn create_irq_chip(&self) -> Result<()> {
        self.vm_fd.create_irq_chip().map_err(kvm_err)
    }

    fn register_irqfd(&self, irq_evt: &Event, resample_evt: &Event, gsi: u32) -> Result<()> {
        // kvm-ioctls's irqfd registration only reads the fd number during
        // the ioctl; these transient `EventFd`s never take ownership of the
        // descriptor, which stays owned by `irq_evt`/`resample_evt`, so we
        // must not let their `Drop` close it.
        let irq_fd = ManuallyDrop::new(unsafe { VmmEventFd::from_raw_fd(irq_evt.as_raw_fd()) });
        let resample_fd = ManuallyDrop::new(unsafe { VmmEventFd::from_raw_fd(resample_evt.as_raw_fd()) });
        self.vm_fd.register_irqfd_with_resample(&irq_fd, &resample_fd, gsi).map_err(kvm_err)
    }
}

pub struct KvmVcpu {
    vcpu_fd: VcpuFd,
}

impl VcpuHandle for KvmVcpu {
    fn run(&mut self) -> Result<VcpuExit> {
        loop {
            match self.vcpu_fd.run() {
                Ok(KvmRawExit::IoIn(port, data)) => {
                    return Ok(VcpuExit::IoIn {
                        port,
                        size: data.len() as u32,
                    })
                }
                Ok(KvmRawExit::IoOut(port, data)) => {
                    let mut buf = [0u8; 8];
                    let len = data.len().min(8);
                    buf[..len].copy_from_slice(&data[..len]);
                    return Ok(VcpuExit::IoOut {
                        port,
                        size: len as u32,
                        data: buf,
                    });
                }
                Ok(KvmRawExit::MmioRead(address, data)) => {
                    return Ok(VcpuExit::MmioRead {
                        address,
                        size: data.len() as u32,
                    })
                }
                Ok(KvmRawExit::MmioWrite(address, data)) => {
                    let mut buf = [0u8; 8];
                    let len = data.len().min(8);
                    buf[..len].copy_from_slice(&data[..len]);
                    return Ok(VcpuExit::MmioWrite {
                        address,
                        size: len as u32,
                        data: buf,
                    });
                }
                Ok(KvmRawExit::Hlt) => return Ok(VcpuExit::Hlt),
                Ok(KvmRawExit::Debug(_)) => return Ok(VcpuExit::Debug),
                Ok(KvmRawExit::Shutdown) => return Ok(VcpuExit::Shutdown),
                Ok(other) => {
                    log::warn!("unhandled kvm exit reason: {:?}", other);
                    return Ok(VcpuExit::InternalError);
                }
                Err(e) if e.errno() == libc::EINTR => continue,
                Err(e) => return Err(kvm_err(e)),
            }
        }
    }

    fn instruction_pointer(&self) -> Result<u64> {
        let regs = self.vcpu_fd.get_regs().map_err(kvm_err)?;
        Ok(regs.rip)
    }
}

fn kvm_err(e: kvm_ioctls::Error) -> Error {
    Error::Errno(base::errno::Error::new(e.errno()))
}
