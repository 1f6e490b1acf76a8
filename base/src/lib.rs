// Host-facility wrappers shared by the device model and the VM loop.
//
// This crate plays the same role as crosvm's `base`: it keeps raw libc and
// file-descriptor plumbing out of `devices` and `hypervisor`, which only see
// a small set of safe, descriptor-stable types.

pub mod descriptor;
pub mod errno;
pub mod event;
pub mod signal;
pub mod syslog;
pub mod timer;
pub mod wait_context;

pub use descriptor::AsRawDescriptor;
pub use descriptor::FromRawDescriptor;
pub use descriptor::RawDescriptor;
pub use descriptor::SafeDescriptor;
pub use errno::errno_result;
pub use errno::Error;
pub use errno::Result;
pub use event::Event;
pub use timer::Timer;
pub use wait_context::EventToken;
pub use wait_context::EventType;
pub use wait_context::TriggeredEvent;
pub use wait_context::WaitContext;

pub use log::debug;
pub use log::error;
pub use log::info;
pub use log::warn;
