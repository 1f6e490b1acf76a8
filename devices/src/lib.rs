//! The 386EX device model: the address-range map, the event reactor, and
//! every simulated peripheral the BIOS/DOS firmware image expects to find.
//! Mirrors the shape of crosvm's `devices` crate — one module per device,
//! a shared `PioDevice` trait at the dispatch seam, and a `Bus` type that
//! owns the routing table.

pub mod a20;
pub mod bus;
pub mod chipselect;
pub mod cmos;
pub mod error;
pub mod flash;
pub mod misc;
pub mod pio;
pub mod pit;
pub mod prescaler;
pub mod reactor;
pub mod serial;
pub mod virtual_disk;

pub use bus::AddressRange;
pub use bus::Bus;
pub use error::DeviceError;
pub use error::Result;
pub use pio::IoSize;
pub use pio::PioDevice;
