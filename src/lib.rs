//! # ixgbe-userspace
//!
//! A userspace driver for the Intel 82599 family of 10 Gigabit Ethernet
//! NICs. The kernel network stack is bypassed entirely: the driver unbinds
//! the kernel driver over sysfs, maps the device's BAR0 register window
//! into the process, pins hugepage-backed DMA memory and exchanges packet
//! buffers with the NIC through in-memory descriptor rings.
//!
//! ## Features
//!
//! - Strictly poll-mode, no interrupts; data-path calls are wait-free
//! - Batched receive and transmit over per-queue descriptor rings
//! - LIFO memory pools of fixed-size DMA packet buffers
//! - A driver registry so tests can swap in the no-op [`DummyDevice`]
//!
//! ## Basic Usage
//!
//! ```rust,ignore
//! use ixgbe_userspace::{get_device, MemPool, PacketBuffer, LinuxOs};
//!
//! let mut dev = get_device("0000:01:00.0", "ixgbe-ixy")?;
//! let pool = MemPool::allocate_with::<LinuxOs>(2048, 2048)?;
//! dev.add_rx_pool(0, pool.clone())?;
//!
//! let mut bufs = vec![PacketBuffer::empty(); 32];
//! loop {
//!     let n = dev.rx_batch(0, &mut bufs)?;
//!     let sent = dev.tx_batch(0, &bufs[..n])?;
//!     for buf in bufs.iter().skip(sent).take(n - sent) {
//!         pool.push(buf.clone());
//!     }
//! }
//! ```
//!
//! ## Privileges
//!
//! Real hardware needs root (or `CAP_SYS_ADMIN`): unbinding the kernel
//! driver, reading physical addresses from `/proc/self/pagemap` and mapping
//! hugepages are all privileged. The [`DummyDevice`] and the whole test
//! suite run unprivileged.
//!
//! ## Threading
//!
//! A device is not internally synchronized. Each queue, with its ring,
//! shadow buffers and memory pool, must be driven by one thread at a
//! time; different queues of one device may run on different threads.

#![warn(missing_docs)]

#[macro_use]
extern crate log;

pub mod constants;
pub mod descriptor;
pub mod dummy;
pub mod hal;
pub mod ixgbe;
pub mod memory;
pub mod pci;
pub mod registry;

use std::sync::Arc;

pub use dummy::DummyDevice;
pub use hal::{DmaChunk, LinuxOs, OsMem};
pub use ixgbe::IxgbeDevice;
pub use memory::{MemPool, PacketBuffer, Prefetch, DATA_OFFSET};
pub use registry::{get_device, register_driver};

/// Errors of the driver core.
///
/// Initialization problems abort the device open; data-path anomalies are
/// never errors; they show up as reduced batch counts and per-device
/// counters instead.
#[derive(Debug)]
pub enum Error {
    /// The operation needs root or `CAP_SYS_ADMIN`.
    NotPrivileged,
    /// No PCI device exists at the given address.
    DeviceNotFound(String),
    /// No driver factory is registered under the given name.
    UnknownDriver(String),
    /// The PCI device is not a NIC this driver knows how to program.
    UnsupportedDevice {
        /// Vendor id read from config space.
        vendor_id: u16,
        /// Device id read from config space.
        device_id: u16,
    },
    /// A register poll during initialization expired.
    InitTimeout {
        /// BAR0 offset of the polled register.
        register: u32,
        /// The bit mask that never reached the expected state.
        mask: u32,
    },
    /// No hugepages are available (not reserved, or hugetlbfs not mounted).
    HugepagesExhausted,
    /// A physically contiguous allocation was requested but cannot be
    /// satisfied (it exceeds one hugepage).
    AllocationNotContiguous,
    /// A memory pool has no free buffers left.
    PoolExhausted,
    /// The RX queue has no associated memory pool to refill from.
    QueueWithoutPool(u16),
    /// The queue id does not exist on this device.
    InvalidQueue(u16),
    /// An OS error that is neither a missing device nor a privilege issue.
    Io(std::io::Error),
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::NotPrivileged => write!(f, "operation requires root or CAP_SYS_ADMIN"),
            Error::DeviceNotFound(addr) => write!(f, "no PCI device at {addr}"),
            Error::UnknownDriver(name) => write!(f, "no driver registered under {name:?}"),
            Error::UnsupportedDevice {
                vendor_id,
                device_id,
            } => write!(f, "unsupported device {vendor_id:04x}:{device_id:04x}"),
            Error::InitTimeout { register, mask } => write!(
                f,
                "timed out waiting on register {register:#x}, mask {mask:#x}"
            ),
            Error::HugepagesExhausted => write!(f, "out of hugepages"),
            Error::AllocationNotContiguous => {
                write!(f, "allocation too large to be physically contiguous")
            }
            Error::PoolExhausted => write!(f, "memory pool has no free buffers"),
            Error::QueueWithoutPool(queue) => {
                write!(f, "rx queue {queue} has no memory pool attached")
            }
            Error::InvalidQueue(queue) => write!(f, "queue {queue} does not exist"),
            Error::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

/// Result type of the driver core.
pub type Result<T = ()> = core::result::Result<T, Error>;

/// The capability set every network device of this crate offers.
///
/// Two implementations exist: [`IxgbeDevice`] programs real 82599 hardware
/// and [`DummyDevice`] no-ops everything. Devices come out of
/// [`get_device`]; the hot-path methods forward to monomorphic inherent
/// implementations so register access inlines per device type.
pub trait Device {
    /// Name of the driver behind this device (e.g. `"ixgbe-ixy"`).
    fn driver_name(&self) -> &str;

    /// PCI address this device was opened with.
    fn pci_address(&self) -> &str;

    /// Whether this device is real, programmable hardware. The dummy
    /// driver returns `false`.
    fn is_supported(&self) -> bool;

    /// Secondary initialization: runs the full reset/init sequence and
    /// leaves the device running. A no-op when already running.
    fn allocate(&mut self) -> Result;

    /// Attaches a memory pool to an RX queue, arming the queue's whole
    /// descriptor ring from it. Each RX queue needs exactly one pool
    /// before it can receive.
    fn add_rx_pool(&mut self, queue_id: u16, pool: Arc<MemPool>) -> Result;

    /// Accumulates the hardware packet/byte counters into `stats`. The
    /// hardware registers clear on read.
    fn read_stats(&mut self, stats: &mut DeviceStats);

    /// Clears the hardware statistics counters.
    fn reset_stats(&mut self);

    /// Whether unicast and multicast promiscuous mode are both on.
    fn is_promiscuous(&self) -> bool;

    /// Accepts all frames regardless of destination MAC.
    fn enable_promiscuous(&mut self);

    /// Restores destination-MAC filtering.
    fn disable_promiscuous(&mut self);

    /// Current link speed in Mbit/s, 0 when the link is down.
    fn get_link_speed(&self) -> u16;

    /// The MAC address of this device.
    fn get_mac_addr(&self) -> [u8; 6];

    /// Overrides the MAC address of this device.
    fn set_mac_addr(&mut self, mac: [u8; 6]);

    /// Receives up to `bufs.len()` packets from `queue_id`, writing the
    /// filled buffers into `bufs` front to back.
    ///
    /// Returns how many buffers were produced; ownership of those moves to
    /// the caller, who eventually returns them via
    /// [`tx_batch`](Device::tx_batch) or [`MemPool::push`]. Returns fewer
    /// than requested when the ring has nothing more or the pool starves;
    /// never blocks.
    fn rx_batch(&mut self, queue_id: u16, bufs: &mut [PacketBuffer]) -> Result<usize>;

    /// Posts up to `bufs.len()` packets on `queue_id`.
    ///
    /// Returns how many were posted; those buffers now belong to the
    /// driver and return to their pool once the NIC completes them.
    /// Returns fewer than requested when the ring is full; never blocks.
    fn tx_batch(&mut self, queue_id: u16, bufs: &[PacketBuffer]) -> Result<usize>;
}

/// Packet and byte counters of a device.
///
/// Values accumulate across [`Device::read_stats`] calls; the struct is
/// plain data so callers can diff snapshots for rates.
#[derive(Default, Copy, Clone)]
pub struct DeviceStats {
    /// Number of received packets.
    pub rx_pkts: u64,
    /// Number of transmitted packets.
    pub tx_pkts: u64,
    /// Number of received bytes.
    pub rx_bytes: u64,
    /// Number of transmitted bytes.
    pub tx_bytes: u64,
}

impl core::fmt::Display for DeviceStats {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "rx_pkts: {}, tx_pkts: {}, rx_bytes: {}, tx_bytes: {}",
            self.rx_pkts, self.tx_pkts, self.rx_bytes, self.tx_bytes
        )
    }
}
