//! A driver that drives nothing.
//!
//! [`DummyDevice`] satisfies the full [`Device`] contract without touching
//! PCI, sysfs or DMA memory: every operation is a no-op and every query
//! returns the neutral value. It exists so applications and tests can
//! exercise the device plumbing on machines without supported hardware.

use std::sync::Arc;

use crate::memory::{MemPool, PacketBuffer};
use crate::{Device, DeviceStats, Result};

/// Name the dummy driver registers itself under.
pub const DRIVER_NAME: &str = "dummy";

/// A device whose operations all succeed and do nothing.
pub struct DummyDevice {
    pci_addr: String,
}

impl DummyDevice {
    /// Creates a dummy for `pci_addr`; the address is recorded verbatim and
    /// never resolved.
    pub fn new(pci_addr: &str) -> DummyDevice {
        DummyDevice {
            pci_addr: pci_addr.to_string(),
        }
    }
}

impl Device for DummyDevice {
    fn driver_name(&self) -> &str {
        DRIVER_NAME
    }

    fn pci_address(&self) -> &str {
        &self.pci_addr
    }

    fn is_supported(&self) -> bool {
        false
    }

    fn allocate(&mut self) -> Result {
        Ok(())
    }

    fn add_rx_pool(&mut self, _queue_id: u16, _pool: Arc<MemPool>) -> Result {
        Ok(())
    }

    fn read_stats(&mut self, _stats: &mut DeviceStats) {}

    fn reset_stats(&mut self) {}

    fn is_promiscuous(&self) -> bool {
        false
    }

    fn enable_promiscuous(&mut self) {}

    fn disable_promiscuous(&mut self) {}

    fn get_link_speed(&self) -> u16 {
        0
    }

    fn get_mac_addr(&self) -> [u8; 6] {
        [0; 6]
    }

    fn set_mac_addr(&mut self, _mac: [u8; 6]) {}

    fn rx_batch(&mut self, _queue_id: u16, _bufs: &mut [PacketBuffer]) -> Result<usize> {
        Ok(0)
    }

    fn tx_batch(&mut self, _queue_id: u16, _bufs: &[PacketBuffer]) -> Result<usize> {
        Ok(0)
    }
}
