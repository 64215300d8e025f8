//! The driver registry: driver names mapped to device factories.
//!
//! [`get_device`] is the front door of the crate. The table is seeded with
//! the real ixgbe driver and the [`dummy`](crate::dummy) driver on first
//! use; tests and applications may [`register_driver`] additional factories
//! before opening devices.

use std::collections::BTreeMap;
use std::sync::{Mutex, OnceLock};

use crate::constants::DEFAULT_RING_SIZE;
use crate::dummy::{self, DummyDevice};
use crate::hal::LinuxOs;
use crate::ixgbe::{self, IxgbeDevice};
use crate::pci::PciDevice;
use crate::{Device, Error, Result};

/// Builds a device for a PCI address. Factories run the whole open path,
/// so the returned device is ready for pools and batches.
pub type DriverFactory = fn(&str) -> Result<Box<dyn Device>>;

fn drivers() -> &'static Mutex<BTreeMap<String, DriverFactory>> {
    static DRIVERS: OnceLock<Mutex<BTreeMap<String, DriverFactory>>> = OnceLock::new();
    DRIVERS.get_or_init(|| {
        let mut map = BTreeMap::new();
        map.insert(ixgbe::DRIVER_NAME.to_string(), ixgbe_factory as DriverFactory);
        map.insert(dummy::DRIVER_NAME.to_string(), dummy_factory as DriverFactory);
        Mutex::new(map)
    })
}

/// Registers (or replaces) a driver factory under `name`.
pub fn register_driver(name: &str, factory: DriverFactory) {
    let previous = drivers().lock().unwrap().insert(name.to_string(), factory);
    if previous.is_some() {
        warn!("driver factory {name} was replaced");
    }
}

/// Opens `pci_addr` with the driver registered under `driver`.
pub fn get_device(pci_addr: &str, driver: &str) -> Result<Box<dyn Device>> {
    let factory = drivers().lock().unwrap().get(driver).copied();
    match factory {
        Some(factory) => factory(pci_addr),
        None => Err(Error::UnknownDriver(driver.to_string())),
    }
}

fn ixgbe_factory(pci_addr: &str) -> Result<Box<dyn Device>> {
    let pci = PciDevice::open(pci_addr)?;
    let mut device = IxgbeDevice::<LinuxOs, DEFAULT_RING_SIZE>::with_pci(pci, 1, 1)?;
    device.allocate()?;
    Ok(Box::new(device))
}

fn dummy_factory(pci_addr: &str) -> Result<Box<dyn Device>> {
    Ok(Box::new(DummyDevice::new(pci_addr)))
}
