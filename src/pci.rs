//! PCI device plumbing and MMIO register access.
//!
//! [`PciDevice::open`] walks the sysfs path of a device: it verifies the
//! vendor/device id pair, evicts any bound kernel driver, enables bus
//! mastering in the PCI command word and maps `resource0` (BAR0) into the
//! process. [`Mmio`] is the resulting register window; all register access
//! in the driver funnels through its volatile 32-bit accessors.

use core::ptr::NonNull;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::constants::*;
use crate::hal::io_to_error;
use crate::{Error, Result};

/// Poll interval of the register wait helpers.
const REG_POLL_INTERVAL: Duration = Duration::from_micros(100);

/// A mapped MMIO register window (usually BAR0, 128 KiB).
///
/// Accesses are volatile, aligned and 32 bits wide, which is all the
/// ordering MMIO needs on x86; the ring code adds its own fence before
/// tail-pointer writes.
pub struct Mmio {
    base: NonNull<u8>,
    len: usize,
    mapped: bool,
}

unsafe impl Send for Mmio {}

impl Mmio {
    /// Wraps a plain memory buffer as a register window.
    ///
    /// This is how tests present a fake register file to the driver; the
    /// buffer is not unmapped on drop.
    ///
    /// # Safety
    ///
    /// `base` must stay valid and writable for `len` bytes for the lifetime
    /// of the returned `Mmio`, and nothing else may assume exclusive access
    /// to it.
    pub unsafe fn from_raw(base: NonNull<u8>, len: usize) -> Mmio {
        Mmio {
            base,
            len,
            mapped: false,
        }
    }

    /// Maps `len` bytes of `file` read/write shared.
    fn map(file: &File, len: usize) -> Result<Mmio> {
        use std::os::unix::io::AsRawFd;

        let ptr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io_to_error(std::io::Error::last_os_error()));
        }
        Ok(Mmio {
            base: NonNull::new(ptr as *mut u8).expect("mmap returned NULL without MAP_FAILED"),
            len,
            mapped: true,
        })
    }

    /// Size of the window in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the window is zero-sized (it never is for a real BAR0).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    fn reg_ptr(&self, offset: u32) -> *mut u32 {
        let offset = offset as usize;
        assert!(
            offset & 3 == 0 && offset + 4 <= self.len,
            "register offset {offset:#x} out of range"
        );
        unsafe { self.base.as_ptr().add(offset) as *mut u32 }
    }

    /// Reads the 32-bit register at `offset`.
    #[inline]
    pub fn get_reg(&self, offset: u32) -> u32 {
        unsafe { core::ptr::read_volatile(self.reg_ptr(offset)) }
    }

    /// Writes the 32-bit register at `offset`.
    #[inline]
    pub fn set_reg(&self, offset: u32, value: u32) {
        unsafe { core::ptr::write_volatile(self.reg_ptr(offset), value) }
    }

    /// Read-modify-write: sets every bit of `mask`.
    pub fn set_flags(&self, offset: u32, mask: u32) {
        self.set_reg(offset, self.get_reg(offset) | mask);
    }

    /// Read-modify-write: clears every bit of `mask`.
    pub fn clear_flags(&self, offset: u32, mask: u32) {
        self.set_reg(offset, self.get_reg(offset) & !mask);
    }

    /// Polls until all bits of `mask` read as set, or `timeout` expires.
    pub fn wait_set(&self, offset: u32, mask: u32, timeout: Duration) -> Result {
        let deadline = Instant::now() + timeout;
        loop {
            if self.get_reg(offset) & mask == mask {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::InitTimeout {
                    register: offset,
                    mask,
                });
            }
            std::thread::sleep(REG_POLL_INTERVAL);
        }
    }

    /// Polls until all bits of `mask` read as clear, or `timeout` expires.
    pub fn wait_clear(&self, offset: u32, mask: u32, timeout: Duration) -> Result {
        let deadline = Instant::now() + timeout;
        loop {
            if self.get_reg(offset) & mask == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::InitTimeout {
                    register: offset,
                    mask,
                });
            }
            std::thread::sleep(REG_POLL_INTERVAL);
        }
    }
}

impl Drop for Mmio {
    fn drop(&mut self) {
        if self.mapped {
            let ret = unsafe { libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.len) };
            if ret != 0 {
                warn!("failed to unmap {} byte register window", self.len);
            }
        }
    }
}

/// An opened PCI device: config space handle plus the BAR0 resource, with
/// the kernel driver evicted and bus mastering on.
pub struct PciDevice {
    pci_addr: String,
    vendor_id: u16,
    device_id: u16,
    config: File,
    resource: File,
}

impl PciDevice {
    /// Opens the device at `pci_addr` (e.g. `"0000:01:00.0"`).
    ///
    /// Rejects unknown vendor/device id pairs before touching the device.
    /// Unbinding and bus mastering need root; permission failures surface
    /// as [`Error::NotPrivileged`].
    pub fn open(pci_addr: &str) -> Result<PciDevice> {
        let dir = PathBuf::from("/sys/bus/pci/devices").join(pci_addr);
        if !dir.is_dir() {
            return Err(Error::DeviceNotFound(pci_addr.to_string()));
        }

        let config = OpenOptions::new()
            .read(true)
            .write(true)
            .open(dir.join("config"))
            .map_err(io_to_error)?;
        let vendor_id = read_config_u16(&config, PCI_VENDOR_ID)?;
        let device_id = read_config_u16(&config, PCI_DEVICE_ID)?;
        if vendor_id != INTEL_VEND || !SUPPORTED_DEVICE_IDS.contains(&device_id) {
            return Err(Error::UnsupportedDevice {
                vendor_id,
                device_id,
            });
        }
        debug!("{pci_addr}: found device {vendor_id:04x}:{device_id:04x}");

        unbind_kernel_driver(&dir, pci_addr)?;
        let resource = OpenOptions::new()
            .read(true)
            .write(true)
            .open(dir.join("resource0"))
            .map_err(io_to_error)?;

        let device = PciDevice {
            pci_addr: pci_addr.to_string(),
            vendor_id,
            device_id,
            config,
            resource,
        };
        device.enable_bus_mastering()?;
        Ok(device)
    }

    /// Sets bit 2 of the PCI command word so the device may master DMA.
    fn enable_bus_mastering(&self) -> Result {
        use std::os::unix::fs::FileExt;

        let mut word = [0u8; 2];
        self.config
            .read_exact_at(&mut word, PCI_COMMAND)
            .map_err(io_to_error)?;
        let command = u16::from_le_bytes(word) | PCI_COMMAND_BUS_MASTER;
        self.config
            .write_all_at(&command.to_le_bytes(), PCI_COMMAND)
            .map_err(io_to_error)?;
        debug!("{}: bus mastering enabled", self.pci_addr);
        Ok(())
    }

    /// Maps the whole of BAR0 read/write into the process.
    pub fn map_bar0(&self) -> Result<Mmio> {
        let len = self.resource.metadata().map_err(io_to_error)?.len() as usize;
        let mmio = Mmio::map(&self.resource, len)?;
        info!("{}: mapped {} KiB of BAR0", self.pci_addr, len / 1024);
        Ok(mmio)
    }

    /// The sysfs address this device was opened with.
    pub fn pci_addr(&self) -> &str {
        &self.pci_addr
    }

    /// PCI vendor id read from config space.
    pub fn vendor_id(&self) -> u16 {
        self.vendor_id
    }

    /// PCI device id read from config space.
    pub fn device_id(&self) -> u16 {
        self.device_id
    }
}

fn read_config_u16(config: &File, offset: u64) -> Result<u16> {
    use std::os::unix::fs::FileExt;

    let mut word = [0u8; 2];
    config.read_exact_at(&mut word, offset).map_err(io_to_error)?;
    Ok(u16::from_le_bytes(word))
}

/// Writes the device address into `driver/unbind` when a kernel driver
/// currently owns the device.
fn unbind_kernel_driver(dir: &Path, pci_addr: &str) -> Result {
    let unbind = dir.join("driver").join("unbind");
    if !unbind.exists() {
        debug!("{pci_addr}: no kernel driver bound");
        return Ok(());
    }
    std::fs::write(&unbind, pci_addr.as_bytes()).map_err(io_to_error)?;
    info!("{pci_addr}: unbound kernel driver");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_window(len: usize) -> (Vec<u8>, Mmio) {
        let mut buf = vec![0u8; len];
        let base = NonNull::new(buf.as_mut_ptr()).unwrap();
        let mmio = unsafe { Mmio::from_raw(base, len) };
        (buf, mmio)
    }

    #[test]
    fn get_set_roundtrip() {
        let (_buf, mmio) = fake_window(4096);
        mmio.set_reg(0x40, 0xDEAD_BEEF);
        assert_eq!(mmio.get_reg(0x40), 0xDEAD_BEEF);
        assert_eq!(mmio.get_reg(0x44), 0);
    }

    #[test]
    fn flag_helpers_modify_only_their_bits() {
        let (_buf, mmio) = fake_window(4096);
        mmio.set_reg(0x10, 0x0F00);
        mmio.set_flags(0x10, 0x00FF);
        assert_eq!(mmio.get_reg(0x10), 0x0FFF);
        mmio.clear_flags(0x10, 0x0F0F);
        assert_eq!(mmio.get_reg(0x10), 0x00F0);
    }

    #[test]
    fn wait_set_succeeds_immediately_on_preset_bit() {
        let (_buf, mmio) = fake_window(4096);
        mmio.set_reg(0x20, 0x4);
        assert!(mmio.wait_set(0x20, 0x4, Duration::from_millis(1)).is_ok());
    }

    #[test]
    fn wait_set_times_out_with_register_and_mask() {
        let (_buf, mmio) = fake_window(4096);
        match mmio.wait_set(0x20, 0x8, Duration::from_millis(2)) {
            Err(Error::InitTimeout { register, mask }) => {
                assert_eq!(register, 0x20);
                assert_eq!(mask, 0x8);
            }
            other => panic!("expected InitTimeout, got {other:?}"),
        }
    }

    #[test]
    fn wait_clear_mirrors_wait_set() {
        let (_buf, mmio) = fake_window(4096);
        assert!(mmio.wait_clear(0x30, 0x1, Duration::from_millis(1)).is_ok());
        mmio.set_reg(0x30, 0x1);
        match mmio.wait_clear(0x30, 0x1, Duration::from_millis(2)) {
            Err(Error::InitTimeout { register, mask }) => {
                assert_eq!(register, 0x30);
                assert_eq!(mask, 0x1);
            }
            other => panic!("expected InitTimeout, got {other:?}"),
        }
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn unaligned_offset_is_rejected() {
        let (_buf, mmio) = fake_window(4096);
        mmio.get_reg(0x21);
    }
}
