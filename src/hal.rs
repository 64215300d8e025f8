//! OS memory primitives behind the driver.
//!
//! Everything the driver needs from the operating system is collected in the
//! [`OsMem`] trait: page geometry, hugepage-backed DMA allocation and
//! virtual-to-physical translation. The production implementation is
//! [`LinuxOs`]; tests substitute allocator-backed mocks with an identity
//! address mapping so the whole data path runs without hardware or root.

use core::ptr::NonNull;

use crate::{Error, Result};

/// A pinned, zero-filled, DMA-capable memory chunk.
pub struct DmaChunk {
    /// Virtual address of the chunk in this process.
    pub virt: NonNull<u8>,
    /// Bus address of the first byte of the chunk.
    pub phys: u64,
}

/// Platform memory services consumed by the driver core.
///
/// # Safety
///
/// Implementations guarantee that memory returned by
/// [`allocate_dma`](OsMem::allocate_dma) stays mapped, pinned and
/// device-visible at the reported physical address until passed to
/// [`free_dma`](OsMem::free_dma), and that
/// [`virt_to_phys`](OsMem::virt_to_phys) returns addresses a bus master may
/// use. A bogus implementation lets the NIC scribble over arbitrary memory.
pub unsafe trait OsMem {
    /// Size of a regular page in bytes.
    fn page_size() -> usize;

    /// Width of an address (and of a pagemap entry) in bytes.
    fn addr_size() -> usize {
        core::mem::size_of::<usize>()
    }

    /// Size of a huge page in bytes, or 0 when hugepages are unavailable.
    fn hugepage_size() -> usize;

    /// Translates a virtual address of this process into a bus address.
    fn virt_to_phys(virt: *const u8) -> Result<u64>;

    /// Allocates `size` bytes of pinned, zeroed DMA memory.
    ///
    /// With `require_contiguous` the chunk is physically contiguous, which
    /// bounds `size` by one hugepage on Linux.
    fn allocate_dma(size: usize, require_contiguous: bool) -> Result<DmaChunk>;

    /// Returns a chunk obtained from [`allocate_dma`](OsMem::allocate_dma).
    ///
    /// # Safety
    ///
    /// `virt` and `size` must describe exactly one live allocation from
    /// [`allocate_dma`](OsMem::allocate_dma); no references into it may
    /// survive this call.
    unsafe fn free_dma(virt: NonNull<u8>, size: usize);
}

/// Mount point of the hugetlbfs used for DMA allocations.
pub const HUGE_PAGE_MOUNT: &str = "/mnt/huge";

/// Mask extracting the page frame number from a pagemap entry.
const PAGEMAP_PFN_MASK: u64 = 0x007F_FFFF_FFFF_FFFF;
/// Page-present bit of a pagemap entry.
const PAGEMAP_PRESENT: u64 = 1 << 63;

/// [`OsMem`] for Linux: hugetlbfs-backed allocations and
/// `/proc/self/pagemap` translation. Requires root (or `CAP_SYS_ADMIN`) for
/// the physical addresses to be visible.
pub struct LinuxOs;

unsafe impl OsMem for LinuxOs {
    fn page_size() -> usize {
        // sysconf cannot fail for _SC_PAGESIZE.
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }

    fn hugepage_size() -> usize {
        let meminfo = match std::fs::read_to_string("/proc/meminfo") {
            Ok(s) => s,
            Err(_) => return 0,
        };
        for line in meminfo.lines() {
            let mut fields = line.split_whitespace();
            if fields.next() != Some("Hugepagesize:") {
                continue;
            }
            let value: usize = match fields.next().and_then(|v| v.parse().ok()) {
                Some(v) => v,
                None => return 0,
            };
            return match fields.next() {
                Some("kB") => value * 1024,
                Some("MB") => value * 1024 * 1024,
                Some("GB") => value * 1024 * 1024 * 1024,
                _ => value,
            };
        }
        0
    }

    fn virt_to_phys(virt: *const u8) -> Result<u64> {
        use std::os::unix::fs::FileExt;

        let page_size = Self::page_size() as u64;
        let addr = virt as u64;

        let pagemap = std::fs::File::open("/proc/self/pagemap").map_err(io_to_error)?;
        let mut entry = [0u8; 8];
        pagemap
            .read_exact_at(&mut entry, addr / page_size * Self::addr_size() as u64)
            .map_err(io_to_error)?;
        let entry = u64::from_ne_bytes(entry);

        let pfn = entry & PAGEMAP_PFN_MASK;
        if entry & PAGEMAP_PRESENT == 0 || pfn == 0 {
            // The kernel zeroes PFNs for processes without CAP_SYS_ADMIN.
            return Err(Error::NotPrivileged);
        }
        Ok(pfn * page_size + addr % page_size)
    }

    fn allocate_dma(size: usize, require_contiguous: bool) -> Result<DmaChunk> {
        use core::sync::atomic::{AtomicU32, Ordering};
        use std::ffi::CString;

        static HUGEPAGE_ID: AtomicU32 = AtomicU32::new(0);

        let hugepage = Self::hugepage_size();
        if hugepage == 0 {
            error!("no hugepage support detected, mount a hugetlbfs and reserve hugepages");
            return Err(Error::HugepagesExhausted);
        }
        let size = size.div_ceil(hugepage) * hugepage;
        if require_contiguous && size > hugepage {
            return Err(Error::AllocationNotContiguous);
        }

        // A pid-tagged file under the hugetlbfs mount, unlinked immediately
        // after mapping so no other process can attach to it.
        let id = HUGEPAGE_ID.fetch_add(1, Ordering::SeqCst);
        let path = format!("{}/ixgbe-{}-{}", HUGE_PAGE_MOUNT, std::process::id(), id);
        let cpath = CString::new(path.clone()).expect("hugepage path contains no NUL");

        unsafe {
            let fd = libc::open(cpath.as_ptr(), libc::O_CREAT | libc::O_RDWR, 0o700);
            if fd < 0 {
                return Err(io_to_error(std::io::Error::last_os_error()));
            }
            if libc::ftruncate(fd, size as libc::off_t) != 0 {
                let err = std::io::Error::last_os_error();
                libc::close(fd);
                libc::unlink(cpath.as_ptr());
                return Err(io_to_error(err));
            }
            let ptr = libc::mmap(
                core::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_HUGETLB | libc::MAP_LOCKED | libc::MAP_NORESERVE,
                fd,
                0,
            );
            let map_err = std::io::Error::last_os_error();
            libc::close(fd);
            libc::unlink(cpath.as_ptr());
            if ptr == libc::MAP_FAILED {
                return Err(match map_err.raw_os_error() {
                    Some(libc::ENOMEM) => Error::HugepagesExhausted,
                    _ => io_to_error(map_err),
                });
            }
            if libc::mlock(ptr, size) != 0 {
                warn!("mlock of {} bytes at {:p} failed", size, ptr);
            }

            let virt = NonNull::new_unchecked(ptr as *mut u8);
            let phys = Self::virt_to_phys(virt.as_ptr())?;
            debug!(
                "allocated {} bytes of DMA memory, virt {:p}, phys {:#x}",
                size,
                virt.as_ptr(),
                phys
            );
            Ok(DmaChunk { virt, phys })
        }
    }

    unsafe fn free_dma(virt: NonNull<u8>, size: usize) {
        // Allocation sizes were rounded up to whole hugepages.
        let hugepage = Self::hugepage_size();
        let size = match hugepage {
            0 => size,
            n => size.div_ceil(n) * n,
        };
        if libc::munmap(virt.as_ptr() as *mut libc::c_void, size) != 0 {
            warn!("munmap of {} bytes at {:p} failed", size, virt.as_ptr());
        }
    }
}

/// Maps an OS error onto the driver error model; permission problems get
/// their own variant because the fix (run as root) is always the same.
pub(crate) fn io_to_error(err: std::io::Error) -> Error {
    match err.kind() {
        std::io::ErrorKind::PermissionDenied => Error::NotPrivileged,
        _ => Error::Io(err),
    }
}
