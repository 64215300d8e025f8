//! DMA memory management: packet buffers and memory pools.
//!
//! A [`MemPool`] carves one physically contiguous, hugepage-backed DMA
//! region into fixed-size slots. Each slot starts with a 64-byte
//! [`PacketBuffer`] header followed by the packet payload, so the DMA
//! address of slot `i`'s payload is always
//! `base_phys + i * entry_size + DATA_OFFSET`. Free slots are kept on a LIFO
//! stack: the most recently freed buffer is cache-hot and the cheapest one
//! to hand back to the NIC.
//!
//! Pools are registered in a process-wide table keyed by a unique id that is
//! also stamped into every buffer header, which is how a transmit queue
//! finds the home pool of a buffer it is returning.

use core::cell::{Cell, RefCell};
use core::marker::PhantomData;
use core::ptr::NonNull;
use core::slice;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use crate::hal::OsMem;
use crate::Result;

/// Offset of the packet payload from the start of a pool slot. NIC
/// descriptors always point at `header + DATA_OFFSET`, never at the header.
pub const DATA_OFFSET: usize = 64;

/// Entry size used when a pool is created with size 0.
pub const DEFAULT_ENTRY_SIZE: u32 = 2048;

/// Fixed buffer metadata at the start of every pool slot.
///
/// The layout is identical for all buffers of a pool and must stay in sync
/// with [`DATA_OFFSET`]; `phys_addr` is written once when the pool carves
/// its slots and never changes afterwards.
#[repr(C)]
struct PacketHeader {
    phys_addr: u64,
    pool_id: u32,
    size: u32,
    headroom: [u8; DATA_OFFSET - 16],
}

const _: () = assert!(core::mem::size_of::<PacketHeader>() == DATA_OFFSET);

/// Handle to one packet buffer inside a [`MemPool`], or the empty sentinel.
///
/// The handle is a plain pointer wrapper: cloning it does not duplicate the
/// buffer, and nothing is freed on drop. Buffers move between three places
/// only (their pool's free stack, a NIC descriptor, or application hands)
/// and [`MemPool::push`] is the single way back.
pub struct PacketBuffer {
    header: *mut PacketHeader,
}

impl Clone for PacketBuffer {
    fn clone(&self) -> Self {
        PacketBuffer { header: self.header }
    }
}

// Handles may cross threads (e.g. RX thread to TX thread); the pool's
// single-thread-per-queue discipline is what keeps the contents sound.
unsafe impl Send for PacketBuffer {}

impl PacketBuffer {
    /// The empty sentinel: belongs to no pool, carries no data. Returned by
    /// [`MemPool::pop`] on underrun; handing it to the NIC is a bug.
    pub const fn empty() -> PacketBuffer {
        PacketBuffer {
            header: core::ptr::null_mut(),
        }
    }

    /// Whether this handle is the empty sentinel.
    pub fn is_empty(&self) -> bool {
        self.header.is_null()
    }

    unsafe fn from_raw(header: *mut PacketHeader) -> PacketBuffer {
        PacketBuffer { header }
    }

    /// Bus address of the buffer header (not of the payload).
    pub fn physical_address(&self) -> u64 {
        if self.is_empty() {
            return 0;
        }
        unsafe { (*self.header).phys_addr }
    }

    /// Bus address of the payload, the value descriptors are armed with.
    pub fn dma_address(&self) -> u64 {
        debug_assert!(!self.is_empty(), "the empty sentinel has no DMA address");
        self.physical_address() + DATA_OFFSET as u64
    }

    /// Id of the owning pool, 0 for the sentinel.
    pub fn pool_id(&self) -> u32 {
        if self.is_empty() {
            return 0;
        }
        unsafe { (*self.header).pool_id }
    }

    /// Current payload length in bytes.
    pub fn size(&self) -> u32 {
        if self.is_empty() {
            return 0;
        }
        unsafe { (*self.header).size }
    }

    /// Sets the payload length. The caller keeps it within
    /// `entry_size - DATA_OFFSET` of the owning pool.
    pub fn set_size(&mut self, size: u32) {
        debug_assert!(!self.is_empty(), "cannot resize the empty sentinel");
        if !self.is_empty() {
            unsafe { (*self.header).size = size }
        }
    }

    /// Payload bytes, `size` long. Empty slice for the sentinel.
    pub fn data(&self) -> &[u8] {
        if self.is_empty() {
            return &[];
        }
        unsafe {
            slice::from_raw_parts(
                (self.header as *const u8).add(DATA_OFFSET),
                (*self.header).size as usize,
            )
        }
    }

    /// Mutable payload bytes, `size` long.
    pub fn data_mut(&mut self) -> &mut [u8] {
        if self.is_empty() {
            return &mut [];
        }
        unsafe {
            slice::from_raw_parts_mut(
                (self.header as *mut u8).add(DATA_OFFSET),
                (*self.header).size as usize,
            )
        }
    }

    /// Hints the CPU to pull the payload into cache. No-op off x86_64 or
    /// without SSE.
    #[inline(always)]
    pub fn prefetch(&self, hint: Prefetch) {
        #[cfg(target_arch = "x86_64")]
        if !self.is_empty() && core_detect::is_x86_feature_detected!("sse") {
            use core::arch::x86_64;
            let addr = unsafe { (self.header as *const i8).add(DATA_OFFSET) };
            unsafe {
                match hint {
                    Prefetch::Time0 => x86_64::_mm_prefetch(addr, x86_64::_MM_HINT_T0),
                    Prefetch::Time1 => x86_64::_mm_prefetch(addr, x86_64::_MM_HINT_T1),
                    Prefetch::Time2 => x86_64::_mm_prefetch(addr, x86_64::_MM_HINT_T2),
                    Prefetch::NonTemporal => x86_64::_mm_prefetch(addr, x86_64::_MM_HINT_NTA),
                }
            }
        }
        #[cfg(not(target_arch = "x86_64"))]
        let _ = hint;
    }
}

impl core::fmt::Debug for PacketBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_empty() {
            return f.write_str("PacketBuffer(empty)");
        }
        f.debug_struct("PacketBuffer")
            .field("phys", &format_args!("{:#x}", self.physical_address()))
            .field("pool", &self.pool_id())
            .field("size", &self.size())
            .finish()
    }
}

/// Cache prefetch hints, mapping onto the x86 SSE `_MM_HINT_*` levels.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Prefetch {
    /// Fetch into all cache levels.
    Time0,
    /// Fetch into L2 and below.
    Time1,
    /// Fetch into L3 only.
    Time2,
    /// Non-temporal fetch, data will not be reused.
    NonTemporal,
}

/// Typed DMA allocation, used for descriptor rings.
pub struct Dma<T, H: OsMem> {
    virt: NonNull<T>,
    phys: u64,
    size: usize,
    _os: PhantomData<H>,
}

impl<T, H: OsMem> Dma<T, H> {
    /// Allocates zeroed DMA memory for `count` elements of `T`.
    pub fn allocate(count: usize, require_contiguous: bool) -> Result<Dma<T, H>> {
        let size = count * core::mem::size_of::<T>();
        let chunk = H::allocate_dma(size, require_contiguous)?;
        Ok(Dma {
            virt: chunk.virt.cast(),
            phys: chunk.phys,
            size,
            _os: PhantomData,
        })
    }

    /// Virtual address of the first element.
    pub fn virt(&self) -> NonNull<T> {
        self.virt
    }

    /// Bus address of the first element.
    pub fn phys(&self) -> u64 {
        self.phys
    }
}

impl<T, H: OsMem> Drop for Dma<T, H> {
    fn drop(&mut self) {
        unsafe { H::free_dma(self.virt.cast(), self.size) }
    }
}

/// Type-erased owned DMA region backing a pool, so [`MemPool`] itself stays
/// non-generic and registry-friendly.
struct OwnedDmaRegion {
    virt: NonNull<u8>,
    size: usize,
    free: unsafe fn(NonNull<u8>, usize),
}

impl Drop for OwnedDmaRegion {
    fn drop(&mut self) {
        unsafe { (self.free)(self.virt, self.size) }
    }
}

/// The process-wide pool table. Only written while pools are constructed or
/// dropped; the data path takes the lock for id lookups only.
fn pools() -> &'static Mutex<BTreeMap<u32, Weak<MemPool>>> {
    static POOLS: OnceLock<Mutex<BTreeMap<u32, Weak<MemPool>>>> = OnceLock::new();
    POOLS.get_or_init(|| Mutex::new(BTreeMap::new()))
}

/// A bounded LIFO free-list of fixed-size DMA packet buffers.
///
/// A pool is created *empty* and becomes usable after exactly one call to
/// [`allocate`](MemPool::allocate) carves the region into buffers. It is not
/// a collection: the only operations are [`pop`](MemPool::pop),
/// [`push`](MemPool::push) and size queries.
///
/// Pools are only handled as `Arc<MemPool>`; the free stack uses interior
/// mutability under the driver-wide rule that each queue (and therefore
/// each pool) is driven by one thread at a time.
pub struct MemPool {
    id: u32,
    base_virt: NonNull<u8>,
    base_phys: u64,
    entry_size: u32,
    entry_count: u32,
    allocated: Cell<bool>,
    free_stack: RefCell<Vec<PacketBuffer>>,
    backing: Option<OwnedDmaRegion>,
}

unsafe impl Send for MemPool {}
unsafe impl Sync for MemPool {}

impl MemPool {
    /// Registers a new, empty pool over caller-provided memory.
    ///
    /// The region must be at least `entry_count * entry_size` bytes and
    /// `base_phys` must be the bus address of `base_virt` with the whole
    /// region physically contiguous; the caller keeps it alive for the
    /// pool's lifetime. Use [`allocate_with`](MemPool::allocate_with) for
    /// the common case where the pool should own its memory.
    pub fn new(
        base_virt: NonNull<u8>,
        base_phys: u64,
        entry_size: u32,
        entry_count: u32,
    ) -> Arc<MemPool> {
        Self::register(base_virt, base_phys, entry_size, entry_count, None)
    }

    /// Allocates a contiguous DMA region via `H` and registers a pool over
    /// it, with all buffers carved and pushed onto the free stack.
    pub fn allocate_with<H: OsMem>(entry_count: u32, entry_size: u32) -> Result<Arc<MemPool>> {
        let entry_size = match entry_size {
            0 => DEFAULT_ENTRY_SIZE,
            n => n,
        };
        let hugepage = H::hugepage_size();
        assert!(
            hugepage == 0 || hugepage % entry_size as usize == 0,
            "entry size must be a divisor of the hugepage size"
        );

        let size = entry_count as usize * entry_size as usize;
        let chunk = H::allocate_dma(size, true)?;
        let region = OwnedDmaRegion {
            virt: chunk.virt,
            size,
            free: H::free_dma,
        };
        let pool = Self::register(chunk.virt, chunk.phys, entry_size, entry_count, Some(region));
        pool.allocate();
        Ok(pool)
    }

    fn register(
        base_virt: NonNull<u8>,
        base_phys: u64,
        entry_size: u32,
        entry_count: u32,
        backing: Option<OwnedDmaRegion>,
    ) -> Arc<MemPool> {
        assert!(
            entry_size as usize > DATA_OFFSET,
            "pool entries must have room for the buffer header"
        );

        let mut pools = pools().lock().unwrap();
        // Probe upward from the highest live id; u32 wrap-around walks back
        // into any holes left by dropped pools.
        let mut id = pools.keys().next_back().map_or(0, |last| last.wrapping_add(1));
        while pools.contains_key(&id) {
            id = id.wrapping_add(1);
        }

        let pool = Arc::new(MemPool {
            id,
            base_virt,
            base_phys,
            entry_size,
            entry_count,
            allocated: Cell::new(false),
            free_stack: RefCell::new(Vec::with_capacity(entry_count as usize)),
            backing,
        });
        pools.insert(id, Arc::downgrade(&pool));
        debug!("registered memory pool {} ({} pools live)", id, pools.len());
        pool
    }

    /// Looks a live pool up by the id stamped into a buffer header.
    pub fn find(id: u32) -> Option<Arc<MemPool>> {
        pools().lock().unwrap().get(&id).and_then(Weak::upgrade)
    }

    /// Carves the region into buffers and fills the free stack.
    ///
    /// Valid exactly once per pool; a second call is a programmer error and
    /// panics.
    pub fn allocate(&self) {
        assert!(
            !self.allocated.replace(true),
            "buffers of pool {} are already allocated",
            self.id
        );
        let mut stack = self.free_stack.borrow_mut();
        for i in 0..self.entry_count as usize {
            let offset = i * self.entry_size as usize;
            unsafe {
                let header = self.base_virt.as_ptr().add(offset) as *mut PacketHeader;
                (*header).phys_addr = self.base_phys + offset as u64;
                (*header).pool_id = self.id;
                (*header).size = 0;
                stack.push(PacketBuffer::from_raw(header));
            }
        }
        trace!("pool {}: carved {} buffers", self.id, self.entry_count);
    }

    /// Pops a free buffer, LIFO. Returns the empty sentinel when the pool
    /// is exhausted; never blocks.
    pub fn pop(&self) -> PacketBuffer {
        match self.free_stack.borrow_mut().pop() {
            Some(buf) => buf,
            None => {
                debug!("pool {} is out of free buffers", self.id);
                PacketBuffer::empty()
            }
        }
    }

    /// Returns a buffer to the free stack.
    ///
    /// Rejects (with `false` and an error log) the empty sentinel, buffers
    /// of other pools, and pushes onto an already-full stack; the last one
    /// means somebody freed a buffer twice.
    pub fn push(&self, buf: PacketBuffer) -> bool {
        if buf.is_empty() {
            error!("pool {}: refusing to take the empty sentinel", self.id);
            return false;
        }
        if buf.pool_id() != self.id {
            error!(
                "pool {}: refusing buffer owned by pool {}",
                self.id,
                buf.pool_id()
            );
            return false;
        }
        let mut stack = self.free_stack.borrow_mut();
        if stack.len() >= self.entry_count as usize {
            error!("pool {}: free stack overflow, double free?", self.id);
            return false;
        }
        stack.push(buf);
        true
    }

    /// Number of buffers currently free.
    pub fn size(&self) -> usize {
        self.free_stack.borrow().len()
    }

    /// Whether no buffer is currently free.
    pub fn is_empty(&self) -> bool {
        self.free_stack.borrow().is_empty()
    }

    /// Total number of buffers this pool was carved into.
    pub fn capacity(&self) -> u32 {
        self.entry_count
    }

    /// Size in bytes of each slot, header included.
    pub fn entry_size(&self) -> u32 {
        self.entry_size
    }

    /// The unique id of this pool, stable for its lifetime.
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl Drop for MemPool {
    fn drop(&mut self) {
        pools().lock().unwrap().remove(&self.id);
        debug!("deregistered memory pool {}", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        assert_eq!(core::mem::size_of::<PacketHeader>(), DATA_OFFSET);
        assert_eq!(core::mem::align_of::<PacketHeader>(), 8);
    }

    #[test]
    fn sentinel_reads_as_nothing() {
        let buf = PacketBuffer::empty();
        assert!(buf.is_empty());
        assert_eq!(buf.physical_address(), 0);
        assert_eq!(buf.pool_id(), 0);
        assert_eq!(buf.size(), 0);
        assert!(buf.data().is_empty());
    }

    #[test]
    fn default_entry_size_divides_hugepage() {
        assert_eq!((2u32 << 20) % DEFAULT_ENTRY_SIZE, 0);
    }
}
