//! Memory pool behavior: LIFO discipline, id assignment, sentinel safety
//! and buffer conservation.
//!
//! The pools run over a mock [`OsMem`] backed by the std allocator with an
//! identity virtual-to-physical mapping, so everything here works without
//! hugepages or root.

use core::ptr::NonNull;
use std::alloc::Layout;

use ixgbe_userspace::hal::DmaChunk;
use ixgbe_userspace::{MemPool, OsMem, PacketBuffer};

struct TestOs;

unsafe impl OsMem for TestOs {
    fn page_size() -> usize {
        4096
    }

    fn hugepage_size() -> usize {
        2 << 20
    }

    fn virt_to_phys(virt: *const u8) -> ixgbe_userspace::Result<u64> {
        Ok(virt as u64)
    }

    fn allocate_dma(size: usize, _require_contiguous: bool) -> ixgbe_userspace::Result<DmaChunk> {
        let layout = Layout::from_size_align(size, 4096).unwrap();
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!ptr.is_null(), "test allocation failed");
        Ok(DmaChunk {
            virt: NonNull::new(ptr).unwrap(),
            phys: ptr as u64,
        })
    }

    unsafe fn free_dma(virt: NonNull<u8>, size: usize) {
        let layout = Layout::from_size_align(size, 4096).unwrap();
        std::alloc::dealloc(virt.as_ptr(), layout);
    }
}

#[test]
fn pop_and_push_are_lifo() {
    let pool = MemPool::allocate_with::<TestOs>(4, 2048).unwrap();
    assert_eq!(pool.size(), 4);
    assert_eq!(pool.capacity(), 4);

    let bufs: Vec<PacketBuffer> = (0..4).map(|_| pool.pop()).collect();
    assert!(bufs.iter().all(|b| !b.is_empty()));
    assert!(pool.is_empty());

    // Underrun yields the sentinel, not a panic or a block.
    assert!(pool.pop().is_empty());

    // Push the four back in reverse order...
    let pushed: Vec<u64> = bufs
        .iter()
        .rev()
        .map(|b| {
            assert!(pool.push(b.clone()));
            b.physical_address()
        })
        .collect();

    // ...and pop them again: LIFO means the reverse of the push order.
    let popped: Vec<u64> = (0..4).map(|_| pool.pop().physical_address()).collect();
    let mut expected = pushed;
    expected.reverse();
    assert_eq!(popped, expected);
}

#[test]
fn buffers_sit_at_fixed_entry_strides() {
    let pool = MemPool::allocate_with::<TestOs>(4, 2048).unwrap();
    let mut addrs: Vec<u64> = (0..4).map(|_| pool.pop().physical_address()).collect();
    addrs.sort_unstable();

    let base = addrs[0];
    for (i, addr) in addrs.iter().enumerate() {
        assert_eq!(*addr, base + (i as u64) * 2048);
    }
}

#[test]
fn pool_ids_are_unique_and_stable() {
    let first = MemPool::allocate_with::<TestOs>(2, 2048).unwrap();
    let second = MemPool::allocate_with::<TestOs>(2, 2048).unwrap();
    assert_ne!(first.id(), second.id());

    // Ids are stamped into the buffers and stay put.
    let buf = first.pop();
    assert_eq!(buf.pool_id(), first.id());
    first.push(buf);

    let live_id = second.id();
    drop(first);
    let third = MemPool::allocate_with::<TestOs>(2, 2048).unwrap();
    assert_ne!(third.id(), live_id);
}

#[test]
fn pools_resolve_by_id_while_alive() {
    let pool = MemPool::allocate_with::<TestOs>(2, 2048).unwrap();
    let id = pool.id();
    assert!(MemPool::find(id).is_some());
    drop(pool);
    assert!(MemPool::find(id).is_none());
}

#[test]
fn push_rejects_the_sentinel() {
    let pool = MemPool::allocate_with::<TestOs>(2, 2048).unwrap();
    assert!(!pool.push(PacketBuffer::empty()));
    assert_eq!(pool.size(), 2);
}

#[test]
fn push_rejects_foreign_buffers() {
    let first = MemPool::allocate_with::<TestOs>(2, 2048).unwrap();
    let second = MemPool::allocate_with::<TestOs>(2, 2048).unwrap();

    let stray = first.pop();
    assert!(!second.push(stray.clone()));
    assert_eq!(second.size(), 2);

    // Its own pool still takes it.
    assert!(first.push(stray));
    assert_eq!(first.size(), 2);
}

#[test]
fn push_rejects_double_free() {
    let pool = MemPool::allocate_with::<TestOs>(2, 2048).unwrap();
    let buf = pool.pop();
    assert!(pool.push(buf.clone()));
    // The stack is full again; a second push of the same handle must fail.
    assert!(!pool.push(buf));
    assert_eq!(pool.size(), 2);
}

#[test]
fn buffer_count_is_conserved() {
    let pool = MemPool::allocate_with::<TestOs>(8, 2048).unwrap();
    let capacity = pool.capacity() as usize;

    let mut held = Vec::new();
    for step in [3usize, 2, 1] {
        for _ in 0..step {
            let buf = pool.pop();
            assert!(!buf.is_empty());
            held.push(buf);
        }
        assert_eq!(pool.size() + held.len(), capacity);
        let buf = held.pop().unwrap();
        assert!(pool.push(buf));
        assert_eq!(pool.size() + held.len(), capacity);
    }
    for buf in held.drain(..) {
        assert!(pool.push(buf));
    }
    assert_eq!(pool.size(), capacity);
}

#[test]
fn entry_size_zero_defaults_to_2048() {
    let pool = MemPool::allocate_with::<TestOs>(2, 0).unwrap();
    assert_eq!(pool.entry_size(), 2048);
}

#[test]
fn payload_access_round_trips() {
    let pool = MemPool::allocate_with::<TestOs>(2, 2048).unwrap();
    let mut buf = pool.pop();
    buf.set_size(64);
    buf.data_mut().fill(0xAB);
    buf.data_mut()[0] = 0x01;
    assert_eq!(buf.data().len(), 64);
    assert_eq!(buf.data()[0], 0x01);
    assert_eq!(buf.data()[63], 0xAB);
    pool.push(buf);
}
