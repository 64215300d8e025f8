//! Driver for the Intel 82599 family, poll-mode and userspace.
//!
//! [`IxgbeDevice`] owns the mapped BAR0 window and one descriptor ring per
//! queue. The ring size `QS` is a const generic so the hot path compiles
//! down to masked index arithmetic; the production path uses
//! [`DEFAULT_RING_SIZE`](crate::constants::DEFAULT_RING_SIZE).
//!
//! Ownership protocol: software owns the tail pointers, the NIC owns the
//! head pointers, and a descriptor belongs to the NIC from the moment the
//! tail moves past it until its DD bit reads back set. The shadow
//! `bufs_in_use` arrays record which packet buffer each in-flight
//! descriptor points at, so no information ever has to be read back out of
//! a descriptor address field.

use core::mem;
use core::sync::atomic::{fence, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crate::constants::*;
use crate::descriptor::{AdvancedRxDescriptor, AdvancedTxDescriptor};
use crate::hal::OsMem;
use crate::memory::{Dma, MemPool, PacketBuffer, Prefetch};
use crate::pci::{Mmio, PciDevice};
use crate::{Device, DeviceStats, Error, Result};

/// Name this driver registers itself under.
pub const DRIVER_NAME: &str = "ixgbe-ixy";

#[derive(PartialEq)]
enum DeviceState {
    Unconfigured,
    Running,
}

struct RxQueue<H: OsMem> {
    descriptors: Dma<AdvancedRxDescriptor, H>,
    /// Shadow of the ring: `bufs_in_use[i]` is the buffer descriptor `i`
    /// points at while that slot is NIC-owned. Empty until a pool is
    /// attached.
    bufs_in_use: Vec<PacketBuffer>,
    pool: Option<Arc<MemPool>>,
    rx_index: usize,
}

struct TxQueue<H: OsMem> {
    descriptors: Dma<AdvancedTxDescriptor, H>,
    bufs_in_use: Vec<PacketBuffer>,
    tx_index: usize,
    clean_index: usize,
}

/// An initialized 82599 NIC with `QS`-entry descriptor rings.
pub struct IxgbeDevice<H: OsMem, const QS: usize> {
    pci_addr: String,
    mmio: Mmio,
    // Keeps config space open (and with it, bus mastering) while the
    // device lives. None when driving a raw register window in tests.
    _pci: Option<PciDevice>,
    num_rx_queues: u16,
    num_tx_queues: u16,
    rx_queues: Vec<RxQueue<H>>,
    tx_queues: Vec<TxQueue<H>>,
    state: DeviceState,
    rx_underruns: u64,
}

impl<H: OsMem, const QS: usize> IxgbeDevice<H, QS> {
    /// Wraps an opened PCI device. The device is unconfigured until
    /// [`allocate`](Device::allocate) runs the init sequence.
    pub fn with_pci(pci: PciDevice, num_rx_queues: u16, num_tx_queues: u16) -> Result<Self> {
        let mmio = pci.map_bar0()?;
        let pci_addr = pci.pci_addr().to_string();
        Self::new(mmio, pci_addr, Some(pci), num_rx_queues, num_tx_queues)
    }

    /// Drives a caller-provided register window instead of a PCI mapping.
    /// This is the entry point for register-file tests.
    pub fn with_mmio(
        mmio: Mmio,
        pci_addr: &str,
        num_rx_queues: u16,
        num_tx_queues: u16,
    ) -> Result<Self> {
        Self::new(mmio, pci_addr.to_string(), None, num_rx_queues, num_tx_queues)
    }

    fn new(
        mmio: Mmio,
        pci_addr: String,
        pci: Option<PciDevice>,
        num_rx_queues: u16,
        num_tx_queues: u16,
    ) -> Result<Self> {
        assert!(QS.is_power_of_two(), "ring size must be a power of two");
        if num_rx_queues > MAX_QUEUES {
            return Err(Error::InvalidQueue(num_rx_queues));
        }
        if num_tx_queues > MAX_QUEUES {
            return Err(Error::InvalidQueue(num_tx_queues));
        }
        Ok(IxgbeDevice {
            pci_addr,
            mmio,
            _pci: pci,
            num_rx_queues,
            num_tx_queues,
            rx_queues: Vec::with_capacity(num_rx_queues as usize),
            tx_queues: Vec::with_capacity(num_tx_queues as usize),
            state: DeviceState::Unconfigured,
            rx_underruns: 0,
        })
    }

    /// Number of RX pool-underrun events since init. Each one is a
    /// descriptor slot that briefly starved because its pool was empty.
    pub fn rx_underruns(&self) -> u64 {
        self.rx_underruns
    }

    fn reset_and_init(&mut self) -> Result {
        info!("{}: initializing device", self.pci_addr);

        // Reset: interrupts off, full software reset, settle, interrupts
        // off again (the reset clears the mask register).
        self.mmio.set_reg(IXGBE_EIMC, IXGBE_IRQ_CLEAR_MASK);
        self.mmio.set_reg(IXGBE_CTRL, IXGBE_CTRL_RST_MASK);
        thread::sleep(RESET_SETTLE);
        self.mmio.set_reg(IXGBE_EIMC, IXGBE_IRQ_CLEAR_MASK);

        self.mmio.wait_set(IXGBE_EEC, IXGBE_EEC_ARD, EEPROM_TIMEOUT)?;
        self.mmio
            .wait_set(IXGBE_RDRXCTL, IXGBE_RDRXCTL_DMAIDONE, DMA_INIT_TIMEOUT)?;

        self.init_link();
        self.reset_stats();
        self.init_rx()?;
        self.init_tx()?;
        for queue_id in 0..self.num_tx_queues {
            self.start_tx_queue(queue_id)?;
        }

        self.mmio.set_flags(IXGBE_RXCTRL, IXGBE_RXCTRL_RXEN);
        self.enable_promiscuous();
        self.wait_for_link();

        self.state = DeviceState::Running;
        Ok(())
    }

    /// Programs 10G KX4/KR multispeed into AUTOC and restarts
    /// auto-negotiation.
    fn init_link(&self) {
        let autoc = self.mmio.get_reg(IXGBE_AUTOC);
        self.mmio.set_reg(
            IXGBE_AUTOC,
            (autoc & !IXGBE_AUTOC_LMS_MASK) | IXGBE_AUTOC_LMS_10G_SERIAL,
        );
        let autoc = self.mmio.get_reg(IXGBE_AUTOC);
        self.mmio.set_reg(
            IXGBE_AUTOC,
            (autoc & !IXGBE_AUTOC_10G_PMA_PMD_MASK) | IXGBE_AUTOC_10G_XAUI,
        );
        self.mmio.set_flags(IXGBE_AUTOC, IXGBE_AUTOC_AN_RESTART);
    }

    fn init_rx(&mut self) -> Result {
        // Global receive must be off while queues are configured.
        self.mmio.clear_flags(IXGBE_RXCTRL, IXGBE_RXCTRL_RXEN);

        // All 128 KiB of packet buffer to pool 0, no DCB.
        self.mmio.set_reg(ixgbe_rxpbsize(0), IXGBE_RXPBSIZE_128KB);
        for i in 1..8 {
            self.mmio.set_reg(ixgbe_rxpbsize(i), 0);
        }

        self.mmio.set_flags(IXGBE_HLREG0, IXGBE_HLREG0_RXCRCSTRP);
        self.mmio.set_flags(IXGBE_RDRXCTL, IXGBE_RDRXCTL_CRCSTRIP);
        self.mmio.set_flags(IXGBE_FCTRL, IXGBE_FCTRL_BAM);

        for i in 0..self.num_rx_queues as u32 {
            debug!("{}: initializing rx queue {}", self.pci_addr, i);
            let srrctl = self.mmio.get_reg(ixgbe_srrctl(i));
            self.mmio.set_reg(
                ixgbe_srrctl(i),
                (srrctl & !IXGBE_SRRCTL_DESCTYPE_MASK) | IXGBE_SRRCTL_DESCTYPE_ADV_ONEBUF,
            );
            // Drop frames when no descriptor is armed instead of stalling
            // every queue of the port.
            self.mmio.set_flags(ixgbe_srrctl(i), IXGBE_SRRCTL_DROP_EN);

            let ring = Dma::<AdvancedRxDescriptor, H>::allocate(QS, true)?;
            self.mmio.set_reg(ixgbe_rdbal(i), ring.phys() as u32);
            self.mmio.set_reg(ixgbe_rdbah(i), (ring.phys() >> 32) as u32);
            self.mmio
                .set_reg(ixgbe_rdlen(i), (QS * mem::size_of::<AdvancedRxDescriptor>()) as u32);
            self.mmio.set_reg(ixgbe_rdh(i), 0);
            self.mmio.set_reg(ixgbe_rdt(i), 0);

            self.rx_queues.push(RxQueue {
                descriptors: ring,
                bufs_in_use: Vec::with_capacity(QS),
                pool: None,
                rx_index: 0,
            });
        }

        self.mmio.set_flags(IXGBE_CTRL_EXT, IXGBE_CTRL_EXT_NS_DIS);
        Ok(())
    }

    fn init_tx(&mut self) -> Result {
        self.mmio.clear_flags(IXGBE_DMATXCTL, IXGBE_DMATXCTL_TE);

        // CRC offload, short-frame padding, default packet buffer split.
        self.mmio
            .set_flags(IXGBE_HLREG0, IXGBE_HLREG0_TXCRCEN | IXGBE_HLREG0_TXPADEN);
        self.mmio.set_reg(ixgbe_txpbsize(0), IXGBE_TXPBSIZE_40KB);
        for i in 1..8 {
            self.mmio.set_reg(ixgbe_txpbsize(i), 0);
        }
        self.mmio.set_reg(IXGBE_DTXMXSZRQ, 0xFFFF);
        self.mmio.clear_flags(IXGBE_RTTDCS, IXGBE_RTTDCS_ARBDIS);

        for i in 0..self.num_tx_queues as u32 {
            debug!("{}: initializing tx queue {}", self.pci_addr, i);
            let ring = Dma::<AdvancedTxDescriptor, H>::allocate(QS, true)?;
            self.mmio.set_reg(ixgbe_tdbal(i), ring.phys() as u32);
            self.mmio.set_reg(ixgbe_tdbah(i), (ring.phys() >> 32) as u32);
            self.mmio
                .set_reg(ixgbe_tdlen(i), (QS * mem::size_of::<AdvancedTxDescriptor>()) as u32);

            // WTHRESH stays 0 so every RS descriptor writes its DD bit
            // back immediately; the clean path depends on that.
            let txdctl = self.mmio.get_reg(ixgbe_txdctl(i)) & !IXGBE_TXDCTL_THRESH_MASK;
            self.mmio.set_reg(
                ixgbe_txdctl(i),
                txdctl | IXGBE_TXDCTL_PTHRESH | IXGBE_TXDCTL_HTHRESH,
            );

            self.tx_queues.push(TxQueue {
                descriptors: ring,
                bufs_in_use: vec![PacketBuffer::empty(); QS],
                tx_index: 0,
                clean_index: 0,
            });
        }

        self.mmio.set_flags(IXGBE_DMATXCTL, IXGBE_DMATXCTL_TE);
        Ok(())
    }

    fn start_tx_queue(&mut self, queue_id: u16) -> Result {
        let i = queue_id as u32;
        self.mmio.set_reg(ixgbe_tdh(i), 0);
        self.mmio.set_reg(ixgbe_tdt(i), 0);
        self.mmio.set_flags(ixgbe_txdctl(i), IXGBE_TXDCTL_ENABLE);
        self.mmio
            .wait_set(ixgbe_txdctl(i), IXGBE_TXDCTL_ENABLE, QUEUE_ENABLE_TIMEOUT)
    }

    /// Associates `pool` with an RX queue, arms every descriptor of its
    /// ring with a buffer from the pool and enables the queue.
    ///
    /// Attaching twice, or attaching a pool with fewer free buffers than
    /// the ring has slots, is a programmer error.
    pub fn add_rx_pool(&mut self, queue_id: u16, pool: Arc<MemPool>) -> Result {
        let queue = self
            .rx_queues
            .get_mut(queue_id as usize)
            .ok_or(Error::InvalidQueue(queue_id))?;
        assert!(
            queue.pool.is_none(),
            "rx queue {queue_id} already has a memory pool"
        );
        assert!(
            pool.size() >= QS,
            "pool {} holds {} free buffers, ring needs {}",
            pool.id(),
            pool.size(),
            QS
        );

        for i in 0..QS {
            let buf = pool.pop();
            let desc = unsafe { &mut *queue.descriptors.virt().as_ptr().add(i) };
            desc.arm(buf.dma_address());
            queue.bufs_in_use.push(buf);
        }
        queue.pool = Some(pool);

        let i = queue_id as u32;
        self.mmio.set_flags(ixgbe_rxdctl(i), IXGBE_RXDCTL_ENABLE);
        self.mmio
            .wait_set(ixgbe_rxdctl(i), IXGBE_RXDCTL_ENABLE, QUEUE_ENABLE_TIMEOUT)?;

        // All descriptors must be armed in memory before the NIC sees the
        // tail move.
        fence(Ordering::Release);
        self.mmio.set_reg(ixgbe_rdt(i), (QS - 1) as u32);
        debug!("{}: rx queue {} armed and enabled", self.pci_addr, queue_id);
        Ok(())
    }

    /// Receives up to `bufs.len()` packets from queue `queue_id`.
    ///
    /// Completed buffers are written into `bufs` front to back and replaced
    /// on the ring by fresh buffers from the queue's pool. When the pool
    /// runs dry the batch stops early: a starved slot is preferable to
    /// arming the NIC with a dangling address. Returns the number of
    /// buffers produced; the caller now owns them.
    pub fn rx_batch(&mut self, queue_id: u16, bufs: &mut [PacketBuffer]) -> Result<usize> {
        let queue = self
            .rx_queues
            .get_mut(queue_id as usize)
            .ok_or(Error::InvalidQueue(queue_id))?;
        let pool = queue
            .pool
            .clone()
            .ok_or(Error::QueueWithoutPool(queue_id))?;

        let mut received = 0;
        let mut rx_index = queue.rx_index;
        let mut last_rx_index = rx_index;

        for slot in bufs.iter_mut() {
            let desc = unsafe { &mut *queue.descriptors.virt().as_ptr().add(rx_index) };
            if !desc.descriptor_done() {
                break;
            }
            assert!(
                desc.end_of_packet(),
                "multi-segment frame received, buffers are smaller than the MTU"
            );
            let len = desc.length();

            let new_buf = pool.pop();
            if new_buf.is_empty() {
                self.rx_underruns += 1;
                debug!(
                    "{}: rx queue {} starved, pool {} is empty",
                    self.pci_addr,
                    queue_id,
                    pool.id()
                );
                break;
            }
            desc.arm(new_buf.dma_address());

            let mut full = mem::replace(&mut queue.bufs_in_use[rx_index], new_buf);
            full.set_size(len);
            full.prefetch(Prefetch::Time0);
            *slot = full;

            last_rx_index = rx_index;
            rx_index = (rx_index + 1) & (QS - 1);
            received += 1;
        }

        if received > 0 {
            // Armed descriptors must be visible before the tail moves.
            fence(Ordering::Release);
            self.mmio
                .set_reg(ixgbe_rdt(queue_id as u32), last_rx_index as u32);
            queue.rx_index = rx_index;
        }
        Ok(received)
    }

    /// Queues up to `bufs.len()` packets on queue `queue_id`.
    ///
    /// Completed descriptors are cleaned first, returning their buffers to
    /// the owning pools. Returns how many buffers were posted; ownership of
    /// those passes to the driver, and they go back to their pool once the
    /// NIC reports them sent. Never blocks: a full ring simply posts fewer.
    pub fn tx_batch(&mut self, queue_id: u16, bufs: &[PacketBuffer]) -> Result<usize> {
        let queue = self
            .tx_queues
            .get_mut(queue_id as usize)
            .ok_or(Error::InvalidQueue(queue_id))?;

        clean_tx_queue::<H, QS>(queue);

        let mut sent = 0;
        let mut tx_index = queue.tx_index;
        for buf in bufs {
            assert!(!buf.is_empty(), "cannot transmit the empty sentinel");
            let next = (tx_index + 1) & (QS - 1);
            if next == queue.clean_index {
                // Full: one slot of slack keeps tx_index != clean_index
                // from being ambiguous.
                break;
            }
            let desc = unsafe { &mut *queue.descriptors.virt().as_ptr().add(tx_index) };
            desc.send(buf.dma_address(), buf.size() as u16);
            queue.bufs_in_use[tx_index] = buf.clone();
            tx_index = next;
            sent += 1;
        }

        if sent > 0 {
            fence(Ordering::Release);
            self.mmio.set_reg(ixgbe_tdt(queue_id as u32), tx_index as u32);
            queue.tx_index = tx_index;
        }
        Ok(sent)
    }

    fn link_speed(&self) -> u16 {
        let links = self.mmio.get_reg(IXGBE_LINKS);
        if links & IXGBE_LINKS_UP == 0 {
            return 0;
        }
        match links & IXGBE_LINKS_SPEED_MASK {
            IXGBE_LINKS_SPEED_100 => 100,
            IXGBE_LINKS_SPEED_1G => 1_000,
            IXGBE_LINKS_SPEED_10G => 10_000,
            _ => 0,
        }
    }

    fn wait_for_link(&self) {
        info!("{}: waiting for link", self.pci_addr);
        let deadline = Instant::now() + LINK_TIMEOUT;
        while Instant::now() < deadline {
            let speed = self.link_speed();
            if speed != 0 {
                info!("{}: link up at {} Mbit/s", self.pci_addr, speed);
                return;
            }
            thread::sleep(LINK_POLL_INTERVAL);
        }
        warn!("{}: link is still down, continuing anyway", self.pci_addr);
    }
}

/// Walks completed descriptors from `clean_index` and returns their buffers
/// to the owning pools, in chunks of [`TX_CLEAN_BATCH`].
fn clean_tx_queue<H: OsMem, const QS: usize>(queue: &mut TxQueue<H>) -> usize {
    let mut cleaned = 0;
    let mut clean_index = queue.clean_index;
    let mut batch = Vec::with_capacity(TX_CLEAN_BATCH);

    while clean_index != queue.tx_index {
        let desc = unsafe { &*queue.descriptors.virt().as_ptr().add(clean_index) };
        if !desc.descriptor_done() {
            break;
        }
        let buf = mem::replace(&mut queue.bufs_in_use[clean_index], PacketBuffer::empty());
        batch.push(buf);
        if batch.len() == TX_CLEAN_BATCH {
            return_to_pools(&mut batch);
        }
        clean_index = (clean_index + 1) & (QS - 1);
        cleaned += 1;
    }

    return_to_pools(&mut batch);
    queue.clean_index = clean_index;
    cleaned
}

/// Pushes a cleaned batch back, caching the pool lookup since consecutive
/// buffers almost always share one.
fn return_to_pools(batch: &mut Vec<PacketBuffer>) {
    let mut cached: Option<Arc<MemPool>> = None;
    for buf in batch.drain(..) {
        let id = buf.pool_id();
        if cached.as_ref().map_or(true, |pool| pool.id() != id) {
            cached = MemPool::find(id);
        }
        match &cached {
            Some(pool) => {
                pool.push(buf);
            }
            None => error!("no live memory pool with id {id}, leaking buffer"),
        }
    }
}

impl<H: OsMem, const QS: usize> Device for IxgbeDevice<H, QS> {
    fn driver_name(&self) -> &str {
        DRIVER_NAME
    }

    fn pci_address(&self) -> &str {
        &self.pci_addr
    }

    fn is_supported(&self) -> bool {
        true
    }

    fn allocate(&mut self) -> Result {
        if self.state == DeviceState::Running {
            debug!("{}: device is already initialized", self.pci_addr);
            return Ok(());
        }
        self.reset_and_init()
    }

    fn add_rx_pool(&mut self, queue_id: u16, pool: Arc<MemPool>) -> Result {
        IxgbeDevice::add_rx_pool(self, queue_id, pool)
    }

    fn read_stats(&mut self, stats: &mut DeviceStats) {
        stats.rx_pkts += self.mmio.get_reg(IXGBE_GPRC) as u64;
        stats.tx_pkts += self.mmio.get_reg(IXGBE_GPTC) as u64;
        stats.rx_bytes +=
            self.mmio.get_reg(IXGBE_GORCL) as u64 + ((self.mmio.get_reg(IXGBE_GORCH) as u64) << 32);
        stats.tx_bytes +=
            self.mmio.get_reg(IXGBE_GOTCL) as u64 + ((self.mmio.get_reg(IXGBE_GOTCH) as u64) << 32);
    }

    fn reset_stats(&mut self) {
        // The counters clear on read.
        let mut scratch = DeviceStats::default();
        self.read_stats(&mut scratch);
    }

    fn is_promiscuous(&self) -> bool {
        let mask = IXGBE_FCTRL_MPE | IXGBE_FCTRL_UPE;
        self.mmio.get_reg(IXGBE_FCTRL) & mask == mask
    }

    fn enable_promiscuous(&mut self) {
        self.mmio
            .set_flags(IXGBE_FCTRL, IXGBE_FCTRL_MPE | IXGBE_FCTRL_UPE);
        debug!("{}: promiscuous mode on", self.pci_addr);
    }

    fn disable_promiscuous(&mut self) {
        self.mmio
            .clear_flags(IXGBE_FCTRL, IXGBE_FCTRL_MPE | IXGBE_FCTRL_UPE);
        debug!("{}: promiscuous mode off", self.pci_addr);
    }

    fn get_link_speed(&self) -> u16 {
        self.link_speed()
    }

    fn get_mac_addr(&self) -> [u8; 6] {
        let low = self.mmio.get_reg(IXGBE_RAL0);
        let high = self.mmio.get_reg(IXGBE_RAH0);
        [
            low as u8,
            (low >> 8) as u8,
            (low >> 16) as u8,
            (low >> 24) as u8,
            high as u8,
            (high >> 8) as u8,
        ]
    }

    fn set_mac_addr(&mut self, mac: [u8; 6]) {
        let low = u32::from_le_bytes([mac[0], mac[1], mac[2], mac[3]]);
        let high = mac[4] as u32 | (mac[5] as u32) << 8;
        self.mmio.set_reg(IXGBE_RAL0, low);
        self.mmio.set_reg(IXGBE_RAH0, high);
    }

    fn rx_batch(&mut self, queue_id: u16, bufs: &mut [PacketBuffer]) -> Result<usize> {
        IxgbeDevice::rx_batch(self, queue_id, bufs)
    }

    fn tx_batch(&mut self, queue_id: u16, bufs: &[PacketBuffer]) -> Result<usize> {
        IxgbeDevice::tx_batch(self, queue_id, bufs)
    }
}

impl<H: OsMem, const QS: usize> Drop for IxgbeDevice<H, QS> {
    fn drop(&mut self) {
        if self.state == DeviceState::Running {
            // Quiesce DMA before the BAR0 mapping and the rings go away.
            self.mmio.clear_flags(IXGBE_RXCTRL, IXGBE_RXCTRL_RXEN);
            self.mmio.clear_flags(IXGBE_DMATXCTL, IXGBE_DMATXCTL_TE);
            debug!("{}: device stopped", self.pci_addr);
        }
    }
}
