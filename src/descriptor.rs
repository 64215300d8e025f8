//! Advanced receive and transmit descriptor layouts.
//!
//! Both descriptors are 16 bytes and live in DMA memory owned by the NIC, so
//! every field is wrapped in [`Volatile`]. The same 16 bytes are interpreted
//! differently before and after hardware writeback: the driver writes the
//! *read* format (buffer addresses) and the NIC overwrites it with the
//! *writeback* format (status, length). The accessors below hide that
//! aliasing; the fields stay public so tests can build descriptor images
//! directly.

use bit_field::BitField;
use volatile::Volatile;

/// Size in bytes of one descriptor, both formats, both directions.
pub const DESCRIPTOR_SIZE: usize = 16;

/// Descriptor done: the NIC finished DMA for this slot.
pub const RX_STATUS_DD: u32 = 1 << 0;
/// End of packet: this slot holds the final fragment of a frame.
pub const RX_STATUS_EOP: u32 = 1 << 1;

/// Descriptor done bit of the TX writeback STA field.
pub const TX_STATUS_DD: u32 = 1 << 0;

/// End of packet command bit.
pub const TX_CMD_EOP: u8 = 1 << 0;
/// Insert FCS/CRC command bit.
pub const TX_CMD_IFCS: u8 = 1 << 1;
/// Report status (request DD writeback) command bit.
pub const TX_CMD_RS: u8 = 1 << 3;
/// Descriptor extension bit: this is an advanced descriptor.
pub const TX_CMD_DEXT: u8 = 1 << 5;

/// Advanced data descriptor type, pre-shifted into the DTYP field.
pub const TX_DTYP_ADV: u8 = 0x3 << 4;

/// Shift of the PAYLEN field within the upper 32 bits of a TX descriptor.
pub const TX_PAYLEN_SHIFT: u32 = 46 - 32;

/// Advanced receive descriptor (one-buffer mode).
///
/// Read format: `[packet buffer address][header buffer address]`. Writeback
/// format overlays status/error in the low half of the second quadword and
/// the packet length in bits 32..48 of it.
#[repr(C)]
pub struct AdvancedRxDescriptor {
    /// Read: DMA address the NIC writes packet data to. Writeback: RSS hash
    /// and packet type info, which this driver ignores.
    pub packet_buffer_address: Volatile<u64>,
    /// Read: split-header address, unused in one-buffer mode and kept zero.
    /// Writeback: status/error, length and VLAN tag.
    pub header_buffer_address: Volatile<u64>,
}

impl AdvancedRxDescriptor {
    /// Arms the descriptor for the NIC: points it at `buffer_addr` and
    /// clears the old writeback status so a stale DD bit cannot be read.
    pub fn arm(&mut self, buffer_addr: u64) {
        self.packet_buffer_address.write(buffer_addr);
        self.header_buffer_address.write(0);
    }

    /// Whether the NIC has completed this descriptor.
    pub fn descriptor_done(&self) -> bool {
        self.header_buffer_address.read() & RX_STATUS_DD as u64 != 0
    }

    /// Whether this descriptor holds the last fragment of its frame.
    pub fn end_of_packet(&self) -> bool {
        self.header_buffer_address.read() & RX_STATUS_EOP as u64 != 0
    }

    /// Received frame length in bytes, from the writeback format.
    pub fn length(&self) -> u32 {
        self.header_buffer_address.read().get_bits(32..48) as u32
    }
}

/// Advanced transmit descriptor (data descriptor only; this driver never
/// emits context descriptors).
///
/// The 16 bytes split into the buffer address and a command/length quadword.
/// The writeback format reuses bit 32 of the second quadword as DD, which is
/// bit 0 of [`AdvancedTxDescriptor::paylen_popts_cc_idx_sta`].
#[repr(C)]
pub struct AdvancedTxDescriptor {
    /// DMA address of the frame to send.
    pub packet_buffer_address: Volatile<u64>,
    /// Length of the buffer referenced by this descriptor.
    pub data_len: Volatile<u16>,
    /// Descriptor type and MAC options; always [`TX_DTYP_ADV`] here.
    pub dtyp_mac_rsv: Volatile<u8>,
    /// Descriptor command byte (EOP/IFCS/RS/DEXT).
    pub dcmd: Volatile<u8>,
    /// Payload length, offload options and, after writeback, the STA field.
    pub paylen_popts_cc_idx_sta: Volatile<u32>,
}

impl AdvancedTxDescriptor {
    /// Fills the descriptor for a single-buffer frame of `len` bytes at
    /// `buffer_addr`.
    ///
    /// RS is requested on every descriptor so each slot's DD writeback can
    /// be observed individually when cleaning the ring.
    pub fn send(&mut self, buffer_addr: u64, len: u16) {
        self.packet_buffer_address.write(buffer_addr);
        self.data_len.write(len);
        self.dtyp_mac_rsv.write(TX_DTYP_ADV);
        self.paylen_popts_cc_idx_sta
            .write((len as u32) << TX_PAYLEN_SHIFT);
        self.dcmd
            .write(TX_CMD_DEXT | TX_CMD_RS | TX_CMD_IFCS | TX_CMD_EOP);
    }

    /// Whether the NIC has finished transmitting this descriptor.
    pub fn descriptor_done(&self) -> bool {
        self.paylen_popts_cc_idx_sta.read() & TX_STATUS_DD != 0
    }

    /// Clears the descriptor, dropping any stale writeback state.
    pub fn reset(&mut self) {
        self.packet_buffer_address.write(0);
        self.data_len.write(0);
        self.dtyp_mac_rsv.write(0);
        self.dcmd.write(0);
        self.paylen_popts_cc_idx_sta.write(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::size_of;

    #[test]
    fn descriptors_are_16_bytes() {
        assert_eq!(size_of::<AdvancedRxDescriptor>(), DESCRIPTOR_SIZE);
        assert_eq!(size_of::<AdvancedTxDescriptor>(), DESCRIPTOR_SIZE);
    }

    #[test]
    fn tx_command_bits_match_datasheet_positions() {
        // Bits 24/25/27/29 of the full cmd_type_len word, expressed within
        // the command byte.
        assert_eq!(TX_CMD_EOP, 0x01);
        assert_eq!(TX_CMD_IFCS, 0x02);
        assert_eq!(TX_CMD_RS, 0x08);
        assert_eq!(TX_CMD_DEXT, 0x20);
    }
}
