//! Descriptor encoding and writeback parsing, against hand-built 16-byte
//! images.

use ixgbe_userspace::descriptor::*;
use volatile::Volatile;

fn blank_rx() -> AdvancedRxDescriptor {
    AdvancedRxDescriptor {
        packet_buffer_address: Volatile::new(0),
        header_buffer_address: Volatile::new(0),
    }
}

fn blank_tx() -> AdvancedTxDescriptor {
    AdvancedTxDescriptor {
        packet_buffer_address: Volatile::new(0),
        data_len: Volatile::new(0),
        dtyp_mac_rsv: Volatile::new(0),
        dcmd: Volatile::new(0),
        paylen_popts_cc_idx_sta: Volatile::new(0),
    }
}

#[test]
fn rx_arm_points_at_buffer_and_clears_status() {
    let mut desc = blank_rx();
    desc.header_buffer_address.write(u64::MAX);

    desc.arm(0xDEAD_B000);

    assert_eq!(desc.packet_buffer_address.read(), 0xDEAD_B000);
    assert_eq!(desc.header_buffer_address.read(), 0);
    assert!(!desc.descriptor_done());
}

#[test]
fn rx_status_bits_parse_independently() {
    let mut desc = blank_rx();
    assert!(!desc.descriptor_done());
    assert!(!desc.end_of_packet());

    desc.header_buffer_address.write(RX_STATUS_DD as u64);
    assert!(desc.descriptor_done());
    assert!(!desc.end_of_packet());

    desc.header_buffer_address
        .write((RX_STATUS_DD | RX_STATUS_EOP) as u64);
    assert!(desc.descriptor_done());
    assert!(desc.end_of_packet());
}

#[test]
fn rx_length_lives_in_bits_32_to_48() {
    let mut desc = blank_rx();
    desc.header_buffer_address
        .write((1500u64 << 32) | RX_STATUS_DD as u64);
    assert_eq!(desc.length(), 1500);

    // A VLAN tag above bit 48 must not leak into the length.
    desc.header_buffer_address
        .write((0xFFFFu64 << 48) | (60u64 << 32) | RX_STATUS_DD as u64);
    assert_eq!(desc.length(), 60);
}

#[test]
fn tx_send_encodes_the_whole_command() {
    let mut desc = blank_tx();
    desc.send(0xDEAD_B000, 1500);

    assert_eq!(desc.packet_buffer_address.read(), 0xDEAD_B000);
    assert_eq!(desc.data_len.read(), 1500);
    assert_eq!(desc.dtyp_mac_rsv.read(), TX_DTYP_ADV);
    assert_eq!(
        desc.paylen_popts_cc_idx_sta.read(),
        1500u32 << TX_PAYLEN_SHIFT
    );
    assert_eq!(
        desc.dcmd.read(),
        TX_CMD_DEXT | TX_CMD_RS | TX_CMD_IFCS | TX_CMD_EOP
    );
}

#[test]
fn tx_send_always_requests_writeback() {
    let mut desc = blank_tx();
    desc.send(0x1000, 60);
    assert_ne!(desc.dcmd.read() & TX_CMD_RS, 0);
}

#[test]
fn tx_done_reads_the_sta_field() {
    let mut desc = blank_tx();
    desc.send(0x1000, 60);
    assert!(!desc.descriptor_done());

    // The NIC overwrites the upper word on completion.
    desc.paylen_popts_cc_idx_sta.write(TX_STATUS_DD);
    assert!(desc.descriptor_done());

    desc.reset();
    assert!(!desc.descriptor_done());
    assert_eq!(desc.packet_buffer_address.read(), 0);
}

#[test]
fn payload_length_shift_matches_the_datasheet() {
    // PAYLEN starts at bit 46 of the descriptor, bit 14 of the upper word.
    assert_eq!(TX_PAYLEN_SHIFT, 14);
    assert_eq!(TX_DTYP_ADV, 0x30);
}
