//! Builders for wire-valid IPv4/TCP packets shared by the test modules.

use crate::rewriter::{ip_checksum, tcp_checksum};

/// Minimal-header IPv4/TCP packet (no options) with correct length and
/// checksum fields, PSH|ACK flags and the given payload.
pub fn tcp_packet(
    src: [u8; 4],
    dst: [u8; 4],
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    payload: &[u8],
) -> Vec<u8> {
    let total_len = 40 + payload.len();
    let mut pkt = vec![0u8; 40];

    pkt[0] = 0x45; // v4, IHL 5
    pkt[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    pkt[6] = 0x40; // DF
    pkt[8] = 64; // TTL
    pkt[9] = 6; // TCP
    pkt[12..16].copy_from_slice(&src);
    pkt[16..20].copy_from_slice(&dst);

    pkt[20..22].copy_from_slice(&src_port.to_be_bytes());
    pkt[22..24].copy_from_slice(&dst_port.to_be_bytes());
    pkt[24..28].copy_from_slice(&seq.to_be_bytes());
    pkt[28..32].copy_from_slice(&ack.to_be_bytes());
    pkt[32] = 0x50; // data offset 5
    pkt[33] = 0x18; // PSH|ACK
    pkt[34..36].copy_from_slice(&0xFFFFu16.to_be_bytes()); // window

    pkt.extend_from_slice(payload);

    let ip_sum = ip_checksum(&pkt[..20]);
    pkt[10..12].copy_from_slice(&ip_sum.to_be_bytes());
    let tcp_sum = tcp_checksum(&pkt[..20], &pkt[20..]);
    pkt[36..38].copy_from_slice(&tcp_sum.to_be_bytes());

    pkt
}
