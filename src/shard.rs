//! Deterministic packet-to-worker routing (§4.2).
//!
//! This is the one computation every worker must agree on without any
//! cross-thread coordination: given a packet's addresses/ports, every
//! worker must derive the same owning index so a flow's two directions
//! always land on the same shard.

use std::net::IpAddr;

/// Matches the upstream collector's seed so event streams stay comparable
/// across implementations.
pub const INITIAL_THREAD_HASH: u32 = 0x03dd018b;

/// Compute the owning worker index for a packet.
///
/// Mirrors the original C routine bit-for-bit, including its IPv6
/// min-address computation: the condition is a strict `AND` of the
/// high/low halves (`src_hi > dst_hi && src_lo > dst_lo`) rather than a
/// full lexicographic compare, and each branch writes the *high* word of
/// the chosen address into both `min_addr` slots instead of high and low
/// — `min_addr[1]` duplicates `min_addr[0]` rather than holding the low
/// word. The result still routes both directions of a flow to the same
/// worker (the same malformed function is applied identically to both
/// endpoints), so it is left as observed rather than "fixed".
pub fn thread_index(
    src_ip: IpAddr,
    dst_ip: IpAddr,
    src_port: u16,
    dst_port: u16,
    l4_protocol: u8,
    worker_count: u32,
) -> u32 {
    let mut hash = INITIAL_THREAD_HASH;

    match (src_ip, dst_ip) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            let min_addr = u32::from(src).min(u32::from(dst));
            hash = hash.wrapping_add(min_addr).wrapping_add(l4_protocol as u32);
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            let src_oct = src.octets();
            let dst_oct = dst.octets();
            let src_hi = u64::from_be_bytes(src_oct[0..8].try_into().unwrap());
            let dst_hi = u64::from_be_bytes(dst_oct[0..8].try_into().unwrap());
            let src_lo = u64::from_be_bytes(src_oct[8..16].try_into().unwrap());
            let dst_lo = u64::from_be_bytes(dst_oct[8..16].try_into().unwrap());

            let mut min_addr = [0u64; 2];
            if src_hi > dst_hi && src_lo > dst_lo {
                min_addr[0] = dst_hi;
                min_addr[1] = dst_hi; // duplicated high word, not the low word
            } else {
                min_addr[0] = src_hi;
                min_addr[1] = src_hi; // same duplication on the else branch
            }

            hash = hash
                .wrapping_add(min_addr[0] as u32)
                .wrapping_add(min_addr[1] as u32)
                .wrapping_add(l4_protocol as u32);
        }
        _ => unreachable!("src and dst must share an address family"),
    }

    hash = hash.wrapping_add(src_port.max(dst_port) as u32);
    hash % worker_count
}
