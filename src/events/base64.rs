//! Base64 encoding of captured packet bytes for `pkt` fields (§4.8).

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

/// Scratch budget for one packet's base64 payload, matching the upstream
/// collector's fixed serializer buffer.
pub const MAX_PKT_SCRATCH_BYTES: usize = 8192;

/// Encode raw packet bytes. Returns `None` (surfaced upstream as
/// `pkt_oversize = true`, `pkt` field omitted) if the RFC 4648 output
/// would not fit the scratch budget.
pub fn encode_packet(data: &[u8]) -> Option<String> {
    let encoded_len = encoded_length(data.len());
    if encoded_len > MAX_PKT_SCRATCH_BYTES {
        return None;
    }
    Some(STANDARD.encode(data))
}

/// `ceil(n/3) * 4`, the RFC 4648 length law (§8 "Round trips").
pub fn encoded_length(input_len: usize) -> usize {
    input_len.div_ceil(3) * 4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_law_holds() {
        for len in 0..40 {
            let data = vec![0u8; len];
            let encoded = STANDARD.encode(&data);
            assert_eq!(encoded.len(), encoded_length(len));
        }
    }

    #[test]
    fn round_trips() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let encoded = encode_packet(data).unwrap();
        let decoded = STANDARD.decode(encoded).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn oversize_input_returns_none() {
        let data = vec![0u8; MAX_PKT_SCRATCH_BYTES];
        assert!(encode_packet(&data).is_none());
    }
}
