//! Wire framing: `"<decimal-length><json-object>\n"` (§4.6, §6).

/// Frame a JSON object for the wire. `json` must be the exact bytes the
/// collector is meant to parse — no whitespace is added around it.
pub fn frame(json: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(json.len() + 12);
    out.extend_from_slice(json.len().to_string().as_bytes());
    out.extend_from_slice(json.as_bytes());
    out.push(b'\n');
    out
}

/// Parse one frame from the front of `buf`, returning the JSON slice and
/// the number of bytes consumed (including the trailing newline), or
/// `None` if `buf` does not yet hold a complete frame.
pub fn parse_frame(buf: &[u8]) -> Option<(&[u8], usize)> {
    let digit_end = buf.iter().position(|b| !b.is_ascii_digit())?;
    if digit_end == 0 {
        return None;
    }
    let len: usize = std::str::from_utf8(&buf[..digit_end]).ok()?.parse().ok()?;

    let json_start = digit_end;
    let json_end = json_start.checked_add(len)?;
    if buf.len() <= json_end {
        return None;
    }
    if buf[json_end] != b'\n' {
        return None;
    }
    Some((&buf[json_start..json_end], json_end + 1))
}
