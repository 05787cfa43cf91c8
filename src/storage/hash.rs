//! Short ASCII station/product IDs packed into the data_type space
//!
//! The 4-char hash packs raw bytes little-end first and is always positive
//! for ASCII input. The 5-char hash packs 6-bit codes for `[-0-9A-Za-z]` and
//! is negated, so the two schemes never collide with each other or with
//! positive numeric types. Neither produces 0, the wildcard type, for a
//! non-empty ID.

/// Pack up to the first 4 bytes of `id`. The empty ID maps to 0.
pub fn hash_4chars_to_i32(id: &str) -> i32 {
    let bytes = c_bytes(id);
    if bytes.is_empty() {
        return 0;
    }
    let value = bytes
        .iter()
        .take(4)
        .enumerate()
        .fold(0u32, |acc, (i, &b)| acc | (u32::from(b) << (i * 8)));
    if value == 0 {
        1
    } else {
        value as i32
    }
}

/// Inverse of [`hash_4chars_to_i32`]
pub fn dehash_i32_to_4chars(value: i32) -> String {
    let bytes = (value as u32).to_le_bytes();
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Pack up to the first 5 characters of `id` as 6-bit codes, negated.
///
/// Characters outside `[-0-9A-Za-z]` pack as 0, which ends the ID when
/// dehashed. An empty ID, or one with no packable characters, maps to -1.
pub fn hash_5chars_to_i32(id: &str) -> i32 {
    let value = c_bytes(id)
        .iter()
        .take(5)
        .enumerate()
        .fold(0i32, |acc, (i, &b)| acc | (i32::from(pack6(b)) << (i * 6)));
    if value == 0 {
        -1
    } else {
        -value
    }
}

/// Inverse of [`hash_5chars_to_i32`]
pub fn dehash_i32_to_5chars(value: i32) -> String {
    let packed = value.wrapping_neg();
    let mut out = String::with_capacity(5);
    for i in 0..5 {
        match unpack6(((packed >> (i * 6)) & 0x3f) as u8) {
            Some(c) => out.push(c),
            None => break,
        }
    }
    out
}

/// Bytes up to the first NUL
fn c_bytes(id: &str) -> &[u8] {
    let bytes = id.as_bytes();
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    &bytes[..end]
}

fn pack6(b: u8) -> u8 {
    match b {
        b'a'..=b'z' => b - 59,
        b'A'..=b'Z' => b - 53,
        b'0'..=b'9' => b - 46,
        b'-' => 1,
        _ => 0,
    }
}

fn unpack6(code: u8) -> Option<char> {
    let b = match code {
        38..=63 => code + 59,
        12..=37 => code + 53,
        2..=11 => code + 46,
        1 => b'-',
        _ => return None,
    };
    Some(b as char)
}
