use std::time::{Duration, SystemTime};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

pub fn duration_from_epoch_now() -> Duration {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
}

/// An opaque, url-safe random artifact string. 48 random bytes give 64
/// base64url characters, comfortably above the 32 character floor for
/// authorisation codes.
pub fn generate_opaque_token() -> String {
    let mut buf = [0u8; 48];
    thread_rng().fill(&mut buf[..]);
    URL_SAFE_NO_PAD.encode(buf)
}

/// A short random alphanumeric value for state / nonce parameters.
pub fn generate_state() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(24)
        .map(char::from)
        .collect()
}

/// RFC 4648 base32, lowercased, unpadded. This matches the derivation the
/// surrounding user services expect for usernames.
pub fn base32_nopad_lower(data: &[u8]) -> String {
    const ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";
    let mut out = String::with_capacity(data.len().div_ceil(5) * 8);
    for chunk in data.chunks(5) {
        let mut buf = [0u8; 5];
        buf[..chunk.len()].copy_from_slice(chunk);
        let bits = u64::from(buf[0]) << 32
            | u64::from(buf[1]) << 24
            | u64::from(buf[2]) << 16
            | u64::from(buf[3]) << 8
            | u64::from(buf[4]);
        // 8 output chars per 5 input bytes; truncate for the tail.
        let n_chars = match chunk.len() {
            1 => 2,
            2 => 4,
            3 => 5,
            4 => 7,
            _ => 8,
        };
        for i in 0..n_chars {
            let idx = ((bits >> (35 - 5 * i)) & 0x1f) as usize;
            out.push(ALPHABET[idx] as char);
        }
    }
    out
}
