//! Sortable, process-unique identifiers for lock holders and temporary files.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

const SALT_BITS: u32 = 32;
static TOKEN_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a token that sorts by creation time and is unique within this
/// process (the pid and a sequence number fill the low bits).
pub fn generate_token() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let pid_component = (std::process::id() as u128 & 0xFFFF) << (SALT_BITS - 16);
    let seq_component = (TOKEN_COUNTER.fetch_add(1, Ordering::Relaxed) as u128) & 0xFFFF;
    let entropy = (nanos << SALT_BITS) | pid_component | seq_component;
    base62_encode_u128(entropy)
}

fn base62_encode_u128(mut value: u128) -> String {
    const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut bytes = Vec::new();
    while value > 0 {
        let idx = (value % 62) as usize;
        bytes.push(ALPHABET[idx] as char);
        value /= 62;
    }
    bytes.iter().rev().collect()
}
