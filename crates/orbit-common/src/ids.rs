use rand::RngCore;

/// A fresh random 128-bit id, hex-encoded. Used wherever the hub must mint
/// an id it was not handed: an unaddressed anchor's id (spec.md §4.5.1), a
/// missing `item.id` (spec.md §4.6).
pub fn random_hex_128() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// A short random hex suffix, used for multi-dispatch inner request ids:
/// `"<outer>:<anchor>:<8-hex>"` (spec.md §4.4 step 3).
pub fn random_hex_suffix() -> String {
    let mut bytes = [0u8; 4];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_hex_128_is_32_hex_chars() {
        let id = random_hex_128();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn random_hex_suffix_is_8_hex_chars() {
        let suffix = random_hex_suffix();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
