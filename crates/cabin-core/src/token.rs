//! Short opaque identifiers for connections, watchers, and events.
//!
//! The control protocol hands clients 7-character base36 tokens as
//! `wsId` / `watcherId` values and stamps push events with the same kind
//! of id. Tokens are random, not derived from any input: they identify a
//! live in-process resource and never need to be reproducible.

const ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Length of every generated token.
pub const TOKEN_LEN: usize = 7;

/// Generate a fresh 7-character base36 token.
pub fn new_token() -> String {
    encode_base36(rand::random::<u64>())
}

/// Encode a u64 into exactly [`TOKEN_LEN`] base36 characters.
///
/// The value is reduced modulo 36^7 and left-padded with `'0'`, so the
/// output width is fixed regardless of input.
fn encode_base36(value: u64) -> String {
    const SPACE: u64 = 36u64.pow(TOKEN_LEN as u32);

    let mut value = value % SPACE;
    let mut out = [b'0'; TOKEN_LEN];

    for slot in out.iter_mut().rev() {
        *slot = ALPHABET[(value % 36) as usize];
        value /= 36;
    }

    // The buffer only ever holds alphabet bytes, which are ASCII.
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_have_fixed_length() {
        for _ in 0..64 {
            assert_eq!(new_token().len(), TOKEN_LEN);
        }
    }

    #[test]
    fn tokens_use_base36_alphabet() {
        for _ in 0..64 {
            let token = new_token();
            assert!(token
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()));
        }
    }

    #[test]
    fn encoding_is_stable_and_padded() {
        assert_eq!(encode_base36(0), "0000000");
        assert_eq!(encode_base36(35), "000000z");
        assert_eq!(encode_base36(36), "0000010");
        // Values beyond the token space wrap around.
        assert_eq!(encode_base36(36u64.pow(7)), "0000000");
    }

    #[test]
    fn consecutive_tokens_differ() {
        // Not a uniqueness proof, just a sanity check that the generator
        // is not returning a constant.
        let a = new_token();
        let b = new_token();
        let c = new_token();
        assert!(a != b || b != c);
    }
}
