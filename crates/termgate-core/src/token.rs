//! Session tokens.
//!
//! Every bridged session gets an opaque token that keys its audit record.
//! Tokens are 16 random bytes, hex encoded.

use rand::Rng;

/// Length in characters of a generated token.
pub const SESSION_TOKEN_LEN: usize = 32;

/// Generate a fresh session token.
pub fn generate_session_token() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; SESSION_TOKEN_LEN / 2] = rng.gen();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn token_shape() {
        let token = generate_session_token();
        assert_eq!(token.len(), SESSION_TOKEN_LEN);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn tokens_are_distinct() {
        let tokens: HashSet<String> = (0..256).map(|_| generate_session_token()).collect();
        assert_eq!(tokens.len(), 256);
    }
}
