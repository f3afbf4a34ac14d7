//! Bearer credential checks for the upgrade endpoint.
//!
//! Credential issuance is external. Without a token table the bridge only
//! checks the credential's shape; with one, the credential must be listed and
//! maps to the user it was issued to.

use std::collections::HashMap;

/// User id assumed when credentials are shape-checked only.
pub const DEFAULT_USER_ID: u32 = 1;

pub const DEFAULT_MIN_TOKEN_LENGTH: usize = 32;

#[derive(Debug, Clone)]
pub struct BearerPolicy {
    min_len: usize,
    tokens: HashMap<String, u32>,
}

impl BearerPolicy {
    pub fn new(min_len: usize, tokens: impl IntoIterator<Item = (String, u32)>) -> Self {
        Self {
            min_len,
            tokens: tokens.into_iter().collect(),
        }
    }

    /// Resolve a presented credential to a user id.
    pub fn resolve(&self, credential: &str) -> Option<u32> {
        if credential.len() < self.min_len {
            return None;
        }
        if self.tokens.is_empty() {
            return Some(DEFAULT_USER_ID);
        }
        self.tokens.get(credential).copied()
    }
}

impl Default for BearerPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_TOKEN_LENGTH, [])
    }
}
