//! Friendly ids shown to users: `<prefix>_<random suffix>`.

use rand::RngExt;

use crate::limits::FRIENDLY_ID_LENGTH;

// No 0/l to keep ids unambiguous when read aloud.
const ALPHABET: &[u8] = b"123456789abcdefghijkmnopqrstuvwxyz";

pub fn generate(prefix: &str) -> String {
    let mut rng = rand::rng();
    let suffix: String = (0..FRIENDLY_ID_LENGTH)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect();
    format!("{prefix}_{suffix}")
}

/// Internal row id.
pub fn internal_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
