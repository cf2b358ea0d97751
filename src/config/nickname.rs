//! Random nickname generator.
//!
//! Nicknames are nine ASCII letters, short enough for servers that still
//! enforce the classic 9-character limit.

use rand::RngExt;

const NICK_LEN: usize = 9;
const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Generate a random nickname like `qTmwKzaPe`.
pub fn generate_nickname() -> String {
    let mut rng = rand::rng();
    (0..NICK_LEN)
        .map(|_| LETTERS[rng.random_range(0..LETTERS.len())] as char)
        .collect()
}
