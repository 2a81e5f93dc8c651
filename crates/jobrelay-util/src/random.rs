//! Small random helpers, the Rust equivalent of hither2's `_random_string`
//! (used to name temporary docker containers so concurrent runs don't
//! collide).

use rand::distributions::Alphanumeric;
use rand::Rng;

pub fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}
