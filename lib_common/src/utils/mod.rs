//! General helpers shared across the workspace.

use rand::Rng;

/// Generates a provisional message token: epoch millis plus a random hex
/// suffix, unique for the lifetime of the process with overwhelming odds.
pub fn provisional_token() -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let suffix: u32 = rand::rng().random();
    format!("{}-{:08x}", millis, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_distinct() {
        let a = provisional_token();
        let b = provisional_token();
        assert_ne!(a, b);
    }
}
