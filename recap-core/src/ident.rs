use rand::distributions::Alphanumeric;
use rand::Rng;

/// Length of recording identifiers when the config does not say otherwise.
pub const DEFAULT_ID_LENGTH: usize = 10;

/// Generates an identifier of `length` characters drawn from `[0-9A-Za-z]`.
///
/// With 62 symbols a 10-character id carries ~59.5 bits of entropy, which keeps
/// collisions negligible for per-user session volume. Callers that persist the id
/// still retry on a uniqueness violation.
pub fn generate_id(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn ids_have_requested_length_and_alphabet() {
        for length in [4, DEFAULT_ID_LENGTH, 32] {
            let id = generate_id(length);
            assert_eq!(id.len(), length);
            assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
        }
    }

    #[test]
    fn ids_do_not_repeat_in_practice() {
        let ids: HashSet<String> = (0..2_000).map(|_| generate_id(DEFAULT_ID_LENGTH)).collect();
        assert_eq!(ids.len(), 2_000);
    }
}
