use rand::Rng;
use uuid::Uuid;

/// New time-ordered entity id.
///
/// UUIDv7 embeds a millisecond timestamp in the most significant bits, so
/// sorting ids lexicographically sorts rows by creation time. Supersession
/// relies on this: "newest deployment" is simply `ORDER BY id DESC`.
pub fn new_id() -> Uuid {
    Uuid::now_v7()
}

const SLUG_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const SLUG_LEN: usize = 8;

/// Short human-readable deployment slug, e.g. `k3x90ahq`.
///
/// Lowercase alphanumeric so it can appear verbatim in hostnames.
pub fn short_slug() -> String {
    let mut rng = rand::thread_rng();
    (0..SLUG_LEN)
        .map(|_| SLUG_CHARS[rng.gen_range(0..SLUG_CHARS.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_time_ordered() {
        let a = new_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = new_id();
        assert!(a < b, "later id must sort after earlier id");
    }

    #[test]
    fn test_slug_is_hostname_safe() {
        for _ in 0..100 {
            let slug = short_slug();
            assert_eq!(slug.len(), SLUG_LEN);
            assert!(slug
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        }
    }

    #[test]
    fn test_slugs_are_distinct() {
        let a = short_slug();
        let b = short_slug();
        // 36^8 values; two consecutive draws colliding means the RNG broke.
        assert_ne!(a, b);
    }
}
