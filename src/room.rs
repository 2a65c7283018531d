//! Room identity allocation

/// Room code alphabet. Excludes visually confusable characters (0/O, 1/I)
/// so codes survive being read aloud or typed from a screen.
pub const ROOM_CODE_CHARS: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Room code length in characters.
pub const ROOM_CODE_LENGTH: usize = 6;

/// Generates a random 6-character room code.
///
/// No uniqueness check is made against other live rooms; with 32^6
/// combinations a collision between two concurrent matches is rare enough to
/// accept for a casual two-friend game.
pub fn generate_room_code() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..ROOM_CODE_LENGTH)
        .map(|_| ROOM_CODE_CHARS[rng.gen_range(0..ROOM_CODE_CHARS.len())] as char)
        .collect()
}

/// Uppercases and trims a user-entered room code.
pub fn normalize_room_code(code: &str) -> String {
    code.trim().to_uppercase()
}

/// True if `code` is a well-formed room code (already normalized).
pub fn is_valid_room_code(code: &str) -> bool {
    code.len() == ROOM_CODE_LENGTH && code.bytes().all(|b| ROOM_CODE_CHARS.contains(&b))
}

/// Derives the channel topic for a room code.
///
/// Both peers compute this independently from the human-exchanged code, so
/// the mapping must be deterministic.
pub fn channel_topic(prefix: &str, room_code: &str) -> String {
    format!("{prefix}:{room_code}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_codes_are_well_formed() {
        for _ in 0..100 {
            let code = generate_room_code();
            assert!(is_valid_room_code(&code), "bad code: {code}");
        }
    }

    #[test]
    fn alphabet_has_no_confusable_characters() {
        for c in [b'0', b'O', b'1', b'I'] {
            assert!(!ROOM_CODE_CHARS.contains(&c));
        }
        assert_eq!(ROOM_CODE_CHARS.len(), 32);
    }

    #[test]
    fn normalization_uppercases_and_trims() {
        assert_eq!(normalize_room_code("  ab2cd3 "), "AB2CD3");
        assert!(is_valid_room_code(&normalize_room_code("ab2cd3")));
        assert!(!is_valid_room_code("AB2CD")); // too short
        assert!(!is_valid_room_code("AB2CD0")); // confusable char
    }

    #[test]
    fn topic_is_derived_from_code() {
        assert_eq!(channel_topic("battle", "AB2CD3"), "battle:AB2CD3");
    }
}
