//! Password strength scoring

use std::collections::HashSet;

/// Common passwords and fragments that collapse a score
const DICTIONARY: &[&str] = &[
    "password", "passw0rd", "123456", "12345678", "qwerty", "letmein", "welcome", "monkey",
    "dragon", "iloveyou", "admin", "trustno1", "abc123", "111111", "sunshine", "princess",
    "football", "baseball", "master", "shadow", "bitcoin", "wallet", "blockchain", "secret",
];

const LENGTH_TARGET: f32 = 16.0;
const DICTIONARY_PENALTY: f32 = 0.5;

/// Score in `[0, 1]` from length, character-class diversity, repetition and
/// dictionary membership. Pure and deterministic.
pub fn strength_of(password: &str) -> f32 {
    if password.is_empty() {
        return 0.0;
    }

    let chars: Vec<char> = password.chars().collect();
    let len = chars.len() as f32;

    let classes = [
        chars.iter().any(|c| c.is_lowercase()),
        chars.iter().any(|c| c.is_uppercase()),
        chars.iter().any(|c| c.is_ascii_digit()),
        chars.iter().any(|c| !c.is_alphanumeric()),
    ]
    .iter()
    .filter(|present| **present)
    .count() as f32;

    let unique = chars.iter().collect::<HashSet<_>>().len() as f32;
    let variety = (unique / len).min(1.0);

    let length_score = (len / LENGTH_TARGET).min(1.0);
    let mut score = 0.45 * length_score * variety + 0.45 * (classes / 4.0);
    if len >= 12.0 {
        score += 0.1;
    }

    let lowered = password.to_lowercase();
    if DICTIONARY.iter().any(|word| lowered.contains(word)) {
        score -= DICTIONARY_PENALTY;
    }

    score.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds() {
        assert_eq!(strength_of(""), 0.0);
        for p in ["a", "aaaaaaaaaaaaaaaaaaaaaaaaaaaa", "Xy9!Xy9!Xy9!Xy9!Xy9!", "Tr0ub4dor&3"] {
            let s = strength_of(p);
            assert!((0.0..=1.0).contains(&s), "{} scored {}", p, s);
        }
    }

    #[test]
    fn test_ordering() {
        assert!(strength_of("Tr0ub4dor&3") > strength_of("troubador"));
        assert!(strength_of("correct-Horse-battery-7") > strength_of("abc"));
        assert!(strength_of("aaaaaaaaaaaaaaaa") < strength_of("abcdefghijklmnop"));
    }

    #[test]
    fn test_dictionary_penalty() {
        assert!(strength_of("MyPassword123!") < strength_of("MyPanther123!x"));
        assert!(strength_of("password") < 0.1);
    }

    #[test]
    fn test_deterministic() {
        assert_eq!(strength_of("Tr0ub4dor&3"), strength_of("Tr0ub4dor&3"));
        assert!(strength_of("Tr0ub4dor&3") >= 0.5);
    }
}
