use uuid::Uuid;

pub const HABIT_PREFIX: &str = "hab";
pub const ROUTINE_PREFIX: &str = "rtn";

pub fn generate_id<F>(prefix: &str, mut exists: F) -> String
where
    F: FnMut(&str) -> bool,
{
    for _ in 0..16 {
        let candidate = format!("{}-{}", prefix, Uuid::now_v7().simple());
        if !exists(&candidate) {
            return candidate;
        }
    }

    format!("{}-{}", prefix, Uuid::now_v7().simple())
}

pub fn is_valid_id(id: &str) -> bool {
    let trimmed = id.trim();
    !trimmed.is_empty()
        && trimmed.len() == id.len()
        && id.len() <= 128
        && !id.contains('@')
        && id.chars().all(|ch| !ch.is_control())
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::{generate_id, is_valid_id, HABIT_PREFIX};

    #[test]
    fn generated_ids_carry_prefix_and_skip_collisions() {
        let mut seen = HashSet::new();
        for _ in 0..50 {
            let id = generate_id(HABIT_PREFIX, |candidate| seen.contains(candidate));
            assert!(id.starts_with("hab-"));
            assert!(seen.insert(id));
        }
    }

    #[test]
    fn rejects_ids_that_break_completion_keys() {
        assert!(is_valid_id("h1"));
        assert!(!is_valid_id(""));
        assert!(!is_valid_id(" h1"));
        assert!(!is_valid_id("h1@2024-01-01"));
    }
}
