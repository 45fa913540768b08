use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Health,
    Fitness,
    Work,
    Personal,
    Mindfulness,
    #[default]
    Misc,
    Productivity,
    Learning,
    Creativity,
    Social,
    Body,
    Wealth,
    Heart,
    Mind,
    Soul,
    Play,
    Family,
    Finance,
}

impl Category {
    pub const ALL: [Category; 18] = [
        Category::Health,
        Category::Fitness,
        Category::Work,
        Category::Personal,
        Category::Mindfulness,
        Category::Misc,
        Category::Productivity,
        Category::Learning,
        Category::Creativity,
        Category::Social,
        Category::Body,
        Category::Wealth,
        Category::Heart,
        Category::Mind,
        Category::Soul,
        Category::Play,
        Category::Family,
        Category::Finance,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Health => "health",
            Category::Fitness => "fitness",
            Category::Work => "work",
            Category::Personal => "personal",
            Category::Mindfulness => "mindfulness",
            Category::Misc => "misc",
            Category::Productivity => "productivity",
            Category::Learning => "learning",
            Category::Creativity => "creativity",
            Category::Social => "social",
            Category::Body => "body",
            Category::Wealth => "wealth",
            Category::Heart => "heart",
            Category::Mind => "mind",
            Category::Soul => "soul",
            Category::Play => "play",
            Category::Family => "family",
            Category::Finance => "finance",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = ParseCategoryError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        Category::ALL
            .into_iter()
            .find(|category| category.as_str() == normalized)
            .ok_or_else(|| ParseCategoryError {
                value: value.to_string(),
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "invalid category '{value}': expected one of {}",
    Category::ALL.iter().map(|c| c.as_str()).collect::<Vec<_>>().join(", ")
)]
pub struct ParseCategoryError {
    value: String,
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::Category;

    #[test]
    fn parses_names_case_insensitively() {
        assert_eq!(Category::from_str("learning").unwrap(), Category::Learning);
        assert_eq!(Category::from_str(" Soul ").unwrap(), Category::Soul);
    }

    #[test]
    fn every_variant_round_trips_through_its_name() {
        for category in Category::ALL {
            assert_eq!(Category::from_str(category.as_str()).unwrap(), category);
        }
    }

    #[test]
    fn rejects_unknown_names_with_the_valid_list() {
        let err = Category::from_str("gardening").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("gardening"));
        assert!(message.contains("mindfulness"));
    }

    #[test]
    fn serializes_lowercase() {
        let raw = serde_json::to_string(&Category::Finance).unwrap();
        assert_eq!(raw, "\"finance\"");
    }
}
