use clap::ValueEnum;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::error::{PimError, Result};

pub const MAX_NAME_LEN: usize = 50;

/// Word theme for generated agent names.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "snake_case")]
#[clap(rename_all = "snake_case")]
pub enum NameTheme {
    #[default]
    Default,
    Nature,
    Space,
    Minimal,
    Custom,
}

/// Custom word lists for the `custom` theme.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameWords {
    #[serde(default)]
    pub adjectives: Vec<String>,
    #[serde(default)]
    pub nouns: Vec<String>,
}

const DEFAULT_ADJECTIVES: &[&str] = &[
    "Brave", "Calm", "Clever", "Eager", "Fuzzy", "Gentle", "Happy", "Jolly", "Keen", "Lucky",
    "Mellow", "Nimble", "Quick", "Quiet", "Rapid", "Sly", "Snappy", "Steady", "Swift", "Witty",
];
const DEFAULT_NOUNS: &[&str] = &[
    "Badger", "Falcon", "Fox", "Heron", "Lynx", "Marmot", "Otter", "Panda", "Puffin", "Raven",
    "Salmon", "Sparrow", "Stoat", "Tiger", "Walrus", "Weasel", "Wolf", "Wombat", "Wren", "Yak",
];

const NATURE_ADJECTIVES: &[&str] = &[
    "Amber", "Cedar", "Coral", "Fern", "Flint", "Maple", "Misty", "Mossy", "Pebble", "Sunny",
    "Thorn", "Willow",
];
const NATURE_NOUNS: &[&str] = &[
    "Brook", "Canyon", "Dune", "Glacier", "Grove", "Meadow", "Ridge", "River", "Summit", "Tide",
    "Tundra", "Valley",
];

const SPACE_ADJECTIVES: &[&str] = &[
    "Astral", "Cosmic", "Lunar", "Nebular", "Orbital", "Polar", "Solar", "Stellar", "Umbral",
    "Zenith",
];
const SPACE_NOUNS: &[&str] = &[
    "Comet", "Galaxy", "Meteor", "Nova", "Photon", "Pulsar", "Quasar", "Rocket", "Saturn",
    "Vega",
];

// Minimal theme: single words, no adjective prefix.
const MINIMAL_WORDS: &[&str] = &[
    "Ash", "Beam", "Bolt", "Clay", "Dart", "Echo", "Gale", "Iris", "Jade", "Lark", "Onyx",
    "Opal", "Reed", "Sage", "Vale", "Zephyr",
];

/// Validate an agent name: `[A-Za-z0-9_][A-Za-z0-9_-]*`, length <= 50.
pub fn validate_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return Err(PimError::InvalidName);
    };
    if name.len() > MAX_NAME_LEN {
        return Err(PimError::InvalidName);
    }
    if !(first.is_ascii_alphanumeric() || first == '_') {
        return Err(PimError::InvalidName);
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(PimError::InvalidName);
    }
    Ok(())
}

fn pick(words: &[&str]) -> String {
    words
        .choose(&mut rand::thread_rng())
        .map(|w| (*w).to_string())
        .unwrap_or_default()
}

fn base_name(theme: NameTheme, custom: Option<&NameWords>) -> Result<String> {
    let name = match theme {
        NameTheme::Default => format!("{}{}", pick(DEFAULT_ADJECTIVES), pick(DEFAULT_NOUNS)),
        NameTheme::Nature => format!("{}{}", pick(NATURE_ADJECTIVES), pick(NATURE_NOUNS)),
        NameTheme::Space => format!("{}{}", pick(SPACE_ADJECTIVES), pick(SPACE_NOUNS)),
        NameTheme::Minimal => pick(MINIMAL_WORDS),
        NameTheme::Custom => {
            let words = custom.ok_or_else(|| {
                PimError::RegistrationFailed("custom name theme requires nameWords".into())
            })?;
            let mut rng = rand::thread_rng();
            let adj = words
                .adjectives
                .choose(&mut rng)
                .cloned()
                .unwrap_or_default();
            let noun = words.nouns.choose(&mut rng).cloned().ok_or_else(|| {
                PimError::RegistrationFailed("custom nameWords.nouns is empty".into())
            })?;
            format!("{adj}{noun}")
        }
    };
    if name.is_empty() {
        return Err(PimError::RegistrationFailed(
            "name generator produced an empty name".into(),
        ));
    }
    Ok(name)
}

/// Generate a memorable unique name. `taken` reports whether a candidate is
/// already registered. On collision a numeric suffix 2..=99 is tried before
/// giving up with a registration failure.
pub fn generate_name(
    theme: NameTheme,
    custom: Option<&NameWords>,
    taken: impl Fn(&str) -> bool,
) -> Result<String> {
    let base = base_name(theme, custom)?;
    validate_name(&base)?;
    if !taken(&base) {
        return Ok(base);
    }
    for n in 2..=99u32 {
        let candidate = format!("{base}{n}");
        if candidate.len() <= MAX_NAME_LEN && !taken(&candidate) {
            return Ok(candidate);
        }
    }
    Err(PimError::RegistrationFailed(format!(
        "name space exhausted for '{base}'"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_shape_and_length() {
        assert!(validate_name("SwiftOtter").is_ok());
        assert!(validate_name("agent_1").is_ok());
        assert!(validate_name("a-b-c").is_ok());
        assert!(validate_name("9lives").is_ok());

        assert!(validate_name("").is_err());
        assert!(validate_name("-leading-dash").is_err());
        assert!(validate_name("has space").is_err());
        assert!(validate_name("has/slash").is_err());
        assert!(validate_name(&"x".repeat(51)).is_err());
        assert!(validate_name(&"x".repeat(50)).is_ok());
    }

    #[test]
    fn generates_valid_names_for_every_theme() {
        for theme in [NameTheme::Default, NameTheme::Nature, NameTheme::Space, NameTheme::Minimal] {
            let name = generate_name(theme, None, |_| false).unwrap();
            validate_name(&name).unwrap();
        }
    }

    #[test]
    fn custom_theme_requires_words() {
        assert!(generate_name(NameTheme::Custom, None, |_| false).is_err());

        let words = NameWords {
            adjectives: vec!["Tiny".into()],
            nouns: vec!["Crab".into()],
        };
        let name = generate_name(NameTheme::Custom, Some(&words), |_| false).unwrap();
        assert_eq!(name, "TinyCrab");
    }

    #[test]
    fn collision_appends_suffix() {
        let words = NameWords {
            adjectives: vec!["Tiny".into()],
            nouns: vec!["Crab".into()],
        };
        let name =
            generate_name(NameTheme::Custom, Some(&words), |n| n == "TinyCrab").unwrap();
        assert_eq!(name, "TinyCrab2");

        let name = generate_name(NameTheme::Custom, Some(&words), |n| {
            n == "TinyCrab" || n == "TinyCrab2"
        })
        .unwrap();
        assert_eq!(name, "TinyCrab3");
    }

    #[test]
    fn exhaustion_is_a_registration_failure() {
        let words = NameWords {
            adjectives: vec!["Tiny".into()],
            nouns: vec!["Crab".into()],
        };
        let err = generate_name(NameTheme::Custom, Some(&words), |_| true).unwrap_err();
        assert!(matches!(err, PimError::RegistrationFailed(_)));
    }
}
