//! Subdomain slug generation for new projects.

use rand::seq::SliceRandom;
use rand::Rng;

const ADJECTIVES: &[&str] = &[
    "able", "amber", "ancient", "autumn", "bold", "brave", "bright", "calm", "clever", "cosmic",
    "crisp", "curly", "daring", "dusty", "eager", "early", "fancy", "fierce", "gentle", "giant",
    "golden", "happy", "hidden", "humble", "icy", "jolly", "kind", "lively", "lucky", "mellow",
    "misty", "modern", "most", "noble", "odd", "polite", "proud", "quick", "quiet", "rapid",
    "refined", "rustic", "shiny", "silent", "silver", "sleepy", "smooth", "snowy", "solar",
    "spicy", "steady", "sunny", "swift", "tidy", "tiny", "vivid", "warm", "wild", "witty",
    "young",
];

const NOUNS: &[&str] = &[
    "anchor", "apple", "badger", "banana", "beacon", "bison", "breeze", "canyon", "cactus",
    "comet", "coral", "crane", "delta", "dolphin", "ember", "falcon", "fern", "forest", "galaxy",
    "garden", "glacier", "harbor", "hedgehog", "island", "jungle", "kettle", "lagoon", "lantern",
    "lemon", "meadow", "meteor", "nebula", "oasis", "orchid", "otter", "panda", "pebble",
    "pepper", "piano", "planet", "quartz", "rabbit", "river", "rocket", "saddle", "shampoo",
    "sparrow", "summit", "tiger", "tulip", "valley", "velvet", "walrus", "willow", "zephyr",
];

/// Generate a three-word slug such as `most-refined-shampoo`.
#[must_use]
pub fn generate() -> String {
    generate_with(&mut rand::thread_rng())
}

/// Generate a slug from the given random source.
pub fn generate_with<R: Rng + ?Sized>(rng: &mut R) -> String {
    let first = ADJECTIVES.choose(rng).copied().unwrap_or("quiet");
    let second = ADJECTIVES.choose(rng).copied().unwrap_or("rapid");
    let noun = NOUNS.choose(rng).copied().unwrap_or("rocket");
    format!("{first}-{second}-{noun}")
}

/// Whether `slug` is a valid DNS label.
#[must_use]
pub fn is_valid(slug: &str) -> bool {
    !slug.is_empty()
        && slug.len() <= 63
        && !slug.starts_with('-')
        && !slug.ends_with('-')
        && slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn generated_slugs_have_three_words() {
        for _ in 0..50 {
            let slug = generate();
            assert_eq!(slug.split('-').count(), 3, "{slug}");
            assert!(is_valid(&slug), "{slug}");
        }
    }

    #[test]
    fn seeded_generation_is_deterministic() {
        let a = generate_with(&mut StdRng::seed_from_u64(7));
        let b = generate_with(&mut StdRng::seed_from_u64(7));
        assert_eq!(a, b);
    }

    #[test]
    fn validity_rules() {
        assert!(is_valid("most-refined-shampoo"));
        assert!(!is_valid("-leading"));
        assert!(!is_valid("Upper-case"));
        assert!(!is_valid(""));
        assert!(!is_valid(&"a".repeat(64)));
    }
}
