//! Seed normalization and validity rules.
//!
//! Connectors emit raw [`Seed`]s. The normalizer checks the record-state
//! contract, drops active seeds without a url, and demotes seeds that fail a
//! validity rule. Demotion only ever moves a seed toward exclusion
//! (`active < inactive < skipped < deleted`), so the rules can run in any
//! order and the result is the same.

use crate::config::NormalizerConfig;
use crate::models::{Language, Seed, SeedState};

/// Copyright values that mark a record as closed access.
pub const CLOSED_COPYRIGHTS: [&str; 3] = ["yes", "closed-access", "unknown"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NormalizeOptions {
    /// Keep deleted seeds in the output.
    pub include_deleted: bool,
    /// Keep active seeds that have no url.
    pub allow_empty_url: bool,
}

/// Output of one normalization pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedSeeds {
    pub seeds: Vec<Seed>,
    /// Seeds that broke the record-state contract.
    pub errors: usize,
    /// Active seeds dropped for lacking a url.
    pub dropped: usize,
}

impl NormalizedSeeds {
    /// Splits into seeds to upsert and external ids to delete.
    pub fn partition(self) -> (Vec<Seed>, Vec<String>) {
        let (deleted, kept): (Vec<Seed>, Vec<Seed>) = self
            .seeds
            .into_iter()
            .partition(|seed| seed.state == SeedState::Deleted);
        (
            kept,
            deleted.into_iter().map(|seed| seed.external_id).collect(),
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct SeedNormalizer {
    config: NormalizerConfig,
}

impl SeedNormalizer {
    pub fn new(config: NormalizerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &NormalizerConfig {
        &self.config
    }

    /// Normalizes a batch of seeds from one fetch.
    pub fn normalize(&self, seeds: Vec<Seed>, options: NormalizeOptions) -> NormalizedSeeds {
        let mut output = NormalizedSeeds::default();

        for seed in seeds {
            if seed.external_id.trim().is_empty() {
                tracing::debug!(title = ?seed.title, "Seed without external_id");
                output.errors += 1;
                continue;
            }

            let mut seed = self.prepare_seed(seed);

            if seed.state == SeedState::Deleted && !options.include_deleted {
                continue;
            }

            if seed.is_active() && seed.url.is_none() && !options.allow_empty_url {
                output.dropped += 1;
                continue;
            }

            seed.external_id = seed.external_id.trim().to_string();
            output.seeds.push(seed);
        }

        output
    }

    /// Applies the validity rules to one seed.
    pub fn prepare_seed(&self, mut seed: Seed) -> Seed {
        seed.language = Language {
            metadata: seed
                .language
                .metadata
                .as_deref()
                .and_then(normalize_language),
        };

        if seed.url.as_deref().is_none_or(|url| url.trim().is_empty()) {
            seed.url = seed
                .files
                .iter()
                .map(|file| file.url.trim())
                .find(|url| !url.is_empty())
                .map(str::to_string);
        }

        let mut target = seed.state;

        if !self.config.allow_closed_access && is_closed_access(seed.copyright.as_deref()) {
            target = demote(target, SeedState::Inactive);
        }

        if seed.lowest_educational_level < self.config.min_educational_level {
            target = demote(target, SeedState::Inactive);
        }

        if seed
            .publishers
            .iter()
            .any(|p| self.config.publisher_denylist.iter().any(|d| d == p))
        {
            target = demote(target, SeedState::Skipped);
        }

        seed.state = target;
        seed
    }
}

/// The more excluded of two states.
fn demote(current: SeedState, candidate: SeedState) -> SeedState {
    if candidate.exclusion_rank() > current.exclusion_rank() {
        candidate
    } else {
        current
    }
}

pub fn is_closed_access(copyright: Option<&str>) -> bool {
    match copyright.map(str::trim) {
        None | Some("") => true,
        Some(value) => CLOSED_COPYRIGHTS
            .iter()
            .any(|closed| value.eq_ignore_ascii_case(closed)),
    }
}

/// Reduces a language tag to its lowercase primary subtag, e.g. `nl-NL` to `nl`.
pub fn normalize_language(code: &str) -> Option<String> {
    let primary = code.trim().split(['-', '_']).next()?.to_ascii_lowercase();
    let valid = (2..=3).contains(&primary.len()) && primary.chars().all(|c| c.is_ascii_alphabetic());
    if !valid || primary == "und" {
        return None;
    }
    Some(primary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SeedFile;

    fn active(id: &str) -> Seed {
        let mut seed = Seed::new(id, SeedState::Active);
        seed.url = Some(format!("https://example.com/{}", id));
        seed.copyright = Some("cc-by-40".to_string());
        seed
    }

    fn permissive() -> SeedNormalizer {
        SeedNormalizer::new(NormalizerConfig {
            allow_closed_access: true,
            ..Default::default()
        })
    }

    #[test]
    fn test_normalize_language() {
        assert_eq!(normalize_language("nl-NL"), Some("nl".to_string()));
        assert_eq!(normalize_language(" EN "), Some("en".to_string()));
        assert_eq!(normalize_language("x-none"), None);
        assert_eq!(normalize_language("und"), None);
        assert_eq!(normalize_language(""), None);
    }

    #[test]
    fn test_closed_access() {
        assert!(is_closed_access(None));
        assert!(is_closed_access(Some("Closed-Access")));
        assert!(is_closed_access(Some("unknown")));
        assert!(!is_closed_access(Some("cc-by-40")));
    }

    #[test]
    fn test_closed_access_demotes_to_inactive() {
        let normalizer = SeedNormalizer::default();
        let mut seed = active("a");
        seed.copyright = Some("yes".to_string());
        assert_eq!(normalizer.prepare_seed(seed).state, SeedState::Inactive);

        assert_eq!(permissive().prepare_seed(active("b")).state, SeedState::Active);
    }

    #[test]
    fn test_educational_level_below_minimum() {
        let normalizer = SeedNormalizer::new(NormalizerConfig {
            allow_closed_access: true,
            min_educational_level: 2,
            ..Default::default()
        });
        let mut seed = active("a");
        seed.lowest_educational_level = 1;
        assert_eq!(normalizer.prepare_seed(seed).state, SeedState::Inactive);

        let mut seed = active("b");
        seed.lowest_educational_level = 2;
        assert_eq!(normalizer.prepare_seed(seed).state, SeedState::Active);
    }

    #[test]
    fn test_publisher_denylist_skips() {
        let normalizer = SeedNormalizer::new(NormalizerConfig {
            publisher_denylist: vec!["Internal Test".to_string()],
            ..Default::default()
        });
        let mut seed = active("a");
        // closed access and denylisted: skipped wins over inactive
        seed.copyright = None;
        seed.publishers = vec!["Internal Test".to_string()];
        assert_eq!(normalizer.prepare_seed(seed).state, SeedState::Skipped);
    }

    #[test]
    fn test_demotion_never_restores() {
        let normalizer = permissive();
        let deleted = Seed::new("gone", SeedState::Deleted);
        assert_eq!(normalizer.prepare_seed(deleted).state, SeedState::Deleted);

        let mut inactive = active("a");
        inactive.state = SeedState::Inactive;
        assert_eq!(normalizer.prepare_seed(inactive).state, SeedState::Inactive);
    }

    #[test]
    fn test_prepare_seed_is_idempotent() {
        let normalizer = SeedNormalizer::new(NormalizerConfig {
            min_educational_level: 3,
            publisher_denylist: vec!["x".to_string()],
            ..Default::default()
        });
        let mut seed = active("a");
        seed.language.metadata = Some("NL_be".to_string());
        seed.publishers = vec!["x".to_string()];
        let once = normalizer.prepare_seed(seed);
        let twice = normalizer.prepare_seed(once.clone());
        assert_eq!(once, twice);
        assert_eq!(once.language.metadata.as_deref(), Some("nl"));
    }

    #[test]
    fn test_url_resolved_from_files() {
        let mut seed = Seed::new("a", SeedState::Active);
        seed.files = vec![SeedFile {
            url: "https://example.com/a.pdf".to_string(),
            ..Default::default()
        }];
        let seed = permissive().prepare_seed(seed);
        assert_eq!(seed.url.as_deref(), Some("https://example.com/a.pdf"));
    }

    #[test]
    fn test_missing_external_id_is_error() {
        let result = permissive().normalize(
            vec![active("a"), Seed::new("  ", SeedState::Active)],
            NormalizeOptions::default(),
        );
        assert_eq!(result.seeds.len(), 1);
        assert_eq!(result.errors, 1);
    }

    #[test]
    fn test_active_without_url_is_dropped_unless_allowed() {
        let seeds = vec![Seed::new("parent", SeedState::Active), active("child")];

        let strict = permissive().normalize(seeds.clone(), NormalizeOptions::default());
        assert_eq!(strict.seeds.len(), 1);
        assert_eq!(strict.dropped, 1);

        let lenient = permissive().normalize(
            seeds,
            NormalizeOptions {
                allow_empty_url: true,
                ..Default::default()
            },
        );
        assert_eq!(lenient.seeds.len(), 2);
    }

    #[test]
    fn test_include_deleted_round_trip() {
        let normalizer = permissive();
        let seeds = vec![active("a"), Seed::new("b", SeedState::Deleted)];

        let without = normalizer.normalize(seeds.clone(), NormalizeOptions::default());
        assert!(without.seeds.iter().all(|s| s.external_id != "b"));

        let with = normalizer.normalize(
            seeds,
            NormalizeOptions {
                include_deleted: true,
                ..Default::default()
            },
        );
        let deleted = with.seeds.iter().find(|s| s.external_id == "b").unwrap();
        assert_eq!(deleted.state, SeedState::Deleted);
    }

    #[test]
    fn test_partition_splits_deletes() {
        let normalizer = permissive();
        let mut seeds: Vec<Seed> = (0..10).map(|i| active(&format!("a{}", i))).collect();
        seeds.push(Seed::new("d1", SeedState::Deleted));
        seeds.push(Seed::new("d2", SeedState::Deleted));

        let (upserts, deletes) = normalizer
            .normalize(
                seeds,
                NormalizeOptions {
                    include_deleted: true,
                    ..Default::default()
                },
            )
            .partition();
        assert_eq!(upserts.len(), 10);
        assert_eq!(deletes, vec!["d1".to_string(), "d2".to_string()]);
    }
}
