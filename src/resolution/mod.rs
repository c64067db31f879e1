//! Entity resolution: mentions to canonical entities.
//!
//! Resolution is intra-type. Mentions sharing a normalized key merge
//! exactly; remaining singletons merge fuzzily above a similarity
//! threshold. Canonical UUIDs derive deterministically from the ordered
//! first mention of each cluster so replays produce identical ids.

mod normalize;
mod similarity;

pub use normalize::normalize_key;
pub use similarity::similarity;

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{CanonicalEntity, EntityMention, EntityType};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Fuzzy merge threshold over the combined similarity score.
    pub similarity_threshold: f64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.85,
        }
    }
}

/// Output of resolving one document's mentions.
#[derive(Debug, Clone, Default)]
pub struct ResolutionOutcome {
    pub canonical: Vec<CanonicalEntity>,
    /// (mention uuid, canonical pointer, unresolved reason). Every input
    /// mention appears exactly once.
    pub assignments: Vec<(Uuid, Option<Uuid>, Option<String>)>,
}

#[derive(Debug)]
struct Cluster {
    key: String,
    entity_type: EntityType,
    /// Indices into the mention slice, in input order.
    members: Vec<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct EntityResolver {
    config: ResolverConfig,
}

impl EntityResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self { config }
    }

    /// Resolve a document's mentions. Input order must be the stored
    /// (chunk_index, start_offset) order for deterministic cluster ids.
    pub fn resolve(&self, document_uuid: Uuid, mentions: &[EntityMention]) -> ResolutionOutcome {
        let mut clusters: Vec<Cluster> = Vec::new();
        let mut unresolved: Vec<usize> = Vec::new();

        // Exact-key merge, per type.
        let mut by_key: BTreeMap<(EntityType, String), usize> = BTreeMap::new();
        for (idx, mention) in mentions.iter().enumerate() {
            let key = normalize_key(&mention.text, mention.entity_type);
            if key.is_empty() {
                unresolved.push(idx);
                continue;
            }

            match by_key.get(&(mention.entity_type, key.clone())) {
                Some(&cluster_idx) => clusters[cluster_idx].members.push(idx),
                None => {
                    by_key.insert((mention.entity_type, key.clone()), clusters.len());
                    clusters.push(Cluster {
                        key,
                        entity_type: mention.entity_type,
                        members: vec![idx],
                    });
                }
            }
        }

        // Fuzzy merge: absorb singletons into the most similar cluster of
        // the same type.
        self.fuzzy_merge(mentions, &mut clusters);

        // Order clusters by their first mention for deterministic ids.
        clusters.sort_by_key(|c| {
            let first = c.members[0];
            (mentions[first].chunk_index, mentions[first].start_offset, first)
        });

        let mut outcome = ResolutionOutcome::default();

        for cluster in &clusters {
            let first = &mentions[cluster.members[0]];
            let uuid = Uuid::new_v5(
                &document_uuid,
                format!(
                    "entity:{}:{}:{}",
                    cluster.entity_type.as_str(),
                    first.chunk_index,
                    first.start_offset
                )
                .as_bytes(),
            );

            let canonical_name = canonical_name(mentions, &cluster.members);
            let mut aliases: Vec<String> = cluster
                .members
                .iter()
                .map(|&i| mentions[i].text.clone())
                .filter(|t| *t != canonical_name)
                .collect();
            aliases.sort();
            aliases.dedup();

            let confidence = cluster
                .members
                .iter()
                .map(|&i| mentions[i].confidence)
                .fold(0.0f32, f32::max);

            outcome.canonical.push(CanonicalEntity {
                uuid,
                document_uuid,
                entity_type: cluster.entity_type,
                canonical_name,
                aliases,
                mention_count: cluster.members.len() as u32,
                confidence,
                created_at: Utc::now(),
            });

            for &member in &cluster.members {
                outcome
                    .assignments
                    .push((mentions[member].uuid, Some(uuid), None));
            }
        }

        for idx in unresolved {
            outcome.assignments.push((
                mentions[idx].uuid,
                None,
                Some("empty_normalized_text".to_string()),
            ));
        }

        outcome
    }

    fn fuzzy_merge(&self, mentions: &[EntityMention], clusters: &mut Vec<Cluster>) {
        // A settled singleton found no merge partner and stays on its own.
        let mut settled: Vec<bool> = vec![false; clusters.len()];

        loop {
            let singleton_idx = match (0..clusters.len())
                .find(|&i| !settled[i] && clusters[i].members.len() == 1)
            {
                Some(i) => i,
                None => break,
            };

            let mut best: Option<(usize, f64)> = None;
            for (other_idx, other) in clusters.iter().enumerate() {
                if other_idx == singleton_idx
                    || other.entity_type != clusters[singleton_idx].entity_type
                {
                    continue;
                }
                let score = similarity(&clusters[singleton_idx].key, &other.key);
                if score < self.config.similarity_threshold {
                    continue;
                }

                let better = match best {
                    None => true,
                    Some((best_idx, best_score)) => {
                        if (score - best_score).abs() > f64::EPSILON {
                            score > best_score
                        } else {
                            // Tie-break: higher aggregate confidence, then
                            // lexicographically smallest canonical name.
                            let conf = aggregate_confidence(mentions, &clusters[other_idx]);
                            let best_conf = aggregate_confidence(mentions, &clusters[best_idx]);
                            if (conf - best_conf).abs() > f32::EPSILON {
                                conf > best_conf
                            } else {
                                canonical_name(mentions, &clusters[other_idx].members)
                                    < canonical_name(mentions, &clusters[best_idx].members)
                            }
                        }
                    }
                };
                if better {
                    best = Some((other_idx, score));
                }
            }

            match best {
                Some((target, _)) => {
                    let members = std::mem::take(&mut clusters[singleton_idx].members);
                    clusters[target].members.extend(members);
                    clusters[target].members.sort();
                    clusters.remove(singleton_idx);
                    settled.remove(singleton_idx);
                }
                None => {
                    settled[singleton_idx] = true;
                }
            }
        }
    }
}

fn aggregate_confidence(mentions: &[EntityMention], cluster: &Cluster) -> f32 {
    cluster
        .members
        .iter()
        .map(|&i| mentions[i].confidence)
        .sum()
}

/// Longest mention text in the cluster; ties broken by confidence then
/// lexicographic order.
fn canonical_name(mentions: &[EntityMention], members: &[usize]) -> String {
    members
        .iter()
        .map(|&i| &mentions[i])
        .max_by(|a, b| {
            a.text
                .chars()
                .count()
                .cmp(&b.text.chars().count())
                .then(
                    a.confidence
                        .partial_cmp(&b.confidence)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
                .then(b.text.cmp(&a.text))
        })
        .map(|m| m.text.clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExtractionMethod;

    fn mention(doc: Uuid, text: &str, ty: EntityType, chunk_index: i32, start: i32) -> EntityMention {
        EntityMention {
            uuid: Uuid::new_v4(),
            document_uuid: doc,
            chunk_uuid: Uuid::new_v4(),
            chunk_index,
            text: text.to_string(),
            entity_type: ty,
            confidence: 0.9,
            start_offset: start,
            end_offset: start + text.chars().count() as i32,
            canonical_entity_uuid: None,
            unresolved_reason: None,
            extraction_method: ExtractionMethod::Llm,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_exact_key_merge() {
        let doc = Uuid::new_v4();
        let resolver = EntityResolver::default();
        let mentions = vec![
            mention(doc, "Mr. John Doe", EntityType::Person, 0, 0),
            mention(doc, "John Doe", EntityType::Person, 1, 10),
            mention(doc, "JOHN DOE", EntityType::Person, 2, 20),
        ];

        let outcome = resolver.resolve(doc, &mentions);
        assert_eq!(outcome.canonical.len(), 1);
        assert_eq!(outcome.canonical[0].mention_count, 3);
        assert_eq!(outcome.canonical[0].canonical_name, "Mr. John Doe");
        assert!(outcome.assignments.iter().all(|(_, c, _)| c.is_some()));
    }

    #[test]
    fn test_org_suffix_normalization_merges() {
        let doc = Uuid::new_v4();
        let resolver = EntityResolver::default();
        let mentions = vec![
            mention(doc, "Acme Widgets Inc.", EntityType::Org, 0, 0),
            mention(doc, "Acme Widgets LLC", EntityType::Org, 3, 5),
        ];

        let outcome = resolver.resolve(doc, &mentions);
        assert_eq!(outcome.canonical.len(), 1);
        assert_eq!(outcome.canonical[0].canonical_name, "Acme Widgets Inc.");
        assert_eq!(outcome.canonical[0].aliases, vec!["Acme Widgets LLC"]);
    }

    #[test]
    fn test_resolution_is_intra_type() {
        let doc = Uuid::new_v4();
        let resolver = EntityResolver::default();
        let mentions = vec![
            mention(doc, "Washington", EntityType::Person, 0, 0),
            mention(doc, "Washington", EntityType::Location, 0, 30),
        ];

        let outcome = resolver.resolve(doc, &mentions);
        assert_eq!(outcome.canonical.len(), 2);
    }

    #[test]
    fn test_fuzzy_merge_of_near_duplicates() {
        let doc = Uuid::new_v4();
        let resolver = EntityResolver::default();
        let mentions = vec![
            mention(doc, "Jonathan Smithfield", EntityType::Person, 0, 0),
            mention(doc, "Jonathon Smithfield", EntityType::Person, 4, 12),
        ];

        let outcome = resolver.resolve(doc, &mentions);
        assert_eq!(outcome.canonical.len(), 1);
        assert_eq!(outcome.canonical[0].mention_count, 2);
    }

    #[test]
    fn test_deterministic_uuids_across_runs() {
        let doc = Uuid::new_v4();
        let resolver = EntityResolver::default();

        let mut mentions = Vec::new();
        for i in 0..16 {
            let (text, ty) = match i % 4 {
                0 => ("Mr. John Doe", EntityType::Person),
                1 => ("Acme Widgets Inc.", EntityType::Org),
                2 => (
                    match i {
                        2 => "March 5, 2021",
                        6 => "April 6, 2022",
                        10 => "May 7, 2023",
                        _ => "June 8, 2024",
                    },
                    EntityType::Date,
                ),
                _ => (
                    match i {
                        3 => "$100.00",
                        7 => "$250.00",
                        11 => "$300.00",
                        _ => "$400.00",
                    },
                    EntityType::Money,
                ),
            };
            mentions.push(mention(doc, text, ty, i as i32 / 2, (i as i32 % 2) * 40));
        }

        let first = resolver.resolve(doc, &mentions);
        let second = resolver.resolve(doc, &mentions);

        // 1 person + 1 org + 4 dates + 4 amounts + stable replay.
        assert_eq!(first.canonical.len(), 10);
        assert_eq!(first.canonical.len(), second.canonical.len());
        for (a, b) in first.canonical.iter().zip(second.canonical.iter()) {
            assert_eq!(a.uuid, b.uuid);
            assert_eq!(a.canonical_name, b.canonical_name);
            assert_eq!(a.mention_count, b.mention_count);
        }
        assert_eq!(first.assignments.len(), 16);
        assert_eq!(second.assignments.len(), 16);
    }

    #[test]
    fn test_punctuation_only_mention_is_unresolved() {
        let doc = Uuid::new_v4();
        let resolver = EntityResolver::default();
        let mentions = vec![
            mention(doc, "——", EntityType::Other, 0, 0),
            mention(doc, "Acme Corp", EntityType::Org, 0, 10),
        ];

        let outcome = resolver.resolve(doc, &mentions);
        assert_eq!(outcome.canonical.len(), 1);

        let unresolved: Vec<_> = outcome
            .assignments
            .iter()
            .filter(|(_, c, _)| c.is_none())
            .collect();
        assert_eq!(unresolved.len(), 1);
        assert_eq!(
            unresolved[0].2.as_deref(),
            Some("empty_normalized_text")
        );
        // Closure: every mention has exactly one assignment.
        assert_eq!(outcome.assignments.len(), 2);
    }
}
