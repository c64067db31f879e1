//! Local pattern-based entity extraction, used when the external endpoint
//! keeps failing. Tuned for legal filings: titled persons, organizations
//! with legal suffixes, courts, dates, and monetary amounts. High
//! precision on its target domain, no external models.

use std::sync::LazyLock;

use regex::Regex;

use crate::llm::RawMention;

static TITLED_PERSON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?:(?:Judge|Justice|Chief Justice|Attorney|Counsel|Dr\.|Prof\.|Mr\.|Mrs\.|Ms\.|Hon\.)\s+)([A-Z][a-z]+(?:\s+[A-Z]\.?)?\s+[A-Z][a-z]+)",
    )
    .expect("titled person pattern should compile")
});

static LEGAL_ORG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b([A-Z][A-Za-z&'\-]*(?:\s+[A-Z][A-Za-z&'\-]*){0,4}\s+(?:Inc\.?|LLC|L\.L\.C\.|LLP|L\.P\.|Ltd\.?|Corp\.?|Corporation|Company|Co\.|Partners|Group|Holdings|Trust|Associates))\b",
    )
    .expect("legal org pattern should compile")
});

static COURT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b((?:United States|U\.S\.|State|Supreme|District|Circuit|Appellate|Superior|Municipal)\s+(?:[A-Z][a-z]+\s+)*Court(?:\s+(?:of|for)\s+[A-Z][A-Za-z\s]+?)?)\b",
    )
    .expect("court pattern should compile")
});

static DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b((?:January|February|March|April|May|June|July|August|September|October|November|December)\s+\d{1,2},\s+\d{4}|\d{1,2}/\d{1,2}/\d{2,4}|\d{4}-\d{2}-\d{2})\b",
    )
    .expect("date pattern should compile")
});

static MONEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\s?\d{1,3}(?:,\d{3})*(?:\.\d{2})?(?:\s+(?:million|billion|thousand))?")
        .expect("money pattern should compile")
});

/// Confidence assigned to pattern matches; deliberately below typical
/// endpoint confidences so downstream thresholds treat them cautiously.
const FALLBACK_CONFIDENCE: f32 = 0.6;

/// Pattern-based extractor producing the same raw mention shape as the
/// external endpoint, with char offsets into the chunk text.
#[derive(Debug, Default, Clone)]
pub struct FallbackNer;

impl FallbackNer {
    pub fn new() -> Self {
        Self
    }

    pub fn extract(&self, text: &str) -> Vec<RawMention> {
        let mut mentions = Vec::new();

        for cap in TITLED_PERSON.captures_iter(text) {
            if let Some(m) = cap.get(1) {
                mentions.push(raw_mention(text, m.start(), m.end(), "PERSON"));
            }
        }

        for cap in LEGAL_ORG.captures_iter(text) {
            if let Some(m) = cap.get(1) {
                mentions.push(raw_mention(text, m.start(), m.end(), "ORG"));
            }
        }

        for cap in COURT.captures_iter(text) {
            if let Some(m) = cap.get(1) {
                mentions.push(raw_mention(text, m.start(), m.end(), "ORG"));
            }
        }

        for m in DATE.find_iter(text) {
            mentions.push(raw_mention(text, m.start(), m.end(), "DATE"));
        }

        for m in MONEY.find_iter(text) {
            mentions.push(raw_mention(text, m.start(), m.end(), "MONEY"));
        }

        mentions.sort_by_key(|m| (m.start, m.end));
        mentions
    }
}

/// Build a mention from byte offsets, converting to char offsets.
fn raw_mention(text: &str, byte_start: usize, byte_end: usize, entity_type: &str) -> RawMention {
    let start = text[..byte_start].chars().count();
    let len = text[byte_start..byte_end].chars().count();
    RawMention {
        text: text[byte_start..byte_end].to_string(),
        entity_type: entity_type.to_string(),
        start,
        end: start + len,
        confidence: FALLBACK_CONFIDENCE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_titled_persons() {
        let ner = FallbackNer::new();
        let mentions = ner.extract("Before Judge Sarah Connor, counsel Mr. James Park appeared.");

        let persons: Vec<&str> = mentions
            .iter()
            .filter(|m| m.entity_type == "PERSON")
            .map(|m| m.text.as_str())
            .collect();

        assert!(persons.contains(&"Sarah Connor"));
        assert!(persons.contains(&"James Park"));
    }

    #[test]
    fn test_extract_legal_orgs() {
        let ner = FallbackNer::new();
        let mentions = ner.extract("Acme Widgets LLC sued Globex Corporation over the contract.");

        let orgs: Vec<&str> = mentions
            .iter()
            .filter(|m| m.entity_type == "ORG")
            .map(|m| m.text.as_str())
            .collect();

        assert!(orgs.contains(&"Acme Widgets LLC"));
        assert!(orgs.contains(&"Globex Corporation"));
    }

    #[test]
    fn test_extract_courts() {
        let ner = FallbackNer::new();
        let mentions = ner.extract("Filed in the United States District Court for the docket.");

        assert!(mentions
            .iter()
            .any(|m| m.entity_type == "ORG" && m.text.contains("District Court")));
    }

    #[test]
    fn test_extract_dates_and_money() {
        let ner = FallbackNer::new();
        let mentions =
            ner.extract("On March 5, 2021 the parties settled for $1,250,000.00 in damages.");

        assert!(mentions
            .iter()
            .any(|m| m.entity_type == "DATE" && m.text == "March 5, 2021"));
        assert!(mentions
            .iter()
            .any(|m| m.entity_type == "MONEY" && m.text == "$1,250,000.00"));
    }

    #[test]
    fn test_offsets_are_char_based() {
        let ner = FallbackNer::new();
        let text = "Déjà vu: Mr. John Doe appeared.";
        let mentions = ner.extract(text);

        let person = mentions.iter().find(|m| m.entity_type == "PERSON").unwrap();
        let chars: Vec<char> = text.chars().collect();
        let span: String = chars[person.start..person.end].iter().collect();
        assert_eq!(span, person.text);
    }

    #[test]
    fn test_empty_text() {
        assert!(FallbackNer::new().extract("").is_empty());
    }
}
