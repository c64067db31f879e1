//! Mention text normalization for resolution keys.

use crate::models::EntityType;

const HONORIFICS: &[&str] = &[
    "mr", "mrs", "ms", "dr", "prof", "hon", "judge", "justice", "attorney", "counsel",
];

const LEGAL_SUFFIXES: &[&str] = &[
    "inc", "incorporated", "llc", "llp", "lp", "ltd", "limited", "corp", "corporation",
    "company", "co", "group", "holdings", "trust", "associates", "partners",
];

/// Compute the normalized resolution key for a mention.
///
/// Casefolds, strips punctuation, and collapses whitespace; persons lose
/// leading honorifics, organizations lose trailing legal suffixes.
pub fn normalize_key(text: &str, entity_type: EntityType) -> String {
    let lowered = text.to_lowercase();

    let stripped: String = lowered
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();

    let mut tokens: Vec<&str> = stripped.split_whitespace().collect();

    match entity_type {
        EntityType::Person => {
            while let Some(first) = tokens.first() {
                if HONORIFICS.contains(first) {
                    tokens.remove(0);
                } else {
                    break;
                }
            }
        }
        EntityType::Org => {
            while let Some(last) = tokens.last() {
                if LEGAL_SUFFIXES.contains(last) {
                    tokens.pop();
                } else {
                    break;
                }
            }
        }
        _ => {}
    }

    tokens.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_casefold_and_punctuation() {
        assert_eq!(
            normalize_key("John-Doe, Esq", EntityType::Other),
            "john doe esq"
        );
        assert_eq!(normalize_key("  spaced   out  ", EntityType::Other), "spaced out");
    }

    #[test]
    fn test_person_honorifics() {
        assert_eq!(normalize_key("Mr. John Doe", EntityType::Person), "john doe");
        assert_eq!(normalize_key("Dr. Jane Roe", EntityType::Person), "jane roe");
        assert_eq!(
            normalize_key("Judge Sarah Connor", EntityType::Person),
            "sarah connor"
        );
        // Honorific-only text normalizes to empty.
        assert_eq!(normalize_key("Mr.", EntityType::Person), "");
    }

    #[test]
    fn test_org_legal_suffixes() {
        assert_eq!(
            normalize_key("Acme Widgets Inc.", EntityType::Org),
            "acme widgets"
        );
        assert_eq!(
            normalize_key("Acme Widgets LLC", EntityType::Org),
            "acme widgets"
        );
        assert_eq!(
            normalize_key("Smith & Jones LLP", EntityType::Org),
            "smith jones"
        );
    }

    #[test]
    fn test_honorifics_only_stripped_for_persons() {
        // "Co" is a suffix for orgs, not a token to strip from other types.
        assert_eq!(normalize_key("Dr. Pepper Co", EntityType::Other), "dr pepper co");
    }
}
