//! Prompt contracts for the extraction endpoint.

/// Entity extraction prompt. The response contract is a JSON array of
/// `{text, type, start, end, confidence}` with char offsets into the
/// submitted text.
pub fn entity_prompt(text: &str) -> String {
    format!(
        r#"Extract named entities from the legal document excerpt below.

Return ONLY a JSON array. Each element must have:
- "text": the exact entity span as it appears
- "type": one of PERSON, ORG, LOC, DATE, MONEY, OTHER
- "start": character offset where the span begins
- "end": character offset one past the span
- "confidence": number between 0 and 1

Include parties, counsel, judges, companies, courts, jurisdictions, filing
dates, and monetary amounts. Do not invent spans that are not present.

EXCERPT:
{text}

JSON:"#,
        text = text
    )
}

/// Relationship extraction prompt. Mentions are submitted as an indexed
/// JSON list; the response contract is a JSON array of
/// `{from, to, type, confidence}` where `from`/`to` are mention indices.
pub fn relationship_prompt(text: &str, mentions_json: &str) -> String {
    format!(
        r#"Identify relationships between the entities below, based only on the
legal document excerpt.

ENTITIES (refer to them by "index"):
{mentions}

Return ONLY a JSON array. Each element must have:
- "from": index of the source entity
- "to": index of the target entity
- "type": a short uppercase label such as REPRESENTS, PARTY_TO, EMPLOYED_BY,
  LOCATED_IN, PAID, FILED_ON
- "confidence": number between 0 and 1

Only report relationships the excerpt states or strongly implies. No
self-relationships.

EXCERPT:
{text}

JSON:"#,
        mentions = mentions_json,
        text = text
    )
}
