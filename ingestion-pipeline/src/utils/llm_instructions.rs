use serde_json::{json, Value};

pub const EXTRACTION_SYSTEM_MESSAGE: &str = "You extract facts from a piece of \
text belonging to a user's personal memory. Produce subject-predicate-object \
triples with a short natural-language fact sentence for each. Use the \
surrounding chunks only to resolve references; extract facts only from the \
current chunk. Classify each fact's aspect as Event, Preference, Attribute, \
Relationship or Observation. When a fact is anchored in time, set valid_at to \
an ISO-8601 instant and record event dates under attributes.event_date. \
Prefer stable, reusable predicate names such as works_at or is_married_to.";

pub const ENTITY_ADJUDICATION_SYSTEM_MESSAGE: &str = "You judge whether pairs \
of entity names refer to the same concept in one user's personal knowledge \
graph. Spelling, casing and abbreviation differences do not make two names \
different concepts; genuinely distinct people, places or things do. Answer \
for every pair, in order.";

pub const CONTRADICTION_SYSTEM_MESSAGE: &str = "You judge whether a new fact \
contradicts an existing fact about the same subject. Facts contradict when \
they cannot both hold at the same time, such as a changed employer or a \
relationship that ended. Coexisting facts, refinements and repetitions are \
not contradictions. Answer for every pair, in order.";

pub const TITLE_SYSTEM_MESSAGE: &str = "Write a short, specific title (at most \
eight words) for the given content. Return the title only.";

pub const SESSION_SUMMARY_SYSTEM_MESSAGE: &str = "Summarize the given sequence \
of episodes from one session into a compact narrative that preserves every \
durable fact, decision and preference. Write plain prose.";

pub fn extraction_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "candidates": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "subject_name": { "type": "string" },
                        "predicate_name": { "type": "string" },
                        "object_name": { "type": "string" },
                        "fact": { "type": "string" },
                        "aspect": {
                            "type": ["string", "null"],
                            "enum": [
                                "Event",
                                "Preference",
                                "Attribute",
                                "Relationship",
                                "Observation",
                                null
                            ]
                        },
                        "attributes": { "type": ["object", "null"] },
                        "valid_at": { "type": ["string", "null"] }
                    },
                    "required": [
                        "subject_name",
                        "predicate_name",
                        "object_name",
                        "fact",
                        "aspect",
                        "attributes",
                        "valid_at"
                    ],
                    "additionalProperties": false
                }
            }
        },
        "required": ["candidates"],
        "additionalProperties": false
    })
}

/// Schema for both adjudication calls: an ordered boolean verdict per pair.
pub fn adjudication_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "verdicts": {
                "type": "array",
                "items": { "type": "boolean" }
            }
        },
        "required": ["verdicts"],
        "additionalProperties": false
    })
}

pub fn title_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "title": { "type": "string" }
        },
        "required": ["title"],
        "additionalProperties": false
    })
}

pub fn summary_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "summary": { "type": "string" }
        },
        "required": ["summary"],
        "additionalProperties": false
    })
}
