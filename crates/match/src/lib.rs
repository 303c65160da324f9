//! Outcome ingestion: message parsing, outcome classification, and the
//! record-linkage cascade that ties messages (and call logs) back to
//! applications.

mod cascade;
mod outcome;
mod parse;

pub use cascade::{
    CascadeConfig, MatchDecision, RankedCandidate, cascade_match, entity_similarity,
    match_call_log,
};
pub use outcome::{OutcomeCall, classify_outcome};
pub use parse::{MessageParser, ParsedMessage, html_to_text, root_domain, root_label};
