use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tracing::warn;

use super::AnalysisLevel;
use crate::error::ServiceError;
use crate::interval::{RemovalInterval, RemovalKind};

const PROVIDER: &str = "analysis";

static FENCED_JSON: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"```(?:json)?\s*([\s\S]+?)\s*```").expect("fence pattern is valid"));

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Envelope {
    Wrapped {
        #[serde(default)]
        data: Vec<RawRecord>,
    },
    Bare(Vec<RawRecord>),
}

#[derive(Debug, Deserialize)]
struct RawRecord {
    #[serde(alias = "startTime", alias = "start")]
    start_time: Timestamp,
    #[serde(alias = "endTime", alias = "end")]
    end_time: Timestamp,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(alias = "isEntire", default)]
    is_entire: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Timestamp {
    Number(f64),
    Text(String),
}

impl Timestamp {
    fn seconds(&self) -> Option<f64> {
        let value = match self {
            Timestamp::Number(n) => *n,
            Timestamp::Text(s) => s.trim().parse().ok()?,
        };
        value.is_finite().then_some(value)
    }
}

/// Pull the JSON body out of a model response, raw or inside a ``` fence.
fn extract_json(raw: &str) -> Result<Envelope, ServiceError> {
    if let Ok(envelope) = serde_json::from_str::<Envelope>(raw.trim()) {
        return Ok(envelope);
    }
    let fenced = FENCED_JSON
        .captures(raw)
        .and_then(|c| c.get(1))
        .ok_or_else(|| ServiceError::invalid_response(PROVIDER, "response is not JSON"))?;
    serde_json::from_str(fenced.as_str())
        .map_err(|e| ServiceError::invalid_response(PROVIDER, format!("invalid JSON inside code fence: {}", e)))
}

fn parse_kind(kind: Option<&str>) -> RemovalKind {
    match kind.map(|k| k.trim().to_ascii_lowercase()).as_deref() {
        None | Some("") | Some("repetition") => RemovalKind::Repetition,
        Some("filler_word") | Some("filler") => RemovalKind::FillerWord,
        Some("long_pause") | Some("pause") => RemovalKind::LongPause,
        Some("manual") => RemovalKind::Manual,
        Some(other) => {
            warn!(kind = other, "Unknown removal type, treating as repetition");
            RemovalKind::Repetition
        }
    }
}

/// Parse a model response into removal intervals.
///
/// `start_offset` is subtracted from every start (clamped at zero). Records
/// with unreadable timestamps or an empty span are dropped.
pub fn parse_analysis_response(
    raw: &str,
    level: AnalysisLevel,
    start_offset: f64,
) -> Result<Vec<RemovalInterval>, ServiceError> {
    let records = match extract_json(raw)? {
        Envelope::Wrapped { data } => data,
        Envelope::Bare(data) => data,
    };

    let mut removals = Vec::with_capacity(records.len());
    for record in records {
        let (Some(start), Some(end)) = (record.start_time.seconds(), record.end_time.seconds()) else {
            warn!(?record, "Dropping analysis record with unreadable timestamps");
            continue;
        };
        let start = (start - start_offset).max(0.0);
        if end <= start {
            warn!(start, end, "Dropping empty analysis record");
            continue;
        }
        let is_entire = match level {
            AnalysisLevel::Sentence => record.is_entire.unwrap_or(true),
            AnalysisLevel::Word => false,
        };
        removals.push(RemovalInterval::new(
            start,
            end,
            parse_kind(record.kind.as_deref()),
            is_entire,
        ));
    }
    Ok(removals)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_camel_case_string_timestamps() {
        let raw = r#"{"data": [
            {"startTime": "0.32", "endTime": "2.26", "type": "repetition", "isEntire": true},
            {"startTime": "12.32", "endTime": "13.10", "type": "repetition", "isEntire": false}
        ]}"#;
        let removals = parse_analysis_response(raw, AnalysisLevel::Sentence, 0.09).unwrap();
        assert_eq!(removals.len(), 2);
        assert!((removals[0].start_time - 0.23).abs() < 1e-9);
        assert_eq!(removals[0].end_time, 2.26);
        assert!(removals[0].is_entire_segment);
        assert!(!removals[1].is_entire_segment);
    }

    #[test]
    fn accepts_fenced_snake_case_numbers() {
        let raw = "Here you go:\n```json\n{\"data\": [{\"start_time\": 4.0, \"end_time\": 5.5, \"type\": \"filler_word\"}]}\n```\n";
        let removals = parse_analysis_response(raw, AnalysisLevel::Sentence, 0.0).unwrap();
        assert_eq!(removals, vec![RemovalInterval::new(4.0, 5.5, RemovalKind::FillerWord, true)]);
    }

    #[test]
    fn word_level_records_are_never_entire() {
        let raw = r#"{"data": [{"startTime": "1.0", "endTime": "1.4", "isEntire": true}]}"#;
        let removals = parse_analysis_response(raw, AnalysisLevel::Word, 0.09).unwrap();
        assert!(!removals[0].is_entire_segment);
        assert_eq!(removals[0].kind, RemovalKind::Repetition);
    }

    #[test]
    fn offset_clamps_at_zero_and_empty_spans_drop() {
        let raw = r#"{"data": [
            {"startTime": "0.05", "endTime": "1.0"},
            {"startTime": "3.0", "endTime": "2.9"},
            {"startTime": "abc", "endTime": "4.0"}
        ]}"#;
        let removals = parse_analysis_response(raw, AnalysisLevel::Sentence, 0.09).unwrap();
        assert_eq!(removals.len(), 1);
        assert_eq!(removals[0].start_time, 0.0);
    }

    #[test]
    fn empty_data_is_not_an_error() {
        assert!(parse_analysis_response(r#"{"data": []}"#, AnalysisLevel::Sentence, 0.09)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn prose_is_rejected() {
        assert!(parse_analysis_response("I could not find any repetitions.", AnalysisLevel::Sentence, 0.09).is_err());
        assert!(parse_analysis_response("```json\n{oops}\n```", AnalysisLevel::Sentence, 0.09).is_err());
    }
}
