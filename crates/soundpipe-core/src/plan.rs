//! Design plan loading and validation.
//!
//! A plan is a JSON document with a `theme` and a non-empty `samples`
//! array; each sample carries a stable id, a seed description, and a
//! requested duration. Parsing failures abort the run before any task
//! is scheduled.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use crate::types::{Plan, PlanItem};

/// Error type for plan loading.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("failed to read plan file: {0}")]
    Io(String),
    #[error("failed to parse plan: {0}")]
    Parse(String),
    #[error("plan contains no samples")]
    Empty,
    #[error("duplicate sample id: {0}")]
    DuplicateId(String),
    #[error("sample {id} has non-positive duration {duration_s}")]
    InvalidDuration { id: String, duration_s: String },
    #[error("sample at position {0} has an empty id")]
    EmptyId(usize),
}

/// Load and validate a plan from a JSON file.
pub fn load_plan(path: &Path) -> Result<Plan, PlanError> {
    let content = fs::read_to_string(path).map_err(|e| PlanError::Io(e.to_string()))?;
    parse_plan(&content)
}

/// Parse and validate plan content.
///
/// This is the core logic, separated for testing.
pub fn parse_plan(content: &str) -> Result<Plan, PlanError> {
    let plan: Plan =
        serde_json::from_str(content).map_err(|e| PlanError::Parse(e.to_string()))?;
    validate(&plan)?;
    Ok(plan)
}

fn validate(plan: &Plan) -> Result<(), PlanError> {
    if plan.samples.is_empty() {
        return Err(PlanError::Empty);
    }

    let mut seen: HashSet<&str> = HashSet::new();
    for (position, sample) in plan.samples.iter().enumerate() {
        if sample.id.trim().is_empty() {
            return Err(PlanError::EmptyId(position));
        }
        if !seen.insert(sample.id.as_str()) {
            return Err(PlanError::DuplicateId(sample.id.clone()));
        }
        if sample.duration_s <= 0.0 {
            return Err(PlanError::InvalidDuration {
                id: sample.id.clone(),
                duration_s: sample.duration_s.to_string(),
            });
        }
    }

    Ok(())
}

/// Serialize a single plan item as the Analyze stage's input payload.
pub fn item_payload(item: &PlanItem) -> String {
    serde_json::json!({
        "id": item.id,
        "seed_description": item.seed_description,
        "duration_s": item.duration_s,
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_PLAN: &str = r#"{
        "theme": "derelict spacecraft interiors",
        "samples": [
            {"id": "A1", "seed_description": "hull groan, metallic, slow", "duration_s": 8.0},
            {"id": "A2", "seed_description": "air recycler hum with flutter", "duration_s": 12.5}
        ]
    }"#;

    #[test]
    fn parses_valid_plan() {
        let plan = parse_plan(VALID_PLAN).unwrap();
        assert_eq!(plan.theme, "derelict spacecraft interiors");
        assert_eq!(plan.samples.len(), 2);
        assert_eq!(plan.samples[0].id, "A1");
        assert!((plan.samples[1].duration_s - 12.5).abs() < f64::EPSILON);
    }

    #[test]
    fn rejects_malformed_json() {
        let err = parse_plan("{not json").unwrap_err();
        assert!(matches!(err, PlanError::Parse(_)));
    }

    #[test]
    fn rejects_missing_fields() {
        let err = parse_plan(r#"{"theme": "x", "samples": [{"id": "A1"}]}"#).unwrap_err();
        assert!(matches!(err, PlanError::Parse(_)));
    }

    #[test]
    fn rejects_empty_sample_list() {
        let err = parse_plan(r#"{"theme": "x", "samples": []}"#).unwrap_err();
        assert_eq!(err, PlanError::Empty);
    }

    #[test]
    fn rejects_duplicate_ids() {
        let content = r#"{
            "theme": "x",
            "samples": [
                {"id": "A1", "seed_description": "one", "duration_s": 1.0},
                {"id": "A1", "seed_description": "two", "duration_s": 2.0}
            ]
        }"#;
        let err = parse_plan(content).unwrap_err();
        assert_eq!(err, PlanError::DuplicateId("A1".to_string()));
    }

    #[test]
    fn rejects_non_positive_duration() {
        let content = r#"{
            "theme": "x",
            "samples": [{"id": "A1", "seed_description": "one", "duration_s": 0.0}]
        }"#;
        let err = parse_plan(content).unwrap_err();
        assert!(matches!(err, PlanError::InvalidDuration { .. }));
    }

    #[test]
    fn rejects_blank_id() {
        let content = r#"{
            "theme": "x",
            "samples": [{"id": "  ", "seed_description": "one", "duration_s": 1.0}]
        }"#;
        let err = parse_plan(content).unwrap_err();
        assert_eq!(err, PlanError::EmptyId(0));
    }

    #[test]
    fn load_plan_reports_missing_file() {
        let err = load_plan(Path::new("/nonexistent/plan.json")).unwrap_err();
        assert!(matches!(err, PlanError::Io(_)));
    }

    #[test]
    fn load_plan_reads_from_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("plan.json");
        std::fs::write(&path, VALID_PLAN).unwrap();

        let plan = load_plan(&path).unwrap();
        assert_eq!(plan.samples.len(), 2);
    }

    #[test]
    fn item_payload_round_trips() {
        let plan = parse_plan(VALID_PLAN).unwrap();
        let payload = item_payload(&plan.samples[0]);
        let back: crate::types::PlanItem = serde_json::from_str(&payload).unwrap();
        assert_eq!(back, plan.samples[0]);
    }
}
