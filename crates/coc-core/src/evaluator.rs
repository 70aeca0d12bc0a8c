//! Response scoring.
//!
//! Evaluators never fail: whatever goes wrong becomes a low score with a
//! reason in `details`. The driver compares `score` against the directive's
//! approval threshold; `passed` is the evaluator's own verdict and is only
//! informational.

use async_trait::async_trait;

use crate::domain::{AcceptanceCriteria, EvaluationResult, ModelResponse, Task};

/// Markers that identify unfinished output.
pub const PLACEHOLDER_MARKERS: &[&str] = &["TODO", "TBD", "PLACEHOLDER", "lorem ipsum"];

#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(&self, task: &Task, response: &ModelResponse) -> EvaluationResult;
}

/// Minimal reference policy: non-empty output without a placeholder marker
/// scores 1.0, anything else 0.0.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaceholderEvaluator;

impl PlaceholderEvaluator {
    pub fn score(text: &str) -> EvaluationResult {
        if text.trim().is_empty() {
            return EvaluationResult::fail(0.0, vec!["empty response".to_string()]);
        }
        let lowered = text.to_lowercase();
        let found: Vec<String> = PLACEHOLDER_MARKERS
            .iter()
            .filter(|m| lowered.contains(&m.to_lowercase()))
            .map(|m| format!("placeholder marker: {m}"))
            .collect();
        if found.is_empty() {
            EvaluationResult::pass(1.0)
        } else {
            EvaluationResult::fail(0.0, found)
        }
    }
}

#[async_trait]
impl Evaluator for PlaceholderEvaluator {
    async fn evaluate(&self, _task: &Task, response: &ModelResponse) -> EvaluationResult {
        Self::score(&response.text)
    }
}

/// Scores a response against the task's acceptance criteria.
///
/// The score is the fraction of satisfied criteria; `passed` requires all of
/// them. Tasks without criteria use the placeholder rule.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptanceEvaluator;

impl AcceptanceEvaluator {
    pub fn check(criteria: &AcceptanceCriteria, text: &str) -> EvaluationResult {
        if text.trim().is_empty() {
            return EvaluationResult::fail(0.0, vec!["empty response".to_string()]);
        }
        let lowered = text.to_lowercase();
        let length = text.trim().chars().count();
        let mut total = 0usize;
        let mut failed = Vec::new();

        for needle in &criteria.required {
            total += 1;
            if !lowered.contains(&needle.to_lowercase()) {
                failed.push(format!("required: missing '{needle}'"));
            }
        }
        for needle in &criteria.forbidden {
            total += 1;
            if lowered.contains(&needle.to_lowercase()) {
                failed.push(format!("forbidden: found '{needle}'"));
            }
        }
        if let Some(min) = criteria.min_length {
            total += 1;
            if length < min {
                failed.push(format!("min_length: {length} < {min}"));
            }
        }
        if let Some(max) = criteria.max_length {
            total += 1;
            if length > max {
                failed.push(format!("max_length: {length} > {max}"));
            }
        }
        if !criteria.json_fields.is_empty() {
            let parsed = serde_json::from_str::<serde_json::Value>(text.trim()).ok();
            let object = parsed.as_ref().and_then(|v| v.as_object());
            for field in &criteria.json_fields {
                total += 1;
                match object {
                    Some(obj) if obj.contains_key(field) => {}
                    Some(_) => failed.push(format!("json_fields: missing '{field}'")),
                    None => failed.push(format!("json_fields: '{field}' (response is not a JSON object)")),
                }
            }
        }

        if total == 0 {
            return PlaceholderEvaluator::score(text);
        }
        let score = (total - failed.len()) as f64 / total as f64;
        if failed.is_empty() {
            EvaluationResult::pass(score)
        } else {
            EvaluationResult::fail(score, failed)
        }
    }
}

#[async_trait]
impl Evaluator for AcceptanceEvaluator {
    async fn evaluate(&self, task: &Task, response: &ModelResponse) -> EvaluationResult {
        match task.acceptance.as_ref().filter(|c| !c.is_empty()) {
            Some(criteria) => Self::check(criteria, &response.text),
            None => PlaceholderEvaluator::score(&response.text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_rule() {
        assert_eq!(PlaceholderEvaluator::score("all good").score, 1.0);
        assert_eq!(PlaceholderEvaluator::score("   ").score, 0.0);

        let r = PlaceholderEvaluator::score("step 1: TODO");
        assert_eq!(r.score, 0.0);
        assert!(!r.passed);
        assert_eq!(r.details, vec!["placeholder marker: TODO"]);
    }

    #[test]
    fn fractional_acceptance_score() {
        let criteria = AcceptanceCriteria {
            required: vec!["endpoint".into(), "schema".into()],
            forbidden: vec!["panic".into()],
            min_length: Some(10),
            ..AcceptanceCriteria::default()
        };
        let r = AcceptanceEvaluator::check(&criteria, "The endpoint returns 200 and may panic");
        assert_eq!(r.score, 0.5);
        assert!(!r.passed);
        assert_eq!(
            r.details,
            vec!["required: missing 'schema'", "forbidden: found 'panic'"]
        );
    }

    #[test]
    fn json_fields_checked_on_object() {
        let criteria = AcceptanceCriteria {
            json_fields: vec!["name".into(), "version".into()],
            ..AcceptanceCriteria::default()
        };
        let ok = AcceptanceEvaluator::check(&criteria, r#"{"name":"coc","version":"0.1"}"#);
        assert!(ok.passed);
        assert_eq!(ok.score, 1.0);

        let not_json = AcceptanceEvaluator::check(&criteria, "name: coc");
        assert_eq!(not_json.score, 0.0);
        assert_eq!(not_json.details.len(), 2);
    }

    #[test]
    fn length_bounds() {
        let criteria = AcceptanceCriteria {
            min_length: Some(3),
            max_length: Some(5),
            ..AcceptanceCriteria::default()
        };
        assert!(AcceptanceEvaluator::check(&criteria, "abcd").passed);
        assert_eq!(
            AcceptanceEvaluator::check(&criteria, "abcdefgh").details,
            vec!["max_length: 8 > 5"]
        );
    }

    #[tokio::test]
    async fn falls_back_without_criteria() {
        let task = Task::new("t", "x", "worker");
        let r = AcceptanceEvaluator
            .evaluate(&task, &ModelResponse::text("lorem ipsum dolor"))
            .await;
        assert_eq!(r.score, 0.0);

        let mut with_empty = task.clone();
        with_empty.acceptance = Some(AcceptanceCriteria::default());
        let r = AcceptanceEvaluator
            .evaluate(&with_empty, &ModelResponse::text("done"))
            .await;
        assert_eq!(r.score, 1.0);
    }
}
