//! Inter-step references in step configs.
//!
//! A string inside a step's `config` may reference the output of an earlier
//! step:
//!
//! - `${step0}` -- the whole output of step 0
//! - `${step0.user.email}` -- a dotted path into it; numeric segments index arrays
//!
//! A string that is exactly one reference is replaced by the referenced JSON
//! value, keeping its type. References embedded in longer text are
//! interpolated: strings verbatim, anything else as compact JSON.
//!
//! A literal `${` is written `$${`: `"Total: $${amount}"` resolves to
//! `"Total: ${amount}"` and references nothing.
//!
//! Every failure is an error. Nothing resolves to an empty string.

use reportflow_types::error::TemplateError;
use reportflow_types::workflow::WorkflowStep;
use serde_json::Value;

const OPEN: &str = "${";
const CLOSE: char = '}';
const ESCAPE: char = '$';

/// A parsed `${stepK.a.b}` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReference {
    pub step: usize,
    pub path: Vec<String>,
}

impl StepReference {
    fn parse(expr: &str) -> Result<Self, TemplateError> {
        let invalid = || TemplateError::InvalidReference(expr.to_string());

        let mut segments = expr.trim().split('.');
        let head = segments.next().ok_or_else(invalid)?;
        let index = head.strip_prefix("step").ok_or_else(invalid)?;
        if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let step = index.parse::<usize>().map_err(|_| invalid())?;

        let path: Vec<String> = segments.map(str::to_string).collect();
        if path.iter().any(|s| s.is_empty()) {
            return Err(invalid());
        }
        Ok(Self { step, path })
    }

    fn lookup<'a>(
        &self,
        steps: &'a [WorkflowStep],
        current: usize,
    ) -> Result<&'a Value, TemplateError> {
        if self.step >= current {
            return Err(TemplateError::ForwardReference {
                current,
                referenced: self.step,
            });
        }
        let output = steps
            .get(self.step)
            .and_then(|s| s.output.as_ref())
            .ok_or(TemplateError::MissingOutput(self.step))?;

        let mut value = output;
        for segment in &self.path {
            let next = match value {
                Value::Object(map) => map.get(segment),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            };
            value = next.ok_or_else(|| TemplateError::UnresolvedPath {
                step: self.step,
                path: self.path.join("."),
            })?;
        }
        Ok(value)
    }
}

// ---------------------------------------------------------------------------
// Scanning
// ---------------------------------------------------------------------------

enum Piece<'a> {
    Text(&'a str),
    Reference(StepReference),
}

/// Split a string into literal text and references.
fn scan(input: &str) -> Result<Vec<Piece<'_>>, TemplateError> {
    let mut pieces = Vec::new();
    let mut rest = input;

    while let Some(start) = rest.find(OPEN) {
        let before = &rest[..start];
        if let Some(text) = before.strip_suffix(ESCAPE) {
            if !text.is_empty() {
                pieces.push(Piece::Text(text));
            }
            pieces.push(Piece::Text(OPEN));
            rest = &rest[start + OPEN.len()..];
            continue;
        }
        if !before.is_empty() {
            pieces.push(Piece::Text(before));
        }
        let after = &rest[start + OPEN.len()..];
        let end = after
            .find(CLOSE)
            .ok_or_else(|| TemplateError::Malformed(input.to_string()))?;
        pieces.push(Piece::Reference(StepReference::parse(&after[..end])?));
        rest = &after[end + 1..];
    }
    if !rest.is_empty() {
        pieces.push(Piece::Text(rest));
    }
    Ok(pieces)
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn resolve_str(
    input: &str,
    steps: &[WorkflowStep],
    current: usize,
) -> Result<Value, TemplateError> {
    let pieces = scan(input)?;

    if let [Piece::Reference(reference)] = pieces.as_slice() {
        return reference.lookup(steps, current).cloned();
    }

    let mut out = String::with_capacity(input.len());
    for piece in &pieces {
        match piece {
            Piece::Text(text) => out.push_str(text),
            Piece::Reference(reference) => {
                out.push_str(&value_to_text(reference.lookup(steps, current)?));
            }
        }
    }
    Ok(Value::String(out))
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Resolve every reference in `config` for the step at index `current`.
///
/// Only outputs of steps before `current` are visible. Object keys are never
/// templated.
pub fn resolve_config(
    config: &Value,
    steps: &[WorkflowStep],
    current: usize,
) -> Result<Value, TemplateError> {
    match config {
        Value::String(s) => resolve_str(s, steps, current),
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_config(item, steps, current))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut resolved = serde_json::Map::with_capacity(map.len());
            for (key, value) in map {
                resolved.insert(key.clone(), resolve_config(value, steps, current)?);
            }
            Ok(Value::Object(resolved))
        }
        other => Ok(other.clone()),
    }
}

/// Every step index referenced anywhere in `config`, in order of appearance.
///
/// Used to reject forward references before a workflow is stored.
pub fn referenced_steps(config: &Value) -> Result<Vec<usize>, TemplateError> {
    let mut found = Vec::new();
    collect_references(config, &mut found)?;
    Ok(found)
}

fn collect_references(config: &Value, found: &mut Vec<usize>) -> Result<(), TemplateError> {
    match config {
        Value::String(s) => {
            for piece in scan(s)? {
                if let Piece::Reference(reference) = piece {
                    found.push(reference.step);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_references(item, found)?;
            }
        }
        Value::Object(map) => {
            for value in map.values() {
                collect_references(value, found)?;
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use reportflow_types::workflow::{StepDefinition, StepStatus};
    use serde_json::json;

    fn steps_with_outputs(outputs: Vec<Option<Value>>) -> Vec<WorkflowStep> {
        outputs
            .into_iter()
            .enumerate()
            .map(|(i, output)| {
                let mut step = WorkflowStep::from_definition(StepDefinition {
                    name: format!("step-{i}"),
                    tool: "echo".to_string(),
                    config: json!({}),
                });
                if output.is_some() {
                    step.status = StepStatus::Completed;
                }
                step.output = output;
                step
            })
            .collect()
    }

    #[test]
    fn resolves_dotted_path_into_earlier_output() {
        let steps = steps_with_outputs(vec![
            Some(json!({ "user": { "email": "a@b.com" } })),
            None,
        ]);
        let config = json!({ "to": "${step0.user.email}" });

        let resolved = resolve_config(&config, &steps, 1).unwrap();
        assert_eq!(resolved, json!({ "to": "a@b.com" }));
    }

    #[test]
    fn forward_reference_is_rejected() {
        let steps = steps_with_outputs(vec![Some(json!({})), None, None]);
        let config = json!({ "body": "${step2.summary}" });

        let err = resolve_config(&config, &steps, 1).unwrap_err();
        assert_eq!(
            err,
            TemplateError::ForwardReference {
                current: 1,
                referenced: 2
            }
        );
    }

    #[test]
    fn self_reference_is_rejected() {
        let steps = steps_with_outputs(vec![None]);
        let err = resolve_config(&json!("${step0}"), &steps, 0).unwrap_err();
        assert!(matches!(err, TemplateError::ForwardReference { .. }));
    }

    #[test]
    fn unresolved_path_fails_instead_of_emptying() {
        let steps = steps_with_outputs(vec![Some(json!({ "user": {} })), None]);
        let err = resolve_config(&json!("Hi ${step0.user.name}"), &steps, 1).unwrap_err();
        assert_eq!(
            err,
            TemplateError::UnresolvedPath {
                step: 0,
                path: "user.name".to_string()
            }
        );
    }

    #[test]
    fn whole_reference_keeps_json_type() {
        let steps = steps_with_outputs(vec![
            Some(json!({ "rows": [{ "vin": "1HG" }, { "vin": "2T1" }], "count": 2 })),
            None,
        ]);

        assert_eq!(
            resolve_config(&json!("${step0.count}"), &steps, 1).unwrap(),
            json!(2)
        );
        assert_eq!(
            resolve_config(&json!("${step0.rows.1.vin}"), &steps, 1).unwrap(),
            json!("2T1")
        );
        assert_eq!(
            resolve_config(&json!("${step0.rows}"), &steps, 1).unwrap(),
            json!([{ "vin": "1HG" }, { "vin": "2T1" }])
        );
    }

    #[test]
    fn embedded_references_are_interpolated() {
        let steps = steps_with_outputs(vec![
            Some(json!({ "name": "Acme Motors", "count": 14 })),
            Some(json!(["a", "b"])),
            None,
        ]);
        let config = json!({
            "subject": "${step0.name}: ${step0.count} leads",
            "debug": "items=${step1}",
            "nested": ["${step1.0}", { "deep": "${step0.name}" }],
            "untouched": 7,
        });

        let resolved = resolve_config(&config, &steps, 2).unwrap();
        assert_eq!(
            resolved,
            json!({
                "subject": "Acme Motors: 14 leads",
                "debug": "items=[\"a\",\"b\"]",
                "nested": ["a", { "deep": "Acme Motors" }],
                "untouched": 7,
            })
        );
    }

    #[test]
    fn missing_output_is_an_error() {
        let steps = steps_with_outputs(vec![None, None]);
        let err = resolve_config(&json!("${step0}"), &steps, 1).unwrap_err();
        assert_eq!(err, TemplateError::MissingOutput(0));
    }

    #[test]
    fn malformed_and_invalid_references() {
        let steps = steps_with_outputs(vec![Some(json!({})), None]);

        assert!(matches!(
            resolve_config(&json!("x ${step0.name"), &steps, 1),
            Err(TemplateError::Malformed(_))
        ));
        assert!(matches!(
            resolve_config(&json!("${user.name}"), &steps, 1),
            Err(TemplateError::InvalidReference(_))
        ));
        assert!(matches!(
            resolve_config(&json!("${step}"), &steps, 1),
            Err(TemplateError::InvalidReference(_))
        ));
        assert!(matches!(
            resolve_config(&json!("${step0..x}"), &steps, 1),
            Err(TemplateError::InvalidReference(_))
        ));
    }

    #[test]
    fn plain_strings_pass_through() {
        let steps = steps_with_outputs(vec![]);
        assert_eq!(
            resolve_config(&json!({ "a": "no refs $ here {}" }), &steps, 0).unwrap(),
            json!({ "a": "no refs $ here {}" })
        );
    }

    #[test]
    fn escaped_open_is_literal() {
        let steps = steps_with_outputs(vec![Some(json!({ "total": 42 })), None]);

        assert_eq!(
            resolve_config(&json!("Total: $${amount}"), &steps, 1).unwrap(),
            json!("Total: ${amount}")
        );
        assert_eq!(
            resolve_config(&json!("$${step0}"), &steps, 1).unwrap(),
            json!("${step0}")
        );
        assert_eq!(
            resolve_config(&json!("$${amount} = ${step0.total}"), &steps, 1).unwrap(),
            json!("${amount} = 42")
        );
        // An escaped opener needs no closing brace.
        assert_eq!(
            resolve_config(&json!("costs $${"), &steps, 1).unwrap(),
            json!("costs ${")
        );
    }

    #[test]
    fn escaped_open_is_not_a_reference() {
        let config = json!({ "body": "Total: $${amount}", "to": "${step1.email}" });
        assert_eq!(referenced_steps(&config).unwrap(), vec![1]);
        assert!(referenced_steps(&json!("$${step9}")).unwrap().is_empty());
    }

    #[test]
    fn referenced_steps_collects_all() {
        let config = json!({
            "a": "${step0.x}",
            "b": ["${step2}", "t ${step1.y} ${step0}"],
        });
        let mut refs = referenced_steps(&config).unwrap();
        refs.sort_unstable();
        assert_eq!(refs, vec![0, 0, 1, 2]);
    }
}
