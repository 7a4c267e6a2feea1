use super::{ActionInput, ActionOutcome, StepAction};
use crate::engine::Value;
use async_trait::async_trait;

/// `actual`과 `expected`를 `mode`에 따라 비교한다.
///
/// 지원 모드: `equals`(기본), `not-equals`, `contains`.
#[derive(Debug, Default, Clone)]
pub struct CompareAction;

#[async_trait]
impl StepAction for CompareAction {
    fn step_type(&self) -> &str {
        "compare"
    }

    async fn execute(&self, input: ActionInput) -> anyhow::Result<ActionOutcome> {
        let actual = input.required("actual")?;
        let expected = input.required("expected")?;
        let mode = input
            .inputs
            .get("mode")
            .and_then(Value::as_str)
            .unwrap_or("equals")
            .to_ascii_lowercase();
        let matched = match mode.as_str() {
            "equals" => actual == expected || actual.to_string() == expected.to_string(),
            "not-equals" => actual != expected && actual.to_string() != expected.to_string(),
            "contains" => contains(actual, expected),
            other => anyhow::bail!("지원하지 않는 비교 모드입니다: {other}"),
        };
        if matched {
            Ok(ActionOutcome::success().with_information(format!("[{actual}] {mode} [{expected}]")))
        } else {
            Ok(ActionOutcome::failure(format!(
                "[{actual}] is not {mode} [{expected}]"
            )))
        }
    }
}

fn contains(actual: &Value, expected: &Value) -> bool {
    match actual {
        Value::List(items) => items.contains(expected),
        Value::Set(items) => items.contains(expected),
        Value::Map(entries) => entries.contains_key(expected),
        other => other.to_string().contains(&expected.to_string()),
    }
}
