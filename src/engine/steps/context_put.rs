use super::{ActionInput, ActionOutcome, StepAction};
use crate::engine::Value;
use async_trait::async_trait;

/// `entries` 맵의 값을 출력으로 내보내 컨텍스트에 게시한다.
#[derive(Debug, Default, Clone)]
pub struct ContextPutAction;

#[async_trait]
impl StepAction for ContextPutAction {
    fn step_type(&self) -> &str {
        "context-put"
    }

    async fn execute(&self, input: ActionInput) -> anyhow::Result<ActionOutcome> {
        let Value::Map(entries) = input.required("entries")? else {
            anyhow::bail!("entries는 맵이어야 합니다: Step '{}'", input.step_name);
        };
        let mut outcome = ActionOutcome::success();
        for (key, value) in entries {
            let name = match key {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            outcome
                .information
                .push(format!("Adding to context {name} : [{value}]"));
            outcome.outputs.insert(name, value.clone());
        }
        Ok(outcome)
    }
}
