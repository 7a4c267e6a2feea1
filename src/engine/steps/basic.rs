use super::{ActionInput, ActionOutcome, StepAction};
use async_trait::async_trait;
use tracing::info;

/// 항상 성공하는 액션이다.
#[derive(Debug, Default, Clone)]
pub struct SuccessAction;

#[async_trait]
impl StepAction for SuccessAction {
    fn step_type(&self) -> &str {
        "success"
    }

    async fn execute(&self, _input: ActionInput) -> anyhow::Result<ActionOutcome> {
        Ok(ActionOutcome::success())
    }
}

/// 항상 실패하는 액션이다. `message` 입력이 있으면 오류 메시지로 쓴다.
#[derive(Debug, Default, Clone)]
pub struct FailAction;

#[async_trait]
impl StepAction for FailAction {
    fn step_type(&self) -> &str {
        "fail"
    }

    async fn execute(&self, input: ActionInput) -> anyhow::Result<ActionOutcome> {
        let message = input
            .inputs
            .get("message")
            .map(ToString::to_string)
            .unwrap_or_else(|| format!("Step '{}' 실패", input.step_name));
        Ok(ActionOutcome::failure(message))
    }
}

/// 현재 컨텍스트 변수 목록을 로그와 information으로 남긴다.
#[derive(Debug, Default, Clone)]
pub struct DebugAction;

#[async_trait]
impl StepAction for DebugAction {
    fn step_type(&self) -> &str {
        "debug"
    }

    async fn execute(&self, input: ActionInput) -> anyhow::Result<ActionOutcome> {
        let mut outcome = ActionOutcome::success();
        for (key, value) in &input.context {
            info!(step = %input.step_name, %key, %value, "context");
            outcome.information.push(format!("{key} : [{value}]"));
        }
        Ok(outcome)
    }
}
