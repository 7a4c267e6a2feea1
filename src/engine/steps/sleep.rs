use super::{ActionInput, ActionOutcome, StepAction};
use crate::engine::Value;
use anyhow::Context;
use async_trait::async_trait;
use std::time::Duration;

/// `duration` 입력만큼 대기하는 액션이다.
#[derive(Debug, Default, Clone)]
pub struct SleepAction;

#[async_trait]
impl StepAction for SleepAction {
    fn step_type(&self) -> &str {
        "sleep"
    }

    async fn execute(&self, input: ActionInput) -> anyhow::Result<ActionOutcome> {
        let duration = match input.required("duration")? {
            Value::Int(ms) if *ms >= 0 => Duration::from_millis(*ms as u64),
            Value::String(text) => parse_duration(text)
                .with_context(|| format!("Step '{}' duration 해석 실패", input.step_name))?,
            other => anyhow::bail!("duration은 ms 숫자나 문자열이어야 합니다: {other}"),
        };
        tokio::time::sleep(duration).await;
        Ok(ActionOutcome::success().with_information(format!("{}ms 대기", duration.as_millis())))
    }
}

/// `"250ms"`, `"30s"`, `"5m"`, `"2h"` 형식의 기간을 해석한다. 단위가 없으면 ms이다.
pub fn parse_duration(input: &str) -> anyhow::Result<Duration> {
    let text = input.trim();
    if text.is_empty() {
        anyhow::bail!("빈 duration 값입니다.");
    }
    let split = text
        .char_indices()
        .find(|(_, ch)| !ch.is_ascii_digit())
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    if split == 0 {
        anyhow::bail!("duration에 숫자가 없습니다: {input:?}");
    }
    let (number, unit) = text.split_at(split);
    let value: u64 = number
        .parse()
        .with_context(|| format!("duration 숫자 해석 실패: {input:?}"))?;
    let duration = match unit.trim() {
        "" | "ms" => Duration::from_millis(value),
        "s" => Duration::from_secs(value),
        "m" => Duration::from_secs(value.saturating_mul(60)),
        "h" => Duration::from_secs(value.saturating_mul(60 * 60)),
        other => anyhow::bail!("알 수 없는 duration 단위 {other:?} (ms|s|m|h)"),
    };
    Ok(duration)
}
