use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Step 실패 시 나머지 Step을 어떻게 다룰지 결정한다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// 형제 Step을 계속 실행한다.
    #[default]
    Continue,
    /// 첫 실패에서 멈추고 남은 Step은 NOT_EXECUTED로 둔다.
    Stop,
}

/// 실행 엔진 설정이다. 모든 항목에 기본값이 있다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct EngineConfig {
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Step 시도당 기본 제한 시간(ms).
    #[serde(default = "default_step_timeout_ms")]
    pub default_step_timeout_ms: u64,

    /// 에이전트 TCP 연결 확인 제한 시간(ms).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// 원격 실행 호출 제한 시간(ms).
    #[serde(default = "default_delegation_timeout_ms")]
    pub delegation_timeout_ms: u64,

    /// 재시도 첫 대기 시간(ms). 이후 두 배씩 늘어난다.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

fn default_step_timeout_ms() -> u64 {
    60_000
}

fn default_connect_timeout_ms() -> u64 {
    1_000
}

fn default_delegation_timeout_ms() -> u64 {
    30_000
}

fn default_retry_base_delay_ms() -> u64 {
    1_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::default(),
            default_step_timeout_ms: default_step_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            delegation_timeout_ms: default_delegation_timeout_ms(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

impl EngineConfig {
    /// YAML 또는 JSON 설정 파일을 읽는다.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("설정 파일을 읽을 수 없습니다: {}", path.display()))?;
        Self::parse(&text)
            .with_context(|| format!("설정 파일 형식 오류: {}", path.display()))
    }

    /// 설정 문서 문자열을 해석한다. 빈 문서는 기본값이다.
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.default_step_timeout_ms.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }

    pub fn delegation_timeout(&self) -> Duration {
        Duration::from_millis(self.delegation_timeout_ms.max(1))
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}
