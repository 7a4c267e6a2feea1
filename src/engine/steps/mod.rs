use super::value::Value;
use crate::scenario::Target;
use async_trait::async_trait;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

mod basic;
mod compare;
mod context_put;
mod sleep;

pub use basic::{DebugAction, FailAction, SuccessAction};
pub use compare::CompareAction;
pub use context_put::ContextPutAction;
pub use sleep::{SleepAction, parse_duration};

/// 액션 하나의 실행 결과 상태이다.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionStatus {
    Success,
    Failure,
}

/// 액션 실행 결과이다.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionOutcome {
    pub status: ActionStatus,
    /// 컨텍스트에 게시될 값.
    pub outputs: IndexMap<String, Value>,
    pub errors: Vec<String>,
    pub information: Vec<String>,
}

impl ActionOutcome {
    pub fn success() -> Self {
        Self {
            status: ActionStatus::Success,
            outputs: IndexMap::new(),
            errors: Vec::new(),
            information: Vec::new(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: ActionStatus::Failure,
            errors: vec![message.into()],
            ..Self::success()
        }
    }

    pub fn with_output(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.outputs.insert(key.into(), value.into());
        self
    }

    pub fn with_information(mut self, line: impl Into<String>) -> Self {
        self.information.push(line.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ActionStatus::Success
    }
}

/// 액션에 전달되는 평가된 입력이다.
#[derive(Debug, Clone)]
pub struct ActionInput {
    pub step_name: String,
    /// 평가가 끝난 입력 값.
    pub inputs: IndexMap<String, Value>,
    /// Step이 참조하는 대상. 없으면 `Target::none()`.
    pub target: Target,
    /// 실행 시점 컨텍스트의 읽기 전용 사본.
    pub context: IndexMap<String, Value>,
}

impl ActionInput {
    /// 필수 입력을 조회한다.
    pub fn required(&self, key: &str) -> anyhow::Result<&Value> {
        self.inputs
            .get(key)
            .ok_or_else(|| anyhow::anyhow!("'{}' 입력이 필요합니다: Step '{}'", key, self.step_name))
    }
}

/// Step 종류별로 등록되는 실행 단위이다.
#[async_trait]
pub trait StepAction: Send + Sync {
    /// 시나리오의 `type` 값과 일치하는 이름.
    fn step_type(&self) -> &str;

    /// 평가된 입력으로 액션을 실행한다.
    ///
    /// `Err`는 재시도 대상 실패로 취급된다.
    async fn execute(&self, input: ActionInput) -> anyhow::Result<ActionOutcome>;

    /// 실패 시 정책과 무관하게 실행 전체를 멈춰야 하는지 여부.
    fn fatal_on_failure(&self) -> bool {
        false
    }
}

/// StepAction을 공유하기 위한 Arc 타입 별칭이다.
pub type SharedAction = Arc<dyn StepAction>;

/// Step 종류 이름과 액션을 매핑한다.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: HashMap<String, SharedAction>,
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.actions.keys().collect();
        names.sort();
        f.debug_struct("ActionRegistry").field("actions", &names).finish()
    }
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 기본 제공 액션이 모두 등록된 레지스트리를 반환한다.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(SuccessAction));
        registry.register(Arc::new(FailAction));
        registry.register(Arc::new(SleepAction));
        registry.register(Arc::new(ContextPutAction));
        registry.register(Arc::new(DebugAction));
        registry.register(Arc::new(CompareAction));
        registry
    }

    /// 같은 이름이 있으면 교체한다.
    pub fn register(&mut self, action: SharedAction) {
        self.actions.insert(action.step_type().to_string(), action);
    }

    pub fn get(&self, step_type: &str) -> Option<SharedAction> {
        self.actions.get(step_type).cloned()
    }

    pub fn contains(&self, step_type: &str) -> bool {
        self.actions.contains_key(step_type)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use tokio::sync::Mutex;

    /// 호출된 Step 이름을 누적 기록하는 목업 액션이다.
    #[derive(Clone)]
    pub(crate) struct RecordingAction {
        pub step_type: String,
        pub calls: Arc<Mutex<Vec<String>>>,
        pub outcome: ActionOutcome,
        pub fatal: bool,
    }

    impl RecordingAction {
        pub fn new(step_type: &str, outcome: ActionOutcome) -> Self {
            Self {
                step_type: step_type.to_string(),
                calls: Arc::new(Mutex::new(Vec::new())),
                outcome,
                fatal: false,
            }
        }

        pub async fn calls(&self) -> Vec<String> {
            self.calls.lock().await.clone()
        }
    }

    #[async_trait]
    impl StepAction for RecordingAction {
        fn step_type(&self) -> &str {
            &self.step_type
        }

        /// 전달받은 Step 이름을 저장하고 미리 정한 결과를 반환한다.
        async fn execute(&self, input: ActionInput) -> anyhow::Result<ActionOutcome> {
            self.calls.lock().await.push(input.step_name);
            Ok(self.outcome.clone())
        }

        fn fatal_on_failure(&self) -> bool {
            self.fatal
        }
    }

    pub(crate) fn input(inputs: IndexMap<String, Value>) -> ActionInput {
        ActionInput {
            step_name: "test".into(),
            inputs,
            target: Target::none(),
            context: IndexMap::new(),
        }
    }
}
