use crate::engine::Value;
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// 시나리오/환경 문서를 읽는 중 발생하는 오류이다.
#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    /// 파일을 읽을 수 없는 경우이다.
    #[error("파일을 읽을 수 없습니다: {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// 문서 형식이 잘못된 경우이다.
    #[error("{origin} 문서를 해석할 수 없습니다: {message}")]
    Parse { origin: String, message: String },
    /// 구조는 맞지만 내용이 유효하지 않은 경우이다.
    #[error("{origin} 문서가 유효하지 않습니다: {message}")]
    Invalid { origin: String, message: String },
}

/// 원격 에이전트를 식별한다.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NamedHostAndPort {
    /// 논리 이름.
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl NamedHostAndPort {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for NamedHostAndPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.name, self.host, self.port)
    }
}

/// Step이 대상으로 하는 시스템 정의이다. `agent`가 있으면 해당 에이전트에 위임된다.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Target {
    /// 대상 이름. 빈 이름은 "대상 없음"을 뜻한다.
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub properties: IndexMap<String, String>,
    /// Step 실행을 위임할 원격 에이전트.
    #[serde(default)]
    pub agent: Option<NamedHostAndPort>,
}

impl Target {
    /// 아무 것도 가리키지 않는 대상을 반환한다.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_none(&self) -> bool {
        self.name.is_empty()
    }
}

/// Step 재시도/시간 제한 설정이다.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepStrategy {
    /// 실패 시 재시도 횟수.
    #[serde(default)]
    pub retry: u32,
    /// 시도당 제한 시간(ms). 없으면 엔진 기본값을 사용한다.
    #[serde(default, alias = "timeout_ms")]
    pub timeout_ms: Option<u64>,
    /// 첫 재시도 대기 시간(ms). 이후 두 배씩 늘어난다.
    #[serde(default, alias = "retry_delay_ms")]
    pub retry_delay_ms: Option<u64>,
}

/// 사용자가 작성한 Step 트리의 노드이다. 엔진은 읽기만 한다.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// 사용자 친화적인 Step 이름.
    pub name: String,
    /// 실행할 액션 종류. 하위 Step만 묶는 노드는 비워 둔다.
    #[serde(default, rename = "type")]
    pub step_type: Option<String>,
    /// 평가 전 원본 입력.
    #[serde(default)]
    pub inputs: IndexMap<String, Value>,
    /// 하위 Step 목록.
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
    /// 환경에 정의된 대상 이름.
    #[serde(default)]
    pub target: Option<String>,
    /// 액션 결과를 변수로 보고 평가한 뒤 컨텍스트에 넣을 값.
    #[serde(default)]
    pub outputs: IndexMap<String, Value>,
    /// 참이어야 하는 검증식.
    #[serde(default)]
    pub validations: IndexMap<String, Value>,
    #[serde(default)]
    pub strategy: StepStrategy,
}

impl StepDefinition {
    /// 이름만 가진 빈 Step을 생성한다.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_type(mut self, step_type: impl Into<String>) -> Self {
        self.step_type = Some(step_type.into());
        self
    }

    pub fn with_input(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.inputs.insert(key.into(), value.into());
        self
    }

    pub fn with_output(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.outputs.insert(key.into(), value.into());
        self
    }

    pub fn with_validation(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.validations.insert(key.into(), value.into());
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_steps(mut self, steps: Vec<StepDefinition>) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_strategy(mut self, strategy: StepStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// 하위 Step을 뺀 복사본을 만든다.
    pub(crate) fn shallow(&self) -> Self {
        Self {
            steps: Vec::new(),
            ..self.clone()
        }
    }
}

/// 시나리오 파일 내용이다.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScenarioContent {
    /// 시나리오의 표시 이름.
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// 최상위 Step 목록.
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
}

impl ScenarioContent {
    /// 제목을 이름으로 하는 루트 Step으로 변환한다.
    pub fn to_step_definition(&self) -> StepDefinition {
        StepDefinition::new(self.title.clone()).with_steps(self.steps.clone())
    }
}

/// 실행 환경 파일 내용이다.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Environment {
    pub name: String,
    /// 초기 컨텍스트 변수.
    #[serde(default)]
    pub variables: IndexMap<String, Value>,
    #[serde(default)]
    pub targets: Vec<Target>,
}

/// 엔진에 제출되는 실행 요청이다.
#[derive(Debug, Clone, Default)]
pub struct ExecutionRequest {
    /// 루트 Step.
    pub scenario: StepDefinition,
    /// 환경 변수.
    pub variables: IndexMap<String, Value>,
    /// 환경 변수보다 우선하는 실행별 데이터셋.
    pub dataset: IndexMap<String, Value>,
    /// 이름으로 참조 가능한 대상 목록.
    pub targets: Vec<Target>,
}

impl ExecutionRequest {
    pub fn new(scenario: StepDefinition) -> Self {
        Self {
            scenario,
            ..Self::default()
        }
    }

    /// 시나리오 파일과 환경으로 요청을 구성한다.
    pub fn from_content(content: &ScenarioContent, environment: &Environment) -> Self {
        Self {
            scenario: content.to_step_definition(),
            variables: environment.variables.clone(),
            dataset: IndexMap::new(),
            targets: environment.targets.clone(),
        }
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    pub fn with_dataset(mut self, dataset: IndexMap<String, Value>) -> Self {
        self.dataset = dataset;
        self
    }

    pub fn with_target(mut self, target: Target) -> Self {
        self.targets.push(target);
        self
    }
}

/// 파일을 읽어 ScenarioContent로 역직렬화한다.
pub fn load_scenario_from_file(path: &Path) -> Result<ScenarioContent, ScenarioError> {
    let text = read_file(path)?;
    parse_scenario(&text, &path.display().to_string())
}

/// Reader에서 완화된 JSON을 읽어 ScenarioContent로 파싱한다.
pub fn load_scenario_from_reader<R: Read>(reader: &mut R) -> Result<ScenarioContent, ScenarioError> {
    let text = read_all(reader, "scenario")?;
    parse_scenario(&text, "scenario")
}

/// 파일을 읽어 Environment로 역직렬화한다.
pub fn load_environment_from_file(path: &Path) -> Result<Environment, ScenarioError> {
    let text = read_file(path)?;
    parse_document(&text, &path.display().to_string())
}

pub fn load_environment_from_reader<R: Read>(reader: &mut R) -> Result<Environment, ScenarioError> {
    let text = read_all(reader, "environment")?;
    parse_document(&text, "environment")
}

fn parse_scenario(text: &str, origin: &str) -> Result<ScenarioContent, ScenarioError> {
    let content: ScenarioContent = parse_document(text, origin)?;
    if content.title.trim().is_empty() {
        return Err(ScenarioError::Invalid {
            origin: origin.to_string(),
            message: "title이 비어 있습니다".into(),
        });
    }
    validate_names(&content.steps, origin)?;
    Ok(content)
}

fn validate_names(steps: &[StepDefinition], origin: &str) -> Result<(), ScenarioError> {
    for step in steps {
        if step.name.trim().is_empty() {
            return Err(ScenarioError::Invalid {
                origin: origin.to_string(),
                message: "이름이 없는 Step이 있습니다".into(),
            });
        }
        validate_names(&step.steps, origin)?;
    }
    Ok(())
}

/// Hjson 문서로 읽는다. 쉼표와 따옴표를 생략할 수 있고 `//`, `#`, `/* */` 주석을 허용한다.
fn parse_document<T: DeserializeOwned>(text: &str, origin: &str) -> Result<T, ScenarioError> {
    deser_hjson::from_str(text).map_err(|err| ScenarioError::Parse {
        origin: origin.to_string(),
        message: err.to_string(),
    })
}

fn read_file(path: &Path) -> Result<String, ScenarioError> {
    let mut file = File::open(path).map_err(|source| ScenarioError::Io {
        path: path.display().to_string(),
        source,
    })?;
    read_all(&mut file, &path.display().to_string())
}

fn read_all<R: Read>(reader: &mut R, origin: &str) -> Result<String, ScenarioError> {
    let mut buf = String::new();
    reader
        .read_to_string(&mut buf)
        .map_err(|source| ScenarioError::Io {
            path: origin.to_string(),
            source,
        })?;
    Ok(buf)
}
