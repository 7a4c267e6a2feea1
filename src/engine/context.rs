use super::value::Value;
use indexmap::IndexMap;

/// 하나의 실행 동안 Step 간 값을 공유하기 위한 컨텍스트이다.
///
/// 실행 루프를 구동하는 태스크만 소유하고 변경하므로 내부 잠금이 없다.
#[derive(Debug, Default, Clone)]
pub struct ScenarioContext {
    /// 변수 저장소이다.
    vars: IndexMap<String, Value>,
}

impl ScenarioContext {
    /// 비어 있는 컨텍스트를 생성한다.
    pub fn new() -> Self {
        Self {
            vars: IndexMap::new(),
        }
    }

    /// 환경 변수와 데이터셋으로 초기 컨텍스트를 생성한다.
    ///
    /// # 매개변수
    /// - `variables`: 환경에서 온 기본 값.
    /// - `dataset`: 같은 키일 경우 환경 값을 덮어쓰는 실행별 값.
    pub fn from_variables(
        variables: &IndexMap<String, Value>,
        dataset: &IndexMap<String, Value>,
    ) -> Self {
        let mut ctx = Self::new();
        ctx.put_all(variables.clone());
        ctx.put_all(dataset.clone());
        ctx
    }

    /// 변수 값을 설정한다.
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.vars.insert(key.into(), value.into());
    }

    /// 여러 값을 한 번에 설정한다.
    pub fn put_all(&mut self, entries: impl IntoIterator<Item = (String, Value)>) {
        self.vars.extend(entries);
    }

    /// 변수 값을 조회한다.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.vars.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.vars.iter()
    }

    /// 원격 위임 요청에 실을 수 있도록 현재 값을 복사한다.
    pub fn snapshot(&self) -> IndexMap<String, Value> {
        self.vars.clone()
    }
}
