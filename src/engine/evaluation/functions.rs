use crate::engine::value::Value;
use chrono::format::{Item, StrftimeItems};
use chrono::{TimeDelta, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// 표현식에서 `name(args)` 형태로 호출되는 도우미 함수 시그니처이다.
pub type HelperFn = Arc<dyn Fn(&[Value]) -> Result<Value, String> + Send + Sync>;

/// 평가기에 주입되는 허용 함수 목록이다.
///
/// 여기에 등록된 이름만 호출할 수 있으므로 표현식 문법만으로는 임의 코드에 닿을 수 없다.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, HelperFn>,
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.functions.keys().collect();
        names.sort();
        f.debug_struct("FunctionRegistry")
            .field("functions", &names)
            .finish()
    }
}

impl FunctionRegistry {
    /// 비어 있는 목록을 생성한다.
    pub fn new() -> Self {
        Self::default()
    }

    /// 기본 서식/유틸리티 함수가 등록된 목록을 생성한다.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("now", |args| {
            expect_arity("now", args, 0, 0)?;
            Ok(Value::String(Utc::now().to_rfc3339()))
        });
        registry.register("date_format", date_format);
        registry.register("json", |args| {
            expect_arity("json", args, 1, 1)?;
            let text = string_arg("json", &args[0])?;
            serde_json::from_str::<serde_json::Value>(text)
                .map(Value::from)
                .map_err(|err| format!("JSON 파싱 실패: {err}"))
        });
        registry.register("to_string", |args| {
            expect_arity("to_string", args, 1, 1)?;
            Ok(Value::String(args[0].to_string()))
        });
        registry.register("upper", |args| {
            expect_arity("upper", args, 1, 1)?;
            Ok(Value::String(string_arg("upper", &args[0])?.to_uppercase()))
        });
        registry.register("lower", |args| {
            expect_arity("lower", args, 1, 1)?;
            Ok(Value::String(string_arg("lower", &args[0])?.to_lowercase()))
        });
        registry
    }

    /// 함수를 등록한다. 같은 이름이 있으면 교체한다.
    pub fn register<F>(&mut self, name: impl Into<String>, function: F)
    where
        F: Fn(&[Value]) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(function));
    }

    pub fn get(&self, name: &str) -> Option<&HelperFn> {
        self.functions.get(name)
    }
}

/// 현재 UTC 시각(선택적으로 초 단위 오프셋 적용)을 strftime 패턴으로 서식화한다.
fn date_format(args: &[Value]) -> Result<Value, String> {
    expect_arity("date_format", args, 1, 2)?;
    let pattern = string_arg("date_format", &args[0])?;
    if StrftimeItems::new(pattern).any(|item| matches!(item, Item::Error)) {
        return Err(format!("잘못된 날짜 패턴입니다: {pattern}"));
    }
    let offset = match args.get(1) {
        Some(value) => value
            .as_i64()
            .ok_or_else(|| format!("오프셋은 정수여야 합니다: {}", value.kind()))?,
        None => 0,
    };
    let delta = TimeDelta::try_seconds(offset).ok_or("오프셋 범위를 벗어났습니다")?;
    let instant = Utc::now()
        .checked_add_signed(delta)
        .ok_or("오프셋 범위를 벗어났습니다")?;
    Ok(Value::String(
        instant.format_with_items(StrftimeItems::new(pattern)).to_string(),
    ))
}

fn expect_arity(name: &str, args: &[Value], min: usize, max: usize) -> Result<(), String> {
    if args.len() < min || args.len() > max {
        return Err(format!(
            "{name}() 인자 개수가 올바르지 않습니다: {} (허용 {min}..={max})",
            args.len()
        ));
    }
    Ok(())
}

fn string_arg<'a>(name: &str, value: &'a Value) -> Result<&'a str, String> {
    value
        .as_str()
        .ok_or_else(|| format!("{name}() 인자는 문자열이어야 합니다: {}", value.kind()))
}
