//! Step 입력에 포함된 `${...}` 표현식을 시나리오 컨텍스트에 대해 해석한다.
//!
//! 문법은 변수 조회(`#name`), 리터럴, 멤버/인덱스 접근, 등록된 도우미 함수 호출만
//! 허용한다. 타입 참조, 객체 생성, 리플렉션 멤버는 평가 전에 거부된다.

mod functions;
mod parser;

pub use functions::{FunctionRegistry, HelperFn};

use super::context::ScenarioContext;
use super::value::Value;
use indexmap::map::Entry;
use indexmap::{IndexMap, IndexSet};
use parser::{Expr, Segment, contains_expression, parse, split_template};

/// 표현식 평가 중 발생 가능한 오류를 표현한다.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvaluationError {
    /// 금지된 구문이 사용된 경우이다.
    #[error("허용되지 않는 표현식 구문입니다: {construct} (식: {expression})")]
    Forbidden {
        construct: String,
        expression: String,
    },
    #[error("표현식 구문 오류: {message} (식: {expression})")]
    Syntax { message: String, expression: String },
    #[error("정의되지 않은 변수입니다: #{0}")]
    UnknownVariable(String),
    #[error("등록되지 않은 함수입니다: {0}()")]
    UnknownFunction(String),
    #[error("{kind} 값에서 '{member}'에 접근할 수 없습니다")]
    NotNavigable { kind: String, member: String },
    #[error("인덱스 {index}가 범위를 벗어났습니다 (길이 {len})")]
    IndexOutOfBounds { index: i64, len: usize },
    #[error("{name}() 호출 실패: {message}")]
    Function { name: String, message: String },
    /// 서로 다른 맵 키가 같은 값으로 평가된 경우이다.
    #[error("맵 키가 중복됩니다: {0}")]
    DuplicateKey(String),
    /// 특정 입력의 평가가 실패한 경우이다.
    #[error("입력 '{input}' 평가 실패: {source}")]
    Input {
        input: String,
        #[source]
        source: Box<EvaluationError>,
    },
}

/// 평가 중인 맵의 원본 항목으로, 같은 맵의 다른 항목을 참조할 때 쓰인다.
#[derive(Clone, Copy)]
enum Local<'a> {
    Named(&'a IndexMap<String, Value>),
    Map(&'a IndexMap<Value, Value>),
}

impl<'a> Local<'a> {
    fn get(&self, name: &str) -> Option<&'a Value> {
        match self {
            Local::Named(entries) => entries.get(name),
            Local::Map(entries) => entries.get(&Value::String(name.to_string())),
        }
    }
}

struct Frame<'a> {
    ctx: &'a ScenarioContext,
    extra: Option<&'a IndexMap<String, Value>>,
    locals: Vec<Local<'a>>,
}

/// 컨텍스트를 읽기만 하는 표현식 평가기이다.
#[derive(Debug, Clone)]
pub struct Evaluator {
    functions: FunctionRegistry,
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new(FunctionRegistry::with_defaults())
    }
}

impl Evaluator {
    /// 도우미 함수 목록을 주입받아 평가기를 생성한다.
    pub fn new(functions: FunctionRegistry) -> Self {
        Self { functions }
    }

    /// 이름 붙은 입력 전체를 평가한다.
    ///
    /// # 매개변수
    /// - `inputs`: Step에 선언된 원본 입력.
    /// - `ctx`: 현재 실행의 시나리오 컨텍스트.
    ///
    /// # 반환값
    /// 같은 키에 평가된 값을 담은 맵. 하나라도 실패하면 해당 입력 이름을 포함한 오류.
    pub fn evaluate_named(
        &self,
        inputs: &IndexMap<String, Value>,
        ctx: &ScenarioContext,
    ) -> Result<IndexMap<String, Value>, EvaluationError> {
        self.evaluate_named_with_scope(inputs, ctx, None)
    }

    /// `extra` 값을 컨텍스트보다 우선하는 변수로 노출하면서 입력을 평가한다.
    ///
    /// Step 출력과 검증식을 액션 결과에 대해 평가할 때 사용한다.
    pub fn evaluate_named_with_scope(
        &self,
        inputs: &IndexMap<String, Value>,
        ctx: &ScenarioContext,
        extra: Option<&IndexMap<String, Value>>,
    ) -> Result<IndexMap<String, Value>, EvaluationError> {
        let mut frame = Frame {
            ctx,
            extra,
            locals: vec![Local::Named(inputs)],
        };
        let mut evaluated = IndexMap::with_capacity(inputs.len());
        for (name, raw) in inputs {
            let value = self
                .resolve(raw, &mut frame)
                .map_err(|source| EvaluationError::Input {
                    input: name.clone(),
                    source: Box::new(source),
                })?;
            evaluated.insert(name.clone(), value);
        }
        Ok(evaluated)
    }

    /// 단일 값을 재귀적으로 평가한다.
    pub fn evaluate(&self, value: &Value, ctx: &ScenarioContext) -> Result<Value, EvaluationError> {
        let mut frame = Frame {
            ctx,
            extra: None,
            locals: Vec::new(),
        };
        self.resolve(value, &mut frame)
    }

    fn resolve<'a>(&self, value: &'a Value, frame: &mut Frame<'a>) -> Result<Value, EvaluationError> {
        match value {
            Value::String(text) => self.eval_string(text, frame, 0),
            Value::List(items) => items
                .iter()
                .map(|item| self.resolve(item, frame))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List),
            Value::Set(items) => items
                .iter()
                .map(|item| self.resolve(item, frame))
                .collect::<Result<IndexSet<_>, _>>()
                .map(Value::Set),
            Value::Map(entries) => {
                frame.locals.push(Local::Map(entries));
                let resolved = self.resolve_entries(entries, frame);
                frame.locals.pop();
                resolved.map(Value::Map)
            }
            other => Ok(other.clone()),
        }
    }

    fn resolve_entries<'a>(
        &self,
        entries: &'a IndexMap<Value, Value>,
        frame: &mut Frame<'a>,
    ) -> Result<IndexMap<Value, Value>, EvaluationError> {
        let mut resolved = IndexMap::with_capacity(entries.len());
        for (key, value) in entries {
            let key = self.resolve(key, frame)?;
            let value = self.resolve(value, frame)?;
            match resolved.entry(key) {
                Entry::Occupied(entry) => {
                    return Err(EvaluationError::DuplicateKey(entry.key().to_string()));
                }
                Entry::Vacant(entry) => {
                    entry.insert(value);
                }
            }
        }
        Ok(resolved)
    }

    /// 문자열 하나를 평가한다. 표현식 하나로만 된 문자열은 원래 값을 그대로 돌려준다.
    fn eval_string(&self, text: &str, frame: &Frame<'_>, depth: u8) -> Result<Value, EvaluationError> {
        if !contains_expression(text) {
            return Ok(Value::String(text.to_string()));
        }
        let segments = split_template(text)?;
        if let [Segment::Expr(source)] = segments.as_slice() {
            return self.eval_expr(&parse(source)?, frame, depth);
        }
        let mut rendered = String::new();
        for segment in segments {
            match segment {
                Segment::Text(part) => rendered.push_str(part),
                Segment::Expr(source) => {
                    let value = self.eval_expr(&parse(source)?, frame, depth)?;
                    rendered.push_str(&value.to_string());
                }
            }
        }
        Ok(Value::String(rendered))
    }

    fn eval_expr(&self, expr: &Expr, frame: &Frame<'_>, depth: u8) -> Result<Value, EvaluationError> {
        match expr {
            Expr::Variable(name) => self.lookup(name, frame, depth),
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Member { target, name, call } => {
                let base = self.eval_expr(target, frame, depth)?;
                navigate(&base, name, *call)
            }
            Expr::Index { target, index } => {
                let base = self.eval_expr(target, frame, depth)?;
                let index = self.eval_expr(index, frame, depth)?;
                index_into(&base, &index)
            }
            Expr::Call { name, args } => {
                let function = self
                    .functions
                    .get(name)
                    .ok_or_else(|| EvaluationError::UnknownFunction(name.clone()))?;
                let args = args
                    .iter()
                    .map(|arg| self.eval_expr(arg, frame, depth))
                    .collect::<Result<Vec<_>, _>>()?;
                function(&args).map_err(|message| EvaluationError::Function {
                    name: name.clone(),
                    message,
                })
            }
        }
    }

    /// 변수를 찾는다. 찾은 값이 다시 표현식이면 한 단계까지만 더 평가한다.
    fn lookup(&self, name: &str, frame: &Frame<'_>, depth: u8) -> Result<Value, EvaluationError> {
        let found = frame
            .extra
            .and_then(|extra| extra.get(name))
            .or_else(|| frame.ctx.get(name))
            .or_else(|| frame.locals.iter().rev().find_map(|local| local.get(name)))
            .ok_or_else(|| EvaluationError::UnknownVariable(name.to_string()))?;
        match found {
            Value::String(text) if depth == 0 && contains_expression(text) => {
                self.eval_string(text, frame, depth + 1)
            }
            other => Ok(other.clone()),
        }
    }
}

fn navigate(base: &Value, member: &str, call: bool) -> Result<Value, EvaluationError> {
    let not_navigable = || EvaluationError::NotNavigable {
        kind: base.kind().to_string(),
        member: member.to_string(),
    };
    match (base, member, call) {
        (Value::Object(obj), _, _) => obj.attribute(member).ok_or_else(not_navigable),
        (Value::Map(entries), "size", true) => Ok(Value::Int(entries.len() as i64)),
        (Value::Map(entries), _, false) => entries
            .get(&Value::String(member.to_string()))
            .cloned()
            .ok_or_else(not_navigable),
        (Value::List(items), "size", true) => Ok(Value::Int(items.len() as i64)),
        (Value::Set(items), "size", true) => Ok(Value::Int(items.len() as i64)),
        (Value::String(text), "length", true) => Ok(Value::Int(text.chars().count() as i64)),
        (Value::String(text), "trim", true) => Ok(Value::String(text.trim().to_string())),
        _ => Err(not_navigable()),
    }
}

fn index_into(base: &Value, index: &Value) -> Result<Value, EvaluationError> {
    match (base, index) {
        (Value::List(items), Value::Int(i)) => usize::try_from(*i)
            .ok()
            .and_then(|pos| items.get(pos))
            .cloned()
            .ok_or(EvaluationError::IndexOutOfBounds {
                index: *i,
                len: items.len(),
            }),
        (Value::Map(entries), key) => entries.get(key).cloned().ok_or_else(|| {
            EvaluationError::NotNavigable {
                kind: base.kind().to_string(),
                member: key.to_string(),
            }
        }),
        _ => Err(EvaluationError::NotNavigable {
            kind: base.kind().to_string(),
            member: format!("[{index}]"),
        }),
    }
}
