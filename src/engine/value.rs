use indexmap::{IndexMap, IndexSet};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// 평가기가 속성 접근(`#obj.attr()`)으로 탐색할 수 있는 호출자 제공 객체이다.
pub trait ContextObject: fmt::Debug + Send + Sync {
    /// 오류 메시지와 보고서에 표시할 타입 이름.
    fn type_name(&self) -> &str;

    /// 이름에 해당하는 속성 값을 반환한다. 없으면 `None`.
    fn attribute(&self, name: &str) -> Option<Value>;

    /// 문자열 보간과 보고서 렌더링에 사용할 표현이다.
    fn describe(&self) -> String {
        format!("{self:?}")
    }
}

/// 시나리오 컨텍스트와 Step 입력에서 다루는 동적 값이다.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Set(IndexSet<Value>),
    /// 키도 값이므로 평가 결과 객체가 키가 될 수 있다.
    Map(IndexMap<Value, Value>),
    /// 참조 동일성으로만 비교되는 불투명 객체.
    Object(Arc<dyn ContextObject>),
}

impl Value {
    /// 객체를 감싼 값을 만든다.
    pub fn object(obj: impl ContextObject + 'static) -> Self {
        Value::Object(Arc::new(obj))
    }

    /// 문자열 값이면 슬라이스를 반환한다.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// 오류 메시지에 쓰는 값 종류 이름이다.
    pub fn kind(&self) -> &str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Set(_) => "set",
            Value::Map(_) => "map",
            Value::Object(obj) => obj.type_name(),
        }
    }

    /// 문자열 키 맵을 `Value::Map`으로 변환한다.
    pub fn from_named(entries: &IndexMap<String, Value>) -> Self {
        Value::Map(
            entries
                .iter()
                .map(|(k, v)| (Value::String(k.clone()), v.clone()))
                .collect(),
        )
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Set(a), Value::Set(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b)),
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Bool(b) => b.hash(state),
            Value::Int(i) => i.hash(state),
            Value::Float(f) => f.to_bits().hash(state),
            Value::String(s) => s.hash(state),
            Value::List(items) => items.hash(state),
            // IndexSet/IndexMap 동등성은 순서와 무관하므로 해시도 순서와 무관해야 한다.
            Value::Set(items) => unordered_hash(items.iter()).hash(state),
            Value::Map(entries) => unordered_hash(entries.iter()).hash(state),
            Value::Object(obj) => (Arc::as_ptr(obj) as *const () as usize).hash(state),
        }
    }
}

fn unordered_hash<T: Hash>(items: impl Iterator<Item = T>) -> u64 {
    items.fold(0u64, |acc, item| {
        let mut hasher = DefaultHasher::new();
        item.hash(&mut hasher);
        acc.wrapping_add(hasher.finish())
    })
}

impl fmt::Display for Value {
    /// 문자열 보간 시 사용되는 표현이다.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::String(s) => f.write_str(s),
            Value::Object(obj) => f.write_str(&obj.describe()),
            Value::List(_) | Value::Set(_) | Value::Map(_) => {
                let text = serde_json::to_string(self).map_err(|_| fmt::Error)?;
                f.write_str(&text)
            }
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(x) => serializer.serialize_f64(*x),
            Value::String(s) => serializer.serialize_str(s),
            Value::Object(obj) => serializer.serialize_str(&obj.describe()),
            Value::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Set(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Map(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (key, value) in entries {
                    // JSON 키는 문자열이어야 하므로 표시 문자열을 사용한다.
                    map.serialize_entry(&key.to_string(), value)?;
                }
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        serde_json::Value::deserialize(deserializer).map(Value::from)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(entries) => Value::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (Value::String(k), Value::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}
