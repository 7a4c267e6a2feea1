use super::EvaluationError;
use crate::engine::value::Value;
use once_cell::sync::Lazy;
use regex::Regex;

/// 리플렉션, 클래스 로딩, 프로세스 실행으로 이어질 수 있는 식별자이다.
static FORBIDDEN_IDENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(new|getClass|forName|getMethod|getDeclared\w*|getRuntime|getClassLoader|classLoader|class|Class|exec|invoke|start|Runtime|ProcessBuilder|System|Thread)$",
    )
    .expect("정규식 컴파일 실패")
});

/// 템플릿 문자열을 구성하는 조각이다.
#[derive(Debug, PartialEq)]
pub(super) enum Segment<'a> {
    Text(&'a str),
    Expr(&'a str),
}

/// 파싱된 표현식 트리이다.
#[derive(Debug, Clone, PartialEq)]
pub(super) enum Expr {
    Variable(String),
    Literal(Value),
    Member {
        target: Box<Expr>,
        name: String,
        call: bool,
    },
    Index {
        target: Box<Expr>,
        index: Box<Expr>,
    },
    Call {
        name: String,
        args: Vec<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Hash,
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
    Dot,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Unexpected(char),
}

/// 문자열에 `${` 표식이 있는지 확인한다.
pub(super) fn contains_expression(text: &str) -> bool {
    text.contains("${")
}

/// `${...}` 표식을 기준으로 문자열을 나눈다. 중괄호 깊이와 따옴표를 추적한다.
pub(super) fn split_template(text: &str) -> Result<Vec<Segment<'_>>, EvaluationError> {
    let mut segments = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("${") {
        if start > 0 {
            segments.push(Segment::Text(&rest[..start]));
        }
        let body = &rest[start + 2..];
        let end = find_closing_brace(body).ok_or_else(|| EvaluationError::Syntax {
            message: "닫히지 않은 표현식입니다".into(),
            expression: text.to_string(),
        })?;
        segments.push(Segment::Expr(&body[..end]));
        rest = &body[end + 1..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Text(rest));
    }
    Ok(segments)
}

fn find_closing_brace(body: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (i, ch) in body.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == q {
                quote = None;
            }
            continue;
        }
        match ch {
            '\'' | '"' => quote = Some(ch),
            '{' => depth += 1,
            '}' if depth == 0 => return Some(i),
            '}' => depth -= 1,
            _ => {}
        }
    }
    None
}

/// 표현식 원문을 파싱한다. 금지 목록 검사가 문법 검사보다 먼저 수행된다.
pub(super) fn parse(source: &str) -> Result<Expr, EvaluationError> {
    let tokens = tokenize(source)?;
    reject_forbidden(&tokens, source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        source,
    };
    let expr = parser.expression()?;
    if let Some(token) = parser.peek() {
        return Err(parser.syntax(format!("예상하지 못한 토큰: {token:?}")));
    }
    Ok(expr)
}

fn reject_forbidden(tokens: &[Token], source: &str) -> Result<(), EvaluationError> {
    for (i, token) in tokens.iter().enumerate() {
        let Token::Ident(name) = token else {
            continue;
        };
        // `#name`은 컨텍스트 변수 조회일 뿐이다.
        if i > 0 && tokens[i - 1] == Token::Hash {
            continue;
        }
        let type_reference = name == "T" && tokens.get(i + 1) == Some(&Token::LParen);
        if type_reference || FORBIDDEN_IDENT.is_match(name) {
            return Err(EvaluationError::Forbidden {
                construct: if type_reference { "T(...)".into() } else { name.clone() },
                expression: source.to_string(),
            });
        }
    }
    Ok(())
}

fn tokenize(source: &str) -> Result<Vec<Token>, EvaluationError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let ch = chars[i];
        match ch {
            c if c.is_whitespace() => i += 1,
            '#' => {
                tokens.push(Token::Hash);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '\'' | '"' => {
                let mut text = String::new();
                let mut j = i + 1;
                let mut closed = false;
                while j < chars.len() {
                    match chars[j] {
                        '\\' if j + 1 < chars.len() => {
                            text.push(chars[j + 1]);
                            j += 2;
                        }
                        c if c == ch => {
                            closed = true;
                            j += 1;
                            break;
                        }
                        c => {
                            text.push(c);
                            j += 1;
                        }
                    }
                }
                if !closed {
                    return Err(EvaluationError::Syntax {
                        message: "닫히지 않은 문자열 리터럴입니다".into(),
                        expression: source.to_string(),
                    });
                }
                tokens.push(Token::Str(text));
                i = j;
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(char::is_ascii_digit)) => {
                let start = i;
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                let is_float =
                    i + 1 < chars.len() && chars[i] == '.' && chars[i + 1].is_ascii_digit();
                if is_float {
                    i += 1;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
                let literal: String = chars[start..i].iter().collect();
                let token = if is_float {
                    literal.parse().map(Token::Float).ok()
                } else {
                    literal.parse().map(Token::Int).ok()
                };
                tokens.push(token.ok_or_else(|| EvaluationError::Syntax {
                    message: format!("숫자 리터럴을 해석할 수 없습니다: {literal}"),
                    expression: source.to_string(),
                })?);
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => {
                tokens.push(Token::Unexpected(other));
                i += 1;
            }
        }
    }
    Ok(tokens)
}

struct Parser<'s> {
    tokens: Vec<Token>,
    pos: usize,
    source: &'s str,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token) -> Result<(), EvaluationError> {
        if self.eat(&expected) {
            Ok(())
        } else {
            Err(self.syntax(format!("{expected:?}가 필요합니다")))
        }
    }

    fn syntax(&self, message: String) -> EvaluationError {
        EvaluationError::Syntax {
            message,
            expression: self.source.to_string(),
        }
    }

    fn expression(&mut self) -> Result<Expr, EvaluationError> {
        let mut expr = self.primary()?;
        loop {
            if self.eat(&Token::Dot) {
                let name = match self.next() {
                    Some(Token::Ident(name)) => name,
                    _ => return Err(self.syntax("'.' 뒤에 멤버 이름이 필요합니다".into())),
                };
                let call = if self.eat(&Token::LParen) {
                    // 접근자 메서드는 인자를 받지 않는다.
                    self.expect(Token::RParen)?;
                    true
                } else {
                    false
                };
                expr = Expr::Member {
                    target: Box::new(expr),
                    name,
                    call,
                };
            } else if self.eat(&Token::LBracket) {
                let index = self.expression()?;
                self.expect(Token::RBracket)?;
                expr = Expr::Index {
                    target: Box::new(expr),
                    index: Box::new(index),
                };
            } else {
                return Ok(expr);
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, EvaluationError> {
        match self.next() {
            Some(Token::Hash) => match self.next() {
                Some(Token::Ident(name)) => Ok(Expr::Variable(name)),
                _ => Err(self.syntax("'#' 뒤에 변수 이름이 필요합니다".into())),
            },
            Some(Token::Str(text)) => Ok(Expr::Literal(Value::String(text))),
            Some(Token::Int(i)) => Ok(Expr::Literal(Value::Int(i))),
            Some(Token::Float(f)) => Ok(Expr::Literal(Value::Float(f))),
            Some(Token::Ident(name)) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                _ => {
                    if !self.eat(&Token::LParen) {
                        return Err(self.syntax(format!(
                            "알 수 없는 식별자: {name} (변수는 #{name} 형태로 참조합니다)"
                        )));
                    }
                    let mut args = Vec::new();
                    if !self.eat(&Token::RParen) {
                        loop {
                            args.push(self.expression()?);
                            if self.eat(&Token::RParen) {
                                break;
                            }
                            self.expect(Token::Comma)?;
                        }
                    }
                    Ok(Expr::Call { name, args })
                }
            },
            Some(Token::LParen) => {
                let expr = self.expression()?;
                self.expect(Token::RParen)?;
                Ok(expr)
            }
            Some(token) => Err(self.syntax(format!("예상하지 못한 토큰: {token:?}"))),
            None => Err(self.syntax("표현식이 비어 있습니다".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_split_respects_nested_braces_and_quotes() {
        let segments = split_template("a ${#x} b ${f('}')} ${g({1})}").expect("split");
        assert_eq!(
            segments,
            vec![
                Segment::Text("a "),
                Segment::Expr("#x"),
                Segment::Text(" b "),
                Segment::Expr("f('}')"),
                Segment::Text(" "),
                Segment::Expr("g({1})"),
            ]
        );
    }

    #[test]
    fn parses_accessor_chain() {
        let expr = parse("#object.attribute()[0]").expect("parse");
        assert_eq!(
            expr,
            Expr::Index {
                target: Box::new(Expr::Member {
                    target: Box::new(Expr::Variable("object".into())),
                    name: "attribute".into(),
                    call: true,
                }),
                index: Box::new(Expr::Literal(Value::Int(0))),
            }
        );
    }

    #[test]
    fn variables_named_like_denied_words_are_allowed() {
        assert!(parse("#start").is_ok());
        assert!(parse("'new Runtime'").is_ok());
    }

    #[test]
    fn unterminated_marker_is_a_syntax_error() {
        assert!(matches!(
            split_template("${#x"),
            Err(EvaluationError::Syntax { .. })
        ));
    }
}
