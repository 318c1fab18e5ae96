//! Minimal formula evaluation used by the policy functions.
//!
//! The full virtual-device formula language lives in its own library and
//! is plugged in through [`FormulaEvaluator`](super::FormulaEvaluator);
//! this built-in evaluator covers the arithmetic and comparison subset
//! that device policies use in practice: numbers, attribute references,
//! `+ - * /`, comparisons, equality, `&&`/`||`, unary `-`/`!` and
//! parentheses.

use serde_json::{Map, Value};

use super::FormulaEvaluator;

/// Default evaluator; stateless.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimpleFormulaEvaluator;

impl FormulaEvaluator for SimpleFormulaEvaluator {
    fn evaluate(&self, formula: &str, attributes: &Map<String, Value>) -> Option<Value> {
        let tokens = tokenize(formula)?;
        let mut parser = Parser {
            tokens: &tokens,
            pos: 0,
            attributes,
        };
        let result = parser.or_expr()?;
        if parser.pos != parser.tokens.len() {
            return None;
        }
        Some(match result {
            Operand::Number(n) => serde_json::Number::from_f64(n).map(Value::Number)?,
            Operand::Bool(b) => Value::Bool(b),
            Operand::Text(s) => Value::String(s),
        })
    }
}

/// Attribute names mentioned by a formula. Used to build the trigger
/// table for computed metrics.
pub fn referenced_attributes(formula: &str) -> Vec<String> {
    let mut names = Vec::new();
    if let Some(tokens) = tokenize(formula) {
        for token in tokens {
            if let Token::Ident(name) = token {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
    }
    names
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Text(String),
    Op(&'static str),
    LeftParen,
    RightParen,
}

fn tokenize(formula: &str) -> Option<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = formula.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' => i += 1,
            '(' => {
                tokens.push(Token::LeftParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RightParen);
                i += 1;
            }
            '+' | '*' | '/' | '%' => {
                tokens.push(Token::Op(match c {
                    '+' => "+",
                    '*' => "*",
                    '/' => "/",
                    _ => "%",
                }));
                i += 1;
            }
            '-' => {
                tokens.push(Token::Op("-"));
                i += 1;
            }
            '>' | '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op(if c == '>' { ">=" } else { "<=" }));
                    i += 2;
                } else {
                    tokens.push(Token::Op(if c == '>' { ">" } else { "<" }));
                    i += 1;
                }
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op("=="));
                    i += 2;
                } else {
                    return None;
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op("!="));
                    i += 2;
                } else {
                    tokens.push(Token::Op("!"));
                    i += 1;
                }
            }
            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    tokens.push(Token::Op("&&"));
                    i += 2;
                } else {
                    return None;
                }
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    tokens.push(Token::Op("||"));
                    i += 2;
                } else {
                    return None;
                }
            }
            '"' | '\'' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                while i < chars.len() && chars[i] != quote {
                    text.push(chars[i]);
                    i += 1;
                }
                if i == chars.len() {
                    return None;
                }
                i += 1;
                tokens.push(Token::Text(text));
            }
            c if c.is_ascii_digit() => {
                let mut text = String::new();
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    text.push(chars[i]);
                    i += 1;
                }
                tokens.push(Token::Number(text.parse().ok()?));
            }
            // `$(name)` is accepted as a spelled-out attribute reference.
            '$' if chars.get(i + 1) == Some(&'(') => {
                let mut name = String::new();
                i += 2;
                while i < chars.len() && chars[i] != ')' {
                    name.push(chars[i]);
                    i += 1;
                }
                if i == chars.len() {
                    return None;
                }
                i += 1;
                tokens.push(Token::Ident(name));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut name = String::new();
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == ':')
                {
                    name.push(chars[i]);
                    i += 1;
                }
                match name.as_str() {
                    "true" => tokens.push(Token::Number(1.0)),
                    "false" => tokens.push(Token::Number(0.0)),
                    _ => tokens.push(Token::Ident(name)),
                }
            }
            _ => return None,
        }
    }

    Some(tokens)
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Number(f64),
    Bool(bool),
    Text(String),
}

impl Operand {
    fn truthy(&self) -> bool {
        match self {
            Operand::Number(n) => *n != 0.0,
            Operand::Bool(b) => *b,
            Operand::Text(s) => !s.is_empty(),
        }
    }

    fn number(&self) -> Option<f64> {
        match self {
            Operand::Number(n) => Some(*n),
            Operand::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Operand::Text(_) => None,
        }
    }
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    attributes: &'a Map<String, Value>,
}

impl Parser<'_> {
    fn peek_op(&self) -> Option<&'static str> {
        match self.tokens.get(self.pos) {
            Some(Token::Op(op)) => Some(op),
            _ => None,
        }
    }

    fn or_expr(&mut self) -> Option<Operand> {
        let mut left = self.and_expr()?;
        while self.peek_op() == Some("||") {
            self.pos += 1;
            let right = self.and_expr()?;
            left = Operand::Bool(left.truthy() || right.truthy());
        }
        Some(left)
    }

    fn and_expr(&mut self) -> Option<Operand> {
        let mut left = self.comparison()?;
        while self.peek_op() == Some("&&") {
            self.pos += 1;
            let right = self.comparison()?;
            left = Operand::Bool(left.truthy() && right.truthy());
        }
        Some(left)
    }

    fn comparison(&mut self) -> Option<Operand> {
        let left = self.additive()?;
        let op = match self.peek_op() {
            Some(op @ (">" | "<" | ">=" | "<=" | "==" | "!=")) => op,
            _ => return Some(left),
        };
        self.pos += 1;
        let right = self.additive()?;

        if let (Operand::Text(a), Operand::Text(b)) = (&left, &right) {
            return Some(Operand::Bool(match op {
                "==" => a == b,
                "!=" => a != b,
                _ => return None,
            }));
        }

        let (a, b) = (left.number()?, right.number()?);
        Some(Operand::Bool(match op {
            ">" => a > b,
            "<" => a < b,
            ">=" => a >= b,
            "<=" => a <= b,
            "==" => a == b,
            "!=" => a != b,
            _ => unreachable!(),
        }))
    }

    fn additive(&mut self) -> Option<Operand> {
        let mut left = self.multiplicative()?;
        while let Some(op @ ("+" | "-")) = self.peek_op() {
            self.pos += 1;
            let right = self.multiplicative()?;
            let (a, b) = (left.number()?, right.number()?);
            left = Operand::Number(if op == "+" { a + b } else { a - b });
        }
        Some(left)
    }

    fn multiplicative(&mut self) -> Option<Operand> {
        let mut left = self.unary()?;
        while let Some(op @ ("*" | "/" | "%")) = self.peek_op() {
            self.pos += 1;
            let right = self.unary()?;
            let (a, b) = (left.number()?, right.number()?);
            left = Operand::Number(match op {
                "*" => a * b,
                "/" => a / b,
                _ => a % b,
            });
        }
        Some(left)
    }

    fn unary(&mut self) -> Option<Operand> {
        match self.peek_op() {
            Some("-") => {
                self.pos += 1;
                Some(Operand::Number(-self.unary()?.number()?))
            }
            Some("!") => {
                self.pos += 1;
                let operand = self.unary()?;
                Some(Operand::Bool(!operand.truthy()))
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Option<Operand> {
        let token = self.tokens.get(self.pos)?.clone();
        self.pos += 1;
        match token {
            Token::Number(n) => Some(Operand::Number(n)),
            Token::Text(s) => Some(Operand::Text(s)),
            Token::Ident(name) => match self.attributes.get(&name)? {
                Value::Number(n) => Some(Operand::Number(n.as_f64()?)),
                Value::Bool(b) => Some(Operand::Bool(*b)),
                Value::String(s) => Some(Operand::Text(s.clone())),
                _ => None,
            },
            Token::LeftParen => {
                let inner = self.or_expr()?;
                match self.tokens.get(self.pos) {
                    Some(Token::RightParen) => {
                        self.pos += 1;
                        Some(inner)
                    }
                    _ => None,
                }
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn attrs() -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("t".into(), json!(3));
        map.insert("humidity".into(), json!(55.5));
        map.insert("on".into(), json!(true));
        map.insert("unit".into(), json!("C"));
        map
    }

    fn eval(formula: &str) -> Option<Value> {
        SimpleFormulaEvaluator.evaluate(formula, &attrs())
    }

    #[test]
    fn arithmetic() {
        assert_eq!(eval("2*t").unwrap(), json!(6.0));
        assert_eq!(eval("t + 1").unwrap(), json!(4.0));
        assert_eq!(eval("(t + 1) * 2").unwrap(), json!(8.0));
        assert_eq!(eval("-t").unwrap(), json!(-3.0));
        assert_eq!(eval("7 % 4").unwrap(), json!(3.0));
    }

    #[test]
    fn comparisons_and_logic() {
        assert_eq!(eval("t > 0").unwrap(), json!(true));
        assert_eq!(eval("t > 0 && humidity < 60").unwrap(), json!(true));
        assert_eq!(eval("t < 0 || on").unwrap(), json!(true));
        assert_eq!(eval("!on").unwrap(), json!(false));
        assert_eq!(eval("unit == 'C'").unwrap(), json!(true));
        assert_eq!(eval("unit != \"F\"").unwrap(), json!(true));
    }

    #[test]
    fn attribute_reference_forms() {
        assert_eq!(eval("$(t) >= 3").unwrap(), json!(true));
    }

    #[test]
    fn missing_attribute_or_garbage_is_none() {
        assert!(eval("pressure > 0").is_none());
        assert!(eval("t >").is_none());
        assert!(eval("t # 2").is_none());
    }

    #[test]
    fn referenced_attributes_are_collected() {
        let names = referenced_attributes("2 * t + humidity / $(scale)");
        assert_eq!(names, vec!["t", "humidity", "scale"]);
    }
}
