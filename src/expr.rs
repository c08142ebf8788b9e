//! A small expression language for parameter formulas.
//!
//! Any text parameter that starts with `=` is a formula, e.g. `=x + 1` or `=random(1, 6) * 2`.
//! Formulas can reference the run's local variables by name, use the usual arithmetic, comparison
//! and logic operators, build lists with `[a, b]`, and call a handful of built-in functions.

use std::fmt;
use std::iter::Peekable;
use std::str::CharIndices;

use compact_str::{CompactString, format_compact};
use thiserror::Error;

use crate::runtime::{ErrorCause, Number, Value};
use crate::util::modulus;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    #[error("unexpected character `{ch}` at {at}")]
    UnexpectedChar { ch: char, at: usize },
    #[error("unterminated string starting at {at}")]
    UnterminatedString { at: usize },
    #[error("bad number `{text}`")]
    BadNumber { text: CompactString },
    #[error("unexpected `{found}`")]
    UnexpectedToken { found: CompactString },
    #[error("unexpected end of formula")]
    UnexpectedEnd,
    #[error("unknown function `{name}`")]
    UnknownFunction { name: CompactString },
    #[error("{func} takes {expected} arguments, got {got}")]
    Arity { func: Func, expected: &'static str, got: usize },
    #[error("formula is longer than {limit} tokens")]
    TooLong { limit: usize },
    #[error("formula nests deeper than {limit} levels")]
    TooDeep { limit: usize },
}

/// Maximum number of tokens in a formula.
pub const MAX_TOKENS: usize = 1024;
/// Maximum nesting of parentheses, lists, calls and prefix operators in a formula.
pub const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(Number),
    Text(CompactString),
    Bool(bool),
    Ident(CompactString),
    Op(BinaryOp),
    Not,
    LParen, RParen, LSquare, RSquare, Comma,
}
impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Number(x) => write!(f, "{x}"),
            Token::Text(x) => write!(f, "{x:?}"),
            Token::Bool(x) => write!(f, "{x}"),
            Token::Ident(x) => f.write_str(x),
            Token::Op(x) => write!(f, "{x}"),
            Token::Not => f.write_str("!"),
            Token::LParen => f.write_str("("),
            Token::RParen => f.write_str(")"),
            Token::LSquare => f.write_str("["),
            Token::RSquare => f.write_str("]"),
            Token::Comma => f.write_str(","),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add, Sub, Mul, Div, Mod, Pow,
    Eq, Ne, Lt, Le, Gt, Ge,
    And, Or,
}
impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BinaryOp::Add => "+", BinaryOp::Sub => "-", BinaryOp::Mul => "*",
            BinaryOp::Div => "/", BinaryOp::Mod => "%", BinaryOp::Pow => "^",
            BinaryOp::Eq => "==", BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<", BinaryOp::Le => "<=", BinaryOp::Gt => ">", BinaryOp::Ge => ">=",
            BinaryOp::And => "and", BinaryOp::Or => "or",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg, Not,
}

/// Built-in formula functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Func {
    /// `random(a, b)`: an integer in `a..=b` if both bounds are integers, otherwise a float in `[a, b)`.
    Random,
    /// `len(x)`: length of a list, map or text.
    Len,
    Min, Max,
    Abs, Floor, Ceil, Round, Sqrt,
}
impl Func {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "random" => Func::Random,
            "len" => Func::Len,
            "min" => Func::Min,
            "max" => Func::Max,
            "abs" => Func::Abs,
            "floor" => Func::Floor,
            "ceil" => Func::Ceil,
            "round" => Func::Round,
            "sqrt" => Func::Sqrt,
            _ => return None,
        })
    }
    fn check_arity(self, got: usize) -> Result<(), ExprError> {
        let (ok, expected) = match self {
            Func::Random => (got == 2, "2"),
            Func::Min | Func::Max => (got >= 1, "1 or more"),
            _ => (got == 1, "1"),
        };
        if ok { Ok(()) } else { Err(ExprError::Arity { func: self, expected, got }) }
    }
}
impl fmt::Display for Func {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Func::Random => "random", Func::Len => "len", Func::Min => "min", Func::Max => "max",
            Func::Abs => "abs", Func::Floor => "floor", Func::Ceil => "ceil", Func::Round => "round", Func::Sqrt => "sqrt",
        })
    }
}

/// A parsed formula.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Const(Value),
    Var(CompactString),
    List(Vec<Expr>),
    Unary { op: UnaryOp, value: Box<Expr> },
    Binary { op: BinaryOp, left: Box<Expr>, right: Box<Expr> },
    Call { func: Func, args: Vec<Expr> },
}

/// What a formula can see while it is evaluated.
pub trait Env {
    fn lookup(&self, var: &str) -> Option<Value>;
    /// A uniformly distributed float in `[0, 1)`.
    fn random(&mut self) -> f64;
}

fn tokenize(src: &str) -> Result<Vec<Token>, ExprError> {
    let mut tokens = vec![];
    let mut chars: Peekable<CharIndices> = src.char_indices().peekable();
    while let Some((at, ch)) = chars.next() {
        let token = match ch {
            c if c.is_whitespace() => continue,
            '0'..='9' | '.' => {
                let mut end = at + ch.len_utf8();
                while let Some((i, c)) = chars.peek().copied() {
                    if !(c.is_ascii_digit() || c == '.') { break }
                    end = i + c.len_utf8();
                    chars.next();
                }
                let text = &src[at..end];
                Token::Number(Number::parse(text).ok_or_else(|| ExprError::BadNumber { text: text.into() })?)
            }
            '"' | '\'' => {
                let mut text = CompactString::default();
                loop {
                    match chars.next() {
                        Some((_, c)) if c == ch => break,
                        Some((_, c)) => text.push(c),
                        None => return Err(ExprError::UnterminatedString { at }),
                    }
                }
                Token::Text(text)
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut end = at + ch.len_utf8();
                while let Some((i, c)) = chars.peek().copied() {
                    if !(c.is_alphanumeric() || c == '_') { break }
                    end = i + c.len_utf8();
                    chars.next();
                }
                match &src[at..end] {
                    "and" => Token::Op(BinaryOp::And),
                    "or" => Token::Op(BinaryOp::Or),
                    "not" => Token::Not,
                    "true" => Token::Bool(true),
                    "false" => Token::Bool(false),
                    ident => Token::Ident(ident.into()),
                }
            }
            '+' => Token::Op(BinaryOp::Add),
            '-' => Token::Op(BinaryOp::Sub),
            '*' => Token::Op(BinaryOp::Mul),
            '/' => Token::Op(BinaryOp::Div),
            '%' => Token::Op(BinaryOp::Mod),
            '^' => Token::Op(BinaryOp::Pow),
            '(' => Token::LParen,
            ')' => Token::RParen,
            '[' => Token::LSquare,
            ']' => Token::RSquare,
            ',' => Token::Comma,
            '=' | '!' | '<' | '>' | '&' | '|' => {
                let doubled = chars.next_if(|(_, c)| *c == '=' || (*c == ch && matches!(ch, '=' | '&' | '|'))).is_some();
                match (ch, doubled) {
                    ('=', _) => Token::Op(BinaryOp::Eq),
                    ('!', true) => Token::Op(BinaryOp::Ne),
                    ('!', false) => Token::Not,
                    ('<', false) => Token::Op(BinaryOp::Lt),
                    ('<', true) => Token::Op(BinaryOp::Le),
                    ('>', false) => Token::Op(BinaryOp::Gt),
                    ('>', true) => Token::Op(BinaryOp::Ge),
                    ('&', true) => Token::Op(BinaryOp::And),
                    ('|', true) => Token::Op(BinaryOp::Or),
                    _ => return Err(ExprError::UnexpectedChar { ch, at }),
                }
            }
            _ => return Err(ExprError::UnexpectedChar { ch, at }),
        };
        if tokens.len() >= MAX_TOKENS {
            return Err(ExprError::TooLong { limit: MAX_TOKENS });
        }
        tokens.push(token);
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    index: usize,
    depth: usize,
}
impl Parser {
    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.index).cloned();
        self.index += 1;
        token
    }
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.index)
    }
    fn peek_op(&self, ops: &[BinaryOp]) -> Option<BinaryOp> {
        match self.peek() {
            Some(Token::Op(op)) if ops.contains(op) => Some(*op),
            _ => None,
        }
    }
    fn expect(&mut self, token: Token) -> Result<(), ExprError> {
        match self.next() {
            Some(x) if x == token => Ok(()),
            Some(x) => Err(ExprError::UnexpectedToken { found: format_compact!("{x}") }),
            None => Err(ExprError::UnexpectedEnd),
        }
    }

    fn binary_level(&mut self, ops: &[BinaryOp], inner: fn(&mut Self) -> Result<Expr, ExprError>) -> Result<Expr, ExprError> {
        let mut left = inner(self)?;
        while let Some(op) = self.peek_op(ops) {
            self.next();
            let right = inner(self)?;
            left = Expr::Binary { op, left: Box::new(left), right: Box::new(right) };
        }
        Ok(left)
    }
    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        self.binary_level(&[BinaryOp::Or], Self::parse_and)
    }
    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        self.binary_level(&[BinaryOp::And], Self::parse_comparison)
    }
    fn parse_comparison(&mut self) -> Result<Expr, ExprError> {
        self.binary_level(&[BinaryOp::Eq, BinaryOp::Ne, BinaryOp::Lt, BinaryOp::Le, BinaryOp::Gt, BinaryOp::Ge], Self::parse_expr)
    }
    fn parse_expr(&mut self) -> Result<Expr, ExprError> {
        self.binary_level(&[BinaryOp::Add, BinaryOp::Sub], Self::parse_summand)
    }
    fn parse_summand(&mut self) -> Result<Expr, ExprError> {
        self.binary_level(&[BinaryOp::Mul, BinaryOp::Div, BinaryOp::Mod], Self::parse_unary)
    }
    // every nesting construct recurses through here
    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        if self.depth >= MAX_DEPTH {
            return Err(ExprError::TooDeep { limit: MAX_DEPTH });
        }
        self.depth += 1;
        let res = self.parse_prefixed();
        self.depth -= 1;
        res
    }
    fn parse_prefixed(&mut self) -> Result<Expr, ExprError> {
        let op = match self.peek() {
            Some(Token::Op(BinaryOp::Sub)) => UnaryOp::Neg,
            Some(Token::Not) => UnaryOp::Not,
            _ => return self.parse_power(),
        };
        self.next();
        let value = self.parse_unary()?;
        Ok(Expr::Unary { op, value: Box::new(value) })
    }
    fn parse_power(&mut self) -> Result<Expr, ExprError> {
        let base = self.parse_factor()?;
        if self.peek_op(&[BinaryOp::Pow]).is_none() {
            return Ok(base);
        }
        self.next();
        let exp = self.parse_unary()?; // right associative
        Ok(Expr::Binary { op: BinaryOp::Pow, left: Box::new(base), right: Box::new(exp) })
    }
    fn parse_list(&mut self, close: Token) -> Result<Vec<Expr>, ExprError> {
        let mut items = vec![];
        if self.peek() == Some(&close) {
            self.next();
            return Ok(items);
        }
        loop {
            items.push(self.parse_or()?);
            match self.next() {
                Some(Token::Comma) => continue,
                Some(x) if x == close => return Ok(items),
                Some(x) => return Err(ExprError::UnexpectedToken { found: format_compact!("{x}") }),
                None => return Err(ExprError::UnexpectedEnd),
            }
        }
    }
    fn parse_factor(&mut self) -> Result<Expr, ExprError> {
        match self.next() {
            Some(Token::Number(x)) => Ok(Expr::Const(Value::Number(x))),
            Some(Token::Text(x)) => Ok(Expr::Const(Value::Text(x))),
            Some(Token::Bool(x)) => Ok(Expr::Const(Value::Bool(x))),
            Some(Token::Ident(name)) if self.peek() == Some(&Token::LParen) => {
                self.next();
                let func = Func::from_name(&name).ok_or(ExprError::UnknownFunction { name })?;
                let args = self.parse_list(Token::RParen)?;
                func.check_arity(args.len())?;
                Ok(Expr::Call { func, args })
            }
            Some(Token::Ident(name)) => Ok(Expr::Var(name)),
            Some(Token::LParen) => {
                let expr = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(expr)
            }
            Some(Token::LSquare) => Ok(Expr::List(self.parse_list(Token::RSquare)?)),
            Some(x) => Err(ExprError::UnexpectedToken { found: format_compact!("{x}") }),
            None => Err(ExprError::UnexpectedEnd),
        }
    }
}

/// Parses a formula (without its leading `=`).
pub fn parse(src: &str) -> Result<Expr, ExprError> {
    let mut parser = Parser { tokens: tokenize(src)?, index: 0, depth: 0 };
    let expr = parser.parse_or()?;
    match parser.next() {
        None => Ok(expr),
        Some(x) => Err(ExprError::UnexpectedToken { found: format_compact!("{x}") }),
    }
}

fn number(v: f64) -> Result<Value, ErrorCause> {
    Ok(Value::Number(Number::new(v)?))
}

impl Expr {
    pub fn eval(&self, env: &mut dyn Env) -> Result<Value, ErrorCause> {
        match self {
            Expr::Const(x) => Ok(x.clone()),
            Expr::Var(name) => env.lookup(name).ok_or_else(|| ErrorCause::UndefinedVariable { name: name.clone() }),
            Expr::List(items) => Ok(Value::from(items.iter().map(|x| x.eval(env)).collect::<Result<Vec<_>, _>>()?)),
            Expr::Unary { op, value } => {
                let value = value.eval(env)?;
                match op {
                    UnaryOp::Neg => number(-value.as_number()?.get()),
                    UnaryOp::Not => Ok(Value::Bool(!value.as_bool()?)),
                }
            }
            Expr::Binary { op: BinaryOp::And, left, right } => Ok(Value::Bool(left.eval(env)?.as_bool()? && right.eval(env)?.as_bool()?)),
            Expr::Binary { op: BinaryOp::Or, left, right } => Ok(Value::Bool(left.eval(env)?.as_bool()? || right.eval(env)?.as_bool()?)),
            Expr::Binary { op, left, right } => {
                let (left, right) = (left.eval(env)?, right.eval(env)?);
                binary(*op, &left, &right)
            }
            Expr::Call { func, args } => {
                let args = args.iter().map(|x| x.eval(env)).collect::<Result<Vec<_>, _>>()?;
                call(*func, &args, env)
            }
        }
    }
}

fn binary(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, ErrorCause> {
    match op {
        BinaryOp::Add => match (left.as_number(), right.as_number()) {
            (Ok(a), Ok(b)) => number(a.get() + b.get()),
            _ => match (left, right) {
                (Value::List(a), Value::List(b)) => Ok(Value::from(a.iter().chain(b.iter()).cloned().collect::<Vec<_>>())),
                _ => Ok(Value::Text(format_compact!("{}{}", &*left.as_text(), &*right.as_text()))),
            }
        }
        BinaryOp::Sub => number(left.as_number()?.get() - right.as_number()?.get()),
        BinaryOp::Mul => number(left.as_number()?.get() * right.as_number()?.get()),
        BinaryOp::Div => number(left.as_number()?.get() / right.as_number()?.get()),
        BinaryOp::Mod => number(modulus(left.as_number()?.get(), right.as_number()?.get())),
        BinaryOp::Pow => number(left.as_number()?.get().powf(right.as_number()?.get())),
        BinaryOp::Eq => Ok(Value::Bool(left.loose_eq(right))),
        BinaryOp::Ne => Ok(Value::Bool(!left.loose_eq(right))),
        BinaryOp::Lt => Ok(Value::Bool(left.compare(right)?.is_lt())),
        BinaryOp::Le => Ok(Value::Bool(left.compare(right)?.is_le())),
        BinaryOp::Gt => Ok(Value::Bool(left.compare(right)?.is_gt())),
        BinaryOp::Ge => Ok(Value::Bool(left.compare(right)?.is_ge())),
        BinaryOp::And => Ok(Value::Bool(left.as_bool()? && right.as_bool()?)),
        BinaryOp::Or => Ok(Value::Bool(left.as_bool()? || right.as_bool()?)),
    }
}

fn call(func: Func, args: &[Value], env: &mut dyn Env) -> Result<Value, ErrorCause> {
    let unary = |f: fn(f64) -> f64| -> Result<Value, ErrorCause> { number(f(args[0].as_number()?.get())) };
    match func {
        Func::Random => {
            let (a, b) = (args[0].as_number()?.get(), args[1].as_number()?.get());
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            if lo.fract() == 0.0 && hi.fract() == 0.0 {
                number((lo + (env.random() * (hi - lo + 1.0)).floor()).min(hi))
            } else {
                number(lo + env.random() * (hi - lo))
            }
        }
        Func::Len => match &args[0] {
            Value::List(x) => number(x.len() as f64),
            Value::Map(x) => number(x.len() as f64),
            x => number(x.as_text().chars().count() as f64),
        }
        Func::Min | Func::Max => {
            let items = match args {
                [Value::List(x)] => x.as_slice(),
                x => x,
            };
            let mut best: Option<Number> = None;
            for item in items {
                let v = item.as_number()?;
                best = Some(match best {
                    None => v,
                    Some(b) if func == Func::Min => b.min(v),
                    Some(b) => b.max(v),
                });
            }
            best.map(Value::Number).ok_or(ErrorCause::IndexOutOfBounds { index: 1, len: 0 })
        }
        Func::Abs => unary(f64::abs),
        Func::Floor => unary(f64::floor),
        Func::Ceil => unary(f64::ceil),
        Func::Round => unary(f64::round),
        Func::Sqrt => unary(f64::sqrt),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct Vars(Vec<(&'static str, Value)>);
    impl Env for Vars {
        fn lookup(&self, var: &str) -> Option<Value> {
            self.0.iter().find(|x| x.0 == var).map(|x| x.1.clone())
        }
        fn random(&mut self) -> f64 {
            0.5
        }
    }

    fn eval(src: &str) -> Result<Value, ErrorCause> {
        let mut env = Vars(vec![("x", Value::from(5)), ("name", Value::from("steve")), ("items", Value::from(vec![Value::from(3), Value::from(9)]))]);
        parse(src).map_err(|e| ErrorCause::BadFormula { formula: src.into(), msg: format_compact!("{e}") })?.eval(&mut env)
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(eval("x + 1").unwrap(), Value::from(6));
        assert_eq!(eval("1 + 2 * 3").unwrap(), Value::from(7));
        assert_eq!(eval("(1 + 2) * 3").unwrap(), Value::from(9));
        assert_eq!(eval("2 ^ 3 ^ 2").unwrap(), Value::from(512));
        assert_eq!(eval("-x % 3").unwrap(), Value::from(1));
        assert_eq!(eval("7 / 2").unwrap().to_string(), "3.5");
        assert_eq!(eval("'hi ' + name").unwrap(), Value::from("hi steve"));
        assert!(matches!(eval("1 / 0"), Err(ErrorCause::NumberError { .. })));
    }

    #[test]
    fn test_logic() {
        assert_eq!(eval("x > 3 and x <= 5").unwrap(), Value::Bool(true));
        assert_eq!(eval("x == 4 || not true").unwrap(), Value::Bool(false));
        assert_eq!(eval("name = 'STEVE'").unwrap(), Value::Bool(true));
        assert_eq!(eval("!(x != 5)").unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_functions() {
        assert_eq!(eval("len(items) + len(name)").unwrap(), Value::from(7));
        assert_eq!(eval("max(items)").unwrap(), Value::from(9));
        assert_eq!(eval("min(4, x, 2)").unwrap(), Value::from(2));
        assert_eq!(eval("random(1, 6)").unwrap(), Value::from(4));
        assert_eq!(eval("floor(2.7) + round(0.5)").unwrap(), Value::from(3));
        assert_eq!(eval("[x, 1]").unwrap(), Value::from(vec![Value::from(5), Value::from(1)]));
    }

    #[test]
    fn test_errors() {
        assert!(matches!(eval("y + 1"), Err(ErrorCause::UndefinedVariable { .. })));
        assert!(matches!(parse("1 +"), Err(ExprError::UnexpectedEnd)));
        assert!(matches!(parse("(1"), Err(ExprError::UnexpectedEnd)));
        assert!(matches!(parse("1 2"), Err(ExprError::UnexpectedToken { .. })));
        assert!(matches!(parse("'abc"), Err(ExprError::UnterminatedString { at: 0 })));
        assert!(matches!(parse("nope(1)"), Err(ExprError::UnknownFunction { .. })));
        assert!(matches!(parse("abs(1, 2)"), Err(ExprError::Arity { .. })));
        assert!(matches!(parse("x $ 1"), Err(ExprError::UnexpectedChar { ch: '$', at: 2 })));
    }

    #[test]
    fn test_limits() {
        assert_eq!(parse(&"(".repeat(5000)), Err(ExprError::TooLong { limit: MAX_TOKENS }));
        assert_eq!(parse(&format!("{}1{}", "(".repeat(200), ")".repeat(200))), Err(ExprError::TooDeep { limit: MAX_DEPTH }));
        assert_eq!(parse(&"-".repeat(100)), Err(ExprError::TooDeep { limit: MAX_DEPTH }));
        assert_eq!(parse(&format!("{}1{}", "[".repeat(100), "]".repeat(100))), Err(ExprError::TooDeep { limit: MAX_DEPTH }));
        assert_eq!(parse(&vec!["1"; 600].join(" + ")), Err(ExprError::TooLong { limit: MAX_TOKENS }));

        assert_eq!(eval(&format!("{}1{}", "(".repeat(30), ")".repeat(30))).unwrap(), Value::from(1));
        assert_eq!(eval(&vec!["1"; 400].join(" + ")).unwrap(), Value::from(400));
    }
}
