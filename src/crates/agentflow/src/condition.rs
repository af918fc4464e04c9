//! Condition Evaluator (C2, `spec.md` §4.2).
//!
//! Graph edges carry a `when` expression. It is first `{{ }}`-rendered
//! (via `crate::template`), then the resulting text is parsed and
//! evaluated in a closed sandbox: comparisons, `and`/`or`/`not`,
//! membership (`in`), and the string methods `lower`/`upper`/
//! `startswith`/`endswith`/`contains`. A literal `"else"` edge always
//! evaluates true. There is no generic expression engine (`spec.md` §9
//! design notes: "closed small AST with a fixed evaluator").
//!
//! The combinator shape (`And`/`Or`/`Not` over leaf comparisons) mirrors
//! the teacher's `router::evaluator::RuleEvaluator`/`RuleCondition`
//! dispatch, generalized from rule-matching to a full boolean grammar.

use crate::context::Context;
use crate::error::{EngineError, Result};
use crate::spec::CondExpr;
use crate::template;

/// Evaluate `expr.when` against `ctx`. `stage` is used for error
/// attribution only.
pub fn evaluate(expr: &CondExpr, ctx: &Context, stage: &str) -> Result<bool> {
    if expr.is_else() {
        return Ok(true);
    }
    let rendered = template::render(&expr.0, ctx, stage)
        .map_err(|e| EngineError::condition(stage, format!("template error: {e}")))?;
    let tokens = tokenize(&rendered).map_err(|m| EngineError::condition(stage, m))?;
    let mut parser = Parser { tokens: &tokens, pos: 0 };
    let ast = parser.parse_or().map_err(|m| EngineError::condition(stage, m))?;
    if parser.pos != tokens.len() {
        return Err(EngineError::condition(stage, "trailing tokens after expression"));
    }
    eval_ast(&ast).map_err(|m| EngineError::condition(stage, m))
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    StringLit(String),
    NumberLit(f64),
    And,
    Or,
    Not,
    In,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Dot,
    LParen,
    RParen,
    Comma,
    True,
    False,
}

fn tokenize(src: &str) -> std::result::Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
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
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '<' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Le);
                i += 2;
            }
            '<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            '>' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ge);
                i += 2;
            }
            '>' => {
                tokens.push(Token::Gt);
                i += 1;
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                while i < chars.len() && chars[i] != quote {
                    s.push(chars[i]);
                    i += 1;
                }
                if i >= chars.len() {
                    return Err("unterminated string literal".to_string());
                }
                i += 1;
                tokens.push(Token::StringLit(s));
            }
            _ if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n: f64 = text.parse().map_err(|_| format!("invalid number '{text}'"))?;
                tokens.push(Token::NumberLit(n));
            }
            _ if c.is_alphabetic() || c == '_' => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "in" => Token::In,
                    "true" | "True" => Token::True,
                    "false" | "False" => Token::False,
                    _ => Token::Ident(word),
                });
            }
            other => return Err(format!("unexpected character '{other}'")),
        }
    }
    Ok(tokens)
}

#[derive(Debug, Clone)]
enum Ast {
    And(Box<Ast>, Box<Ast>),
    Or(Box<Ast>, Box<Ast>),
    Not(Box<Ast>),
    Compare(Box<Ast>, CmpOp, Box<Ast>),
    In(Box<Ast>, Box<Ast>),
    MethodCall(Box<Ast>, String, Vec<Ast>),
    Path(Vec<String>),
    StringLit(String),
    NumberLit(f64),
    BoolLit(bool),
}

#[derive(Debug, Clone, Copy)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<&Token> {
        let t = self.tokens.get(self.pos);
        self.pos += 1;
        t
    }

    fn parse_or(&mut self) -> std::result::Result<Ast, String> {
        let mut left = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.advance();
            let right = self.parse_and()?;
            left = Ast::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> std::result::Result<Ast, String> {
        let mut left = self.parse_not()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.advance();
            let right = self.parse_not()?;
            left = Ast::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> std::result::Result<Ast, String> {
        if matches!(self.peek(), Some(Token::Not)) {
            self.advance();
            let inner = self.parse_not()?;
            return Ok(Ast::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> std::result::Result<Ast, String> {
        let left = self.parse_primary()?;
        let op = match self.peek() {
            Some(Token::Eq) => Some(CmpOp::Eq),
            Some(Token::Ne) => Some(CmpOp::Ne),
            Some(Token::Lt) => Some(CmpOp::Lt),
            Some(Token::Le) => Some(CmpOp::Le),
            Some(Token::Gt) => Some(CmpOp::Gt),
            Some(Token::Ge) => Some(CmpOp::Ge),
            Some(Token::In) => {
                self.advance();
                let right = self.parse_primary()?;
                return Ok(Ast::In(Box::new(left), Box::new(right)));
            }
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let right = self.parse_primary()?;
            return Ok(Ast::Compare(Box::new(left), op, Box::new(right)));
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> std::result::Result<Ast, String> {
        match self.advance().cloned() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                if !matches!(self.advance(), Some(Token::RParen)) {
                    return Err("expected closing ')'".to_string());
                }
                Ok(inner)
            }
            Some(Token::StringLit(s)) => Ok(Ast::StringLit(s)),
            Some(Token::NumberLit(n)) => Ok(Ast::NumberLit(n)),
            Some(Token::True) => Ok(Ast::BoolLit(true)),
            Some(Token::False) => Ok(Ast::BoolLit(false)),
            Some(Token::Ident(name)) => {
                let mut path = vec![name];
                while matches!(self.peek(), Some(Token::Dot)) {
                    self.advance();
                    match self.advance() {
                        Some(Token::Ident(n)) => path.push(n.clone()),
                        _ => return Err("expected identifier after '.'".to_string()),
                    }
                }
                // Optional trailing method call: `.lower()`, `.startswith("x")`.
                if matches!(self.peek(), Some(Token::LParen)) {
                    let method = path.pop().ok_or("method call with no receiver")?;
                    self.advance();
                    let mut args = Vec::new();
                    if !matches!(self.peek(), Some(Token::RParen)) {
                        args.push(self.parse_or()?);
                        while matches!(self.peek(), Some(Token::Comma)) {
                            self.advance();
                            args.push(self.parse_or()?);
                        }
                    }
                    if !matches!(self.advance(), Some(Token::RParen)) {
                        return Err("expected closing ')' in method call".to_string());
                    }
                    return Ok(Ast::MethodCall(Box::new(Ast::Path(path)), method, args));
                }
                Ok(Ast::Path(path))
            }
            other => Err(format!("unexpected token {other:?}")),
        }
    }
}

fn eval_ast(ast: &Ast) -> std::result::Result<bool, String> {
    Ok(eval_value(ast)?.as_bool())
}

#[derive(Debug, Clone, PartialEq)]
enum V {
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
}

impl V {
    fn as_bool(&self) -> bool {
        match self {
            V::Bool(b) => *b,
            V::Str(s) => !s.is_empty(),
            V::Num(n) => *n != 0.0,
            V::Null => false,
        }
    }

    fn as_str(&self) -> String {
        match self {
            V::Str(s) => s.clone(),
            V::Num(n) => n.to_string(),
            V::Bool(b) => b.to_string(),
            V::Null => String::new(),
        }
    }
}

/// `condition.rs` evaluates over literals only: the `when` clause has
/// already been rendered by the template engine, so by the time we parse
/// it there are no unresolved context paths left — a bare identifier at
/// this point can only be the literal words `true`/`false` (handled in
/// the tokenizer) or free text the template renderer passed through
/// untouched, which we surface as a string for `in`/string-method tests.
fn eval_value(ast: &Ast) -> std::result::Result<V, String> {
    match ast {
        Ast::And(l, r) => Ok(V::Bool(eval_ast(l)? && eval_ast(r)?)),
        Ast::Or(l, r) => Ok(V::Bool(eval_ast(l)? || eval_ast(r)?)),
        Ast::Not(inner) => Ok(V::Bool(!eval_ast(inner)?)),
        Ast::Compare(l, op, r) => {
            let lv = eval_value(l)?;
            let rv = eval_value(r)?;
            Ok(V::Bool(compare(&lv, *op, &rv)?))
        }
        Ast::In(needle, haystack) => {
            let n = eval_value(needle)?.as_str();
            let h = eval_value(haystack)?.as_str();
            Ok(V::Bool(h.contains(&n)))
        }
        Ast::MethodCall(receiver, method, args) => {
            let recv = eval_value(receiver)?.as_str();
            match method.as_str() {
                "lower" => Ok(V::Str(recv.to_lowercase())),
                "upper" => Ok(V::Str(recv.to_uppercase())),
                "startswith" => {
                    let arg = eval_value(args.first().ok_or("startswith requires one argument")?)?.as_str();
                    Ok(V::Bool(recv.starts_with(&arg)))
                }
                "endswith" => {
                    let arg = eval_value(args.first().ok_or("endswith requires one argument")?)?.as_str();
                    Ok(V::Bool(recv.ends_with(&arg)))
                }
                "contains" => {
                    let arg = eval_value(args.first().ok_or("contains requires one argument")?)?.as_str();
                    Ok(V::Bool(recv.contains(&arg)))
                }
                other => Err(format!("method '{other}' is not in the string-method whitelist")),
            }
        }
        Ast::Path(segments) => Ok(V::Str(segments.join("."))),
        Ast::StringLit(s) => Ok(V::Str(s.clone())),
        Ast::NumberLit(n) => Ok(V::Num(*n)),
        Ast::BoolLit(b) => Ok(V::Bool(*b)),
    }
}

fn compare(l: &V, op: CmpOp, r: &V) -> std::result::Result<bool, String> {
    if let (V::Num(a), V::Num(b)) = (l, r) {
        return Ok(match op {
            CmpOp::Eq => a == b,
            CmpOp::Ne => a != b,
            CmpOp::Lt => a < b,
            CmpOp::Le => a <= b,
            CmpOp::Gt => a > b,
            CmpOp::Ge => a >= b,
        });
    }
    let a = l.as_str();
    let b = r.as_str();
    match op {
        CmpOp::Eq => Ok(a == b),
        CmpOp::Ne => Ok(a != b),
        _ => Err("ordering comparisons require numeric operands".to_string()),
    }
}
