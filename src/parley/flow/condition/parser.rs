// SPDX-License-Identifier: MIT

//! Expression parser
//!
//! Parses expressions like:
//! - `intent == 'book'`
//! - `x > 0 && customer.plate != null`
//! - `reply.toLowerCase().startsWith('ja') or reply contains 'yes'`
//! - `slots[0].time == '10:00'`

use super::ast::{CompareOp, Expression, Literal, Method};
use super::ExpressionError;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Dot,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Minus,
    Bang,
    AndAnd,
    OrOr,
    Op(CompareOp),
}

/// Parse an expression string into an AST
pub fn parse(input: &str) -> Result<Expression, ExpressionError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(ExpressionError::parse(input, "empty expression"));
    }

    let mut parser = Parser {
        source: input,
        tokens,
        pos: 0,
    };
    let expr = parser.parse_or()?;
    if let Some(tok) = parser.peek() {
        return Err(ExpressionError::parse(
            input,
            format!("unexpected token {:?}", tok),
        ));
    }
    Ok(expr)
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExpressionError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(ExpressionError::parse(input, "unterminated string")),
                        Some('\\') => {
                            if let Some(next) = chars.get(i + 1) {
                                s.push(*next);
                                i += 2;
                            } else {
                                return Err(ExpressionError::parse(input, "unterminated string"));
                            }
                        }
                        Some(ch) if *ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            s.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text.parse::<f64>().map_err(|_| {
                    ExpressionError::parse(input, format!("invalid number '{}'", text))
                })?;
                tokens.push(Token::Number(n));
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
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
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::AndAnd);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::OrOr);
                i += 2;
            }
            '=' | '!' => {
                let next = chars.get(i + 1) == Some(&'=');
                let third = chars.get(i + 2) == Some(&'=');
                match (c, next, third) {
                    ('=', true, true) => {
                        tokens.push(Token::Op(CompareOp::StrictEq));
                        i += 3;
                    }
                    ('=', true, false) => {
                        tokens.push(Token::Op(CompareOp::Eq));
                        i += 2;
                    }
                    ('!', true, true) => {
                        tokens.push(Token::Op(CompareOp::StrictNotEq));
                        i += 3;
                    }
                    ('!', true, false) => {
                        tokens.push(Token::Op(CompareOp::NotEq));
                        i += 2;
                    }
                    ('!', false, _) => {
                        tokens.push(Token::Bang);
                        i += 1;
                    }
                    _ => {
                        return Err(ExpressionError::parse(
                            input,
                            "assignment is not allowed, use '=='",
                        ))
                    }
                }
            }
            '>' | '<' => {
                let eq = chars.get(i + 1) == Some(&'=');
                let op = match (c, eq) {
                    ('>', true) => CompareOp::Gte,
                    ('>', false) => CompareOp::Gt,
                    ('<', true) => CompareOp::Lte,
                    _ => CompareOp::Lt,
                };
                tokens.push(Token::Op(op));
                i += if eq { 2 } else { 1 };
            }
            other => {
                return Err(ExpressionError::parse(
                    input,
                    format!("unexpected character '{}'", other),
                ))
            }
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn error(&self, message: impl Into<String>) -> ExpressionError {
        ExpressionError::parse(self.source, message)
    }

    fn expect(&mut self, expected: Token) -> Result<(), ExpressionError> {
        match self.next() {
            Some(tok) if tok == expected => Ok(()),
            Some(tok) => Err(self.error(format!("expected {:?}, found {:?}", expected, tok))),
            None => Err(self.error(format!("expected {:?}, found end of input", expected))),
        }
    }

    fn is_keyword(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(w)) if w == word)
    }

    fn parse_or(&mut self) -> Result<Expression, ExpressionError> {
        let mut left = self.parse_and()?;
        while matches!(self.peek(), Some(Token::OrOr)) || self.is_keyword("or") {
            self.next();
            let right = self.parse_and()?;
            left = Expression::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expression, ExpressionError> {
        let mut left = self.parse_not()?;
        while matches!(self.peek(), Some(Token::AndAnd)) || self.is_keyword("and") {
            self.next();
            let right = self.parse_not()?;
            left = Expression::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expression, ExpressionError> {
        if matches!(self.peek(), Some(Token::Bang)) || self.is_keyword("not") {
            self.next();
            let inner = self.parse_not()?;
            return Ok(Expression::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expression, ExpressionError> {
        let left = self.parse_postfix()?;

        let op = match self.peek() {
            Some(Token::Op(op)) => Some(*op),
            Some(Token::Ident(w)) if w == "contains" => Some(CompareOp::Contains),
            _ => None,
        };

        match op {
            Some(op) => {
                self.next();
                let right = self.parse_postfix()?;
                Ok(Expression::Compare {
                    left: Box::new(left),
                    op,
                    right: Box::new(right),
                })
            }
            None => Ok(left),
        }
    }

    fn parse_postfix(&mut self) -> Result<Expression, ExpressionError> {
        let mut expr = self.parse_primary()?;

        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.next();
                    let name = match self.next() {
                        Some(Token::Ident(name)) => name,
                        other => {
                            return Err(
                                self.error(format!("expected property name, found {:?}", other))
                            )
                        }
                    };

                    if matches!(self.peek(), Some(Token::LParen)) {
                        let method = Method::from_name(&name)
                            .ok_or_else(|| self.error(format!("method '{}' is not allowed", name)))?;
                        let args = self.parse_args()?;
                        if args.len() != method.arity() {
                            return Err(self.error(format!(
                                "{}() takes {} argument(s), got {}",
                                method,
                                method.arity(),
                                args.len()
                            )));
                        }
                        expr = Expression::Call {
                            receiver: Box::new(expr),
                            method,
                            args,
                        };
                    } else {
                        expr = Expression::Member {
                            object: Box::new(expr),
                            property: name,
                        };
                    }
                }
                Some(Token::LBracket) => {
                    self.next();
                    let index = self.parse_or()?;
                    self.expect(Token::RBracket)?;
                    expr = Expression::Index {
                        object: Box::new(expr),
                        index: Box::new(index),
                    };
                }
                _ => break,
            }
        }

        Ok(expr)
    }

    fn parse_args(&mut self) -> Result<Vec<Expression>, ExpressionError> {
        self.expect(Token::LParen)?;
        let mut args = Vec::new();
        if matches!(self.peek(), Some(Token::RParen)) {
            self.next();
            return Ok(args);
        }
        loop {
            args.push(self.parse_or()?);
            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => break,
                other => return Err(self.error(format!("expected ',' or ')', found {:?}", other))),
            }
        }
        Ok(args)
    }

    fn parse_primary(&mut self) -> Result<Expression, ExpressionError> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expression::Literal(Literal::Number(n))),
            Some(Token::Str(s)) => Ok(Expression::Literal(Literal::String(s))),
            Some(Token::Minus) => match self.next() {
                Some(Token::Number(n)) => Ok(Expression::Literal(Literal::Number(-n))),
                other => Err(self.error(format!("expected number after '-', found {:?}", other))),
            },
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(word)) => match word.as_str() {
                "true" => Ok(Expression::Literal(Literal::Boolean(true))),
                "false" => Ok(Expression::Literal(Literal::Boolean(false))),
                "null" | "undefined" => Ok(Expression::Literal(Literal::Null)),
                "and" | "or" | "not" | "contains" => {
                    Err(self.error(format!("unexpected keyword '{}'", word)))
                }
                _ => Ok(Expression::Variable(word)),
            },
            Some(tok) => Err(self.error(format!("unexpected token {:?}", tok))),
            None => Err(self.error("unexpected end of input")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(name: &str) -> Box<Expression> {
        Box::new(Expression::Variable(name.to_string()))
    }

    fn string(s: &str) -> Box<Expression> {
        Box::new(Expression::Literal(Literal::String(s.to_string())))
    }

    fn number(n: f64) -> Box<Expression> {
        Box::new(Expression::Literal(Literal::Number(n)))
    }

    #[test]
    fn test_parse_simple_equality() {
        let expr = parse("intent == 'search'").unwrap();
        assert_eq!(
            expr,
            Expression::Compare {
                left: var("intent"),
                op: CompareOp::Eq,
                right: string("search"),
            }
        );
    }

    #[test]
    fn test_parse_numeric_comparison() {
        let expr = parse("confidence > 0.8").unwrap();
        assert_eq!(
            expr,
            Expression::Compare {
                left: var("confidence"),
                op: CompareOp::Gt,
                right: number(0.8),
            }
        );
    }

    #[test]
    fn test_parse_negative_number() {
        let expr = parse("x <= -1").unwrap();
        assert_eq!(
            expr,
            Expression::Compare {
                left: var("x"),
                op: CompareOp::Lte,
                right: number(-1.0),
            }
        );
    }

    #[test]
    fn test_parse_strict_operators() {
        assert!(matches!(
            parse("a === 1").unwrap(),
            Expression::Compare { op: CompareOp::StrictEq, .. }
        ));
        assert!(matches!(
            parse("a !== 1").unwrap(),
            Expression::Compare { op: CompareOp::StrictNotEq, .. }
        ));
    }

    #[test]
    fn test_parse_contains() {
        let expr = parse("tags contains 'bug'").unwrap();
        assert_eq!(
            expr,
            Expression::Compare {
                left: var("tags"),
                op: CompareOp::Contains,
                right: string("bug"),
            }
        );
    }

    #[test]
    fn test_parse_member_and_index() {
        let expr = parse("slots[0].time").unwrap();
        assert_eq!(
            expr,
            Expression::Member {
                object: Box::new(Expression::Index {
                    object: var("slots"),
                    index: number(0.0),
                }),
                property: "time".to_string(),
            }
        );

        let expr = parse("customer['name']").unwrap();
        assert_eq!(
            expr,
            Expression::Index {
                object: var("customer"),
                index: string("name"),
            }
        );
    }

    #[test]
    fn test_parse_method_call() {
        let expr = parse("reply.toLowerCase().startsWith('ja')").unwrap();
        assert_eq!(
            expr,
            Expression::Call {
                receiver: Box::new(Expression::Call {
                    receiver: var("reply"),
                    method: Method::ToLowerCase,
                    args: vec![],
                }),
                method: Method::StartsWith,
                args: vec![*string("ja")],
            }
        );
    }

    #[test]
    fn test_parse_rejects_unknown_method() {
        let err = parse("name.constructor()").unwrap_err();
        assert!(err.to_string().contains("not allowed"));
    }

    #[test]
    fn test_parse_rejects_wrong_arity() {
        assert!(parse("name.startsWith()").is_err());
        assert!(parse("name.trim('x')").is_err());
    }

    #[test]
    fn test_parse_and_or_precedence() {
        // a or (b and c)
        let expr = parse("a == 1 || b == 2 && c == 3").unwrap();
        match expr {
            Expression::Or(_, right) => assert!(matches!(*right, Expression::And(_, _))),
            other => panic!("Expected Or expression, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_keyword_operators() {
        let expr = parse("not done and retries < 3").unwrap();
        match expr {
            Expression::And(left, _) => assert!(matches!(*left, Expression::Not(_))),
            other => panic!("Expected And expression, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_parentheses() {
        let expr = parse("(a == 1 || b == 2) && c == 3").unwrap();
        match expr {
            Expression::And(left, _) => assert!(matches!(*left, Expression::Or(_, _))),
            other => panic!("Expected And expression, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_literals() {
        assert_eq!(
            parse("true").unwrap(),
            Expression::Literal(Literal::Boolean(true))
        );
        assert_eq!(parse("null").unwrap(), Expression::Literal(Literal::Null));
        assert_eq!(
            parse(r#""hello""#).unwrap(),
            Expression::Literal(Literal::String("hello".to_string()))
        );
    }

    #[test]
    fn test_parse_escaped_quote() {
        assert_eq!(
            parse(r"'it\'s'").unwrap(),
            Expression::Literal(Literal::String("it's".to_string()))
        );
    }

    #[test]
    fn test_parse_invalid() {
        assert!(parse("this is not valid").is_err());
        assert!(parse("").is_err());
        assert!(parse("x = 1").is_err());
        assert!(parse("'open").is_err());
        assert!(parse("(a == 1").is_err());
        assert!(parse("a ==").is_err());
        assert!(parse("a ; b").is_err());
    }
}
