// SPDX-License-Identifier: MIT

//! Abstract Syntax Tree for flow expressions

/// An expression over session variables
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Literal(Literal),
    /// Top-level variable lookup
    Variable(String),
    /// `object.property`
    Member {
        object: Box<Expression>,
        property: String,
    },
    /// `object[index]`
    Index {
        object: Box<Expression>,
        index: Box<Expression>,
    },
    /// `receiver.method(args)`, restricted to [`Method`]
    Call {
        receiver: Box<Expression>,
        method: Method,
        args: Vec<Expression>,
    },
    /// Comparison expression: left op right
    Compare {
        left: Box<Expression>,
        op: CompareOp,
        right: Box<Expression>,
    },
    /// Logical AND
    And(Box<Expression>, Box<Expression>),
    /// Logical OR
    Or(Box<Expression>, Box<Expression>),
    /// Logical NOT
    Not(Box<Expression>),
}

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CompareOp {
    /// ==
    Eq,
    /// !=
    NotEq,
    /// ===
    StrictEq,
    /// !==
    StrictNotEq,
    /// >
    Gt,
    /// >=
    Gte,
    /// <
    Lt,
    /// <=
    Lte,
    /// contains (for strings and arrays)
    Contains,
}

/// Literal values in expressions
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    String(String),
    Number(f64),
    Boolean(bool),
    Null,
}

/// String and collection methods an expression may call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Length,
    ToLowerCase,
    ToUpperCase,
    Trim,
    StartsWith,
    EndsWith,
    Includes,
}

impl Method {
    /// Resolve a method name against the allow-list
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "length" => Some(Method::Length),
            "toLowerCase" | "lower" => Some(Method::ToLowerCase),
            "toUpperCase" | "upper" => Some(Method::ToUpperCase),
            "trim" => Some(Method::Trim),
            "startsWith" => Some(Method::StartsWith),
            "endsWith" => Some(Method::EndsWith),
            "includes" => Some(Method::Includes),
            _ => None,
        }
    }

    /// Number of arguments the method takes
    pub fn arity(&self) -> usize {
        match self {
            Method::Length | Method::ToLowerCase | Method::ToUpperCase | Method::Trim => 0,
            Method::StartsWith | Method::EndsWith | Method::Includes => 1,
        }
    }
}

impl std::fmt::Display for CompareOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompareOp::Eq => write!(f, "=="),
            CompareOp::NotEq => write!(f, "!="),
            CompareOp::StrictEq => write!(f, "==="),
            CompareOp::StrictNotEq => write!(f, "!=="),
            CompareOp::Gt => write!(f, ">"),
            CompareOp::Gte => write!(f, ">="),
            CompareOp::Lt => write!(f, "<"),
            CompareOp::Lte => write!(f, "<="),
            CompareOp::Contains => write!(f, "contains"),
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Method::Length => "length",
            Method::ToLowerCase => "toLowerCase",
            Method::ToUpperCase => "toUpperCase",
            Method::Trim => "trim",
            Method::StartsWith => "startsWith",
            Method::EndsWith => "endsWith",
            Method::Includes => "includes",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_op_display() {
        assert_eq!(format!("{}", CompareOp::Eq), "==");
        assert_eq!(format!("{}", CompareOp::StrictNotEq), "!==");
        assert_eq!(format!("{}", CompareOp::Gte), ">=");
        assert_eq!(format!("{}", CompareOp::Contains), "contains");
    }

    #[test]
    fn test_method_allow_list() {
        assert_eq!(Method::from_name("toLowerCase"), Some(Method::ToLowerCase));
        assert_eq!(Method::from_name("lower"), Some(Method::ToLowerCase));
        assert_eq!(Method::from_name("startsWith").map(|m| m.arity()), Some(1));
        assert_eq!(Method::from_name("constructor"), None);
        assert_eq!(Method::from_name("eval"), None);
    }
}
