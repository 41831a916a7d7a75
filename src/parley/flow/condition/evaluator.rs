// SPDX-License-Identifier: MIT

//! Expression evaluator
//!
//! Evaluation is read-only over the session variable map. Anything that
//! cannot be computed (member access on null, a method on the wrong type)
//! is an error, never a silent `false`.

use super::ast::{CompareOp, Expression, Literal, Method};
use super::ExpressionError;
use crate::parley::flow::state::Variables;
use serde_json::{Number, Value};

/// Evaluate an expression to a JSON value
pub fn evaluate(expr: &Expression, vars: &Variables) -> Result<Value, ExpressionError> {
    match expr {
        Expression::Literal(lit) => Ok(literal_value(lit)),
        Expression::Variable(name) => Ok(vars.get(name).cloned().unwrap_or(Value::Null)),
        Expression::Member { object, property } => {
            let target = evaluate(object, vars)?;
            member(&target, property)
        }
        Expression::Index { object, index } => {
            let target = evaluate(object, vars)?;
            let key = evaluate(index, vars)?;
            index_value(&target, &key)
        }
        Expression::Call {
            receiver,
            method,
            args,
        } => {
            let target = evaluate(receiver, vars)?;
            let args = args
                .iter()
                .map(|a| evaluate(a, vars))
                .collect::<Result<Vec<_>, _>>()?;
            call(&target, *method, &args)
        }
        Expression::Compare { left, op, right } => {
            let l = evaluate(left, vars)?;
            let r = evaluate(right, vars)?;
            Ok(Value::Bool(compare(&l, *op, &r)))
        }
        Expression::And(left, right) => {
            if !truthy(&evaluate(left, vars)?) {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(truthy(&evaluate(right, vars)?)))
        }
        Expression::Or(left, right) => {
            if truthy(&evaluate(left, vars)?) {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(truthy(&evaluate(right, vars)?)))
        }
        Expression::Not(inner) => Ok(Value::Bool(!truthy(&evaluate(inner, vars)?))),
    }
}

/// Evaluate an expression in boolean mode
pub fn evaluate_bool(expr: &Expression, vars: &Variables) -> Result<bool, ExpressionError> {
    evaluate(expr, vars).map(|v| truthy(&v))
}

/// Evaluate an expression in string-coercion mode
pub fn evaluate_string(expr: &Expression, vars: &Variables) -> Result<String, ExpressionError> {
    evaluate(expr, vars).map(|v| to_display_string(&v))
}

/// Truthiness: null, false, 0 and "" are false
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Render a value as text the way it should appear inside a prompt
pub fn to_display_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
            _ => n.to_string(),
        },
        other => other.to_string(),
    }
}

fn literal_value(lit: &Literal) -> Value {
    match lit {
        Literal::String(s) => Value::String(s.clone()),
        Literal::Number(n) => Number::from_f64(*n)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Literal::Boolean(b) => Value::Bool(*b),
        Literal::Null => Value::Null,
    }
}

fn member(target: &Value, property: &str) -> Result<Value, ExpressionError> {
    match target {
        Value::Null => Err(ExpressionError::eval(format!(
            "cannot read property '{}' of null",
            property
        ))),
        Value::Object(map) => Ok(map.get(property).cloned().unwrap_or(Value::Null)),
        Value::String(s) if property == "length" => Ok(Value::from(s.chars().count())),
        Value::Array(arr) if property == "length" => Ok(Value::from(arr.len())),
        _ => Ok(Value::Null),
    }
}

fn index_value(target: &Value, key: &Value) -> Result<Value, ExpressionError> {
    match (target, key) {
        (Value::Null, _) => Err(ExpressionError::eval(format!(
            "cannot index null with {}",
            key
        ))),
        (Value::Array(arr), Value::Number(n)) => {
            let idx = n
                .as_f64()
                .filter(|f| *f >= 0.0 && f.fract() == 0.0)
                .ok_or_else(|| ExpressionError::eval(format!("invalid array index {}", n)))?;
            Ok(arr.get(idx as usize).cloned().unwrap_or(Value::Null))
        }
        (Value::Object(_), Value::String(s)) | (Value::String(_), Value::String(s)) => {
            member(target, s)
        }
        (_, Value::String(_)) | (_, Value::Number(_)) => Ok(Value::Null),
        (_, other) => Err(ExpressionError::eval(format!(
            "invalid index type {}",
            other
        ))),
    }
}

fn call(target: &Value, method: Method, args: &[Value]) -> Result<Value, ExpressionError> {
    let type_error = || {
        ExpressionError::eval(format!(
            "{}() is not supported on {}",
            method,
            type_name(target)
        ))
    };

    match method {
        Method::Length => match target {
            Value::String(s) => Ok(Value::from(s.chars().count())),
            Value::Array(a) => Ok(Value::from(a.len())),
            _ => Err(type_error()),
        },
        Method::ToLowerCase => match target {
            Value::String(s) => Ok(Value::String(s.to_lowercase())),
            _ => Err(type_error()),
        },
        Method::ToUpperCase => match target {
            Value::String(s) => Ok(Value::String(s.to_uppercase())),
            _ => Err(type_error()),
        },
        Method::Trim => match target {
            Value::String(s) => Ok(Value::String(s.trim().to_string())),
            _ => Err(type_error()),
        },
        Method::StartsWith | Method::EndsWith => {
            let s = target.as_str().ok_or_else(type_error)?;
            let needle = to_display_string(&args[0]);
            let found = if method == Method::StartsWith {
                s.starts_with(&needle)
            } else {
                s.ends_with(&needle)
            };
            Ok(Value::Bool(found))
        }
        Method::Includes => match target {
            Value::String(_) | Value::Array(_) => {
                Ok(Value::Bool(compare(target, CompareOp::Contains, &args[0])))
            }
            _ => Err(type_error()),
        },
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Numbers, or strings that read as numbers
fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn compare(left: &Value, op: CompareOp, right: &Value) -> bool {
    match op {
        CompareOp::Eq => loose_equal(left, right),
        CompareOp::NotEq => !loose_equal(left, right),
        CompareOp::StrictEq => strict_equal(left, right),
        CompareOp::StrictNotEq => !strict_equal(left, right),
        CompareOp::Gt => order(left, right, |o| o.is_gt()),
        CompareOp::Gte => order(left, right, |o| o.is_ge()),
        CompareOp::Lt => order(left, right, |o| o.is_lt()),
        CompareOp::Lte => order(left, right, |o| o.is_le()),
        CompareOp::Contains => contains(left, right),
    }
}

fn strict_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => (a - b).abs() < f64::EPSILON,
            _ => false,
        },
        _ => left == right,
    }
}

fn loose_equal(left: &Value, right: &Value) -> bool {
    if strict_equal(left, right) {
        return true;
    }
    match (left, right) {
        (Value::Number(_), Value::String(_)) | (Value::String(_), Value::Number(_)) => {
            match (as_number(left), as_number(right)) {
                (Some(a), Some(b)) => (a - b).abs() < f64::EPSILON,
                _ => false,
            }
        }
        _ => false,
    }
}

fn order<F>(left: &Value, right: &Value, accept: F) -> bool
where
    F: Fn(std::cmp::Ordering) -> bool,
{
    if let (Value::String(a), Value::String(b)) = (left, right) {
        if let (Ok(x), Ok(y)) = (a.trim().parse::<f64>(), b.trim().parse::<f64>()) {
            return x.partial_cmp(&y).map(&accept).unwrap_or(false);
        }
        return accept(a.cmp(b));
    }
    match (as_number(left), as_number(right)) {
        (Some(a), Some(b)) => a.partial_cmp(&b).map(accept).unwrap_or(false),
        _ => false,
    }
}

fn contains(left: &Value, right: &Value) -> bool {
    match left {
        // String contains substring
        Value::String(s) => s.contains(&to_display_string(right)),
        // Array contains value
        Value::Array(arr) => arr.iter().any(|v| strict_equal(v, right)),
        // Object contains key
        Value::Object(map) => right.as_str().map(|k| map.contains_key(k)).unwrap_or(false),
        _ => false,
    }
}
