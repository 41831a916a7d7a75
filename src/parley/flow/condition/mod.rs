// SPDX-License-Identifier: MIT

//! Expression language for flow routing and templates
//!
//! This module provides parsing and evaluation of edge conditions and
//! `{{...}}` placeholders. Expressions look like:
//! - `intent == 'book'`
//! - `x > 0 && customer.plate != null`
//! - `reply.toLowerCase().startsWith('ja')`
//!
//! Evaluation never performs I/O or mutation, and failures are errors rather
//! than a silent `false`.

mod ast;
mod evaluator;
mod parser;
mod template;

pub use ast::{CompareOp, Expression, Literal, Method};
pub use evaluator::{evaluate, evaluate_bool, evaluate_string, to_display_string, truthy};
pub use parser::parse;
pub use template::{interpolate, Template};

use crate::parley::flow::state::Variables;
use thiserror::Error;

/// Expression failures
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExpressionError {
    #[error("Could not parse expression '{source_text}': {message}")]
    Parse {
        source_text: String,
        message: String,
    },

    #[error("Could not evaluate expression: {0}")]
    Eval(String),
}

impl ExpressionError {
    pub fn parse(source: &str, message: impl Into<String>) -> Self {
        Self::Parse {
            source_text: source.to_string(),
            message: message.into(),
        }
    }

    pub fn eval(message: impl Into<String>) -> Self {
        Self::Eval(message.into())
    }
}

/// Parse and evaluate a condition in one step
pub fn check(source: &str, vars: &Variables) -> Result<bool, ExpressionError> {
    evaluate_bool(&parse(source)?, vars)
}
