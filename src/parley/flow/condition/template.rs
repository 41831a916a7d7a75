// SPDX-License-Identifier: MIT

//! `{{expr}}` interpolation for prompts and messages

use super::ast::Expression;
use super::evaluator::evaluate_string;
use super::parser::parse;
use super::ExpressionError;
use crate::parley::flow::state::Variables;

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Text(String),
    Expr(Expression),
}

/// A parsed template
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    /// Parse a template, rejecting unclosed or invalid placeholders
    pub fn parse(source: &str) -> Result<Self, ExpressionError> {
        let mut segments = Vec::new();
        let mut rest = source;

        while let Some(start) = rest.find("{{") {
            if start > 0 {
                segments.push(Segment::Text(rest[..start].to_string()));
            }
            let after = &rest[start + 2..];
            let end = after.find("}}").ok_or_else(|| {
                ExpressionError::parse(source, "unclosed '{{' placeholder")
            })?;
            segments.push(Segment::Expr(parse(after[..end].trim())?));
            rest = &after[end + 2..];
        }

        if !rest.is_empty() {
            segments.push(Segment::Text(rest.to_string()));
        }

        Ok(Self { segments })
    }

    /// Render against the variable map
    pub fn render(&self, vars: &Variables) -> Result<String, ExpressionError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(t) => out.push_str(t),
                Segment::Expr(e) => out.push_str(&evaluate_string(e, vars)?),
            }
        }
        Ok(out)
    }

    /// True when the template contains no placeholders
    pub fn is_static(&self) -> bool {
        self.segments.iter().all(|s| matches!(s, Segment::Text(_)))
    }
}

/// Parse and render in one step
pub fn interpolate(source: &str, vars: &Variables) -> Result<String, ExpressionError> {
    Template::parse(source)?.render(vars)
}
