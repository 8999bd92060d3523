//! Assignment target resolution
//!
//! Splits a statement into an optional target and the expression text.
//! The assignment `=` is the first one that is not part of `==`, `!=`,
//! `>=` or `<=`.

use thiserror::Error;

use super::substitute::parse_index;
use super::variables::{var_name, VarName};
use super::{RegisterIndex, MAX_EXPRESSION_LEN};

/// Where a statement's result goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// No assignment: legacy single-output statement
    None,
    /// Temporary variable, name already truncated
    Variable(VarName),
    /// Device register `{d[device][register]}`
    Register(RegisterIndex),
}

/// Resolved statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment<'a> {
    pub target: Target,
    /// Right-hand side, or the whole statement when there is no target
    pub expression: &'a str,
}

impl Assignment<'_> {
    pub fn has_assignment(&self) -> bool {
        self.target != Target::None
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssignmentError {
    #[error("malformed device target '{0}', expected {{d[<device>][<register>]}}")]
    MalformedTarget(String),

    #[error("invalid variable name '{0}'")]
    InvalidVariableName(String),

    #[error("empty expression after '='")]
    EmptyExpression,

    #[error("expression too long ({length} characters, max {max})")]
    ExpressionTooLong { length: usize, max: usize },
}

/// Resolve the target of a statement
pub fn parse_assignment(statement: &str) -> Result<Assignment<'_>, AssignmentError> {
    let Some(eq) = find_assignment_operator(statement) else {
        return Ok(Assignment {
            target: Target::None,
            expression: statement,
        });
    };

    let lhs = statement[..eq].trim();
    let expression = statement[eq + 1..].trim_start();

    if expression.trim_end().is_empty() {
        return Err(AssignmentError::EmptyExpression);
    }

    let length = expression.chars().count();
    if length > MAX_EXPRESSION_LEN {
        return Err(AssignmentError::ExpressionTooLong {
            length,
            max: MAX_EXPRESSION_LEN,
        });
    }

    let target = if lhs.starts_with('{') {
        let index = parse_device_target(lhs)
            .ok_or_else(|| AssignmentError::MalformedTarget(lhs.to_string()))?;
        Target::Register(index)
    } else if is_identifier(lhs) {
        Target::Variable(var_name(lhs))
    } else {
        return Err(AssignmentError::InvalidVariableName(lhs.to_string()));
    };

    Ok(Assignment { target, expression })
}

/// Byte offset of the assignment `=`, skipping comparison operators
fn find_assignment_operator(statement: &str) -> Option<usize> {
    let bytes = statement.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'=' {
            let prev = if i > 0 { bytes[i - 1] } else { 0 };
            let next = bytes.get(i + 1).copied().unwrap_or(0);

            if next == b'=' {
                i += 2;
                continue;
            }
            if !matches!(prev, b'=' | b'<' | b'>' | b'!') {
                return Some(i);
            }
        }
        i += 1;
    }

    None
}

fn parse_device_target(lhs: &str) -> Option<RegisterIndex> {
    let body = lhs.strip_prefix("{d[")?.strip_suffix("]}")?;
    let (device, register) = body.split_once("][")?;

    let is_index = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if !is_index(device) || !is_index(register) {
        return None;
    }

    Some(RegisterIndex::new(parse_index(device), parse_index(register)))
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}
