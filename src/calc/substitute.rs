//! Device placeholder interpolation
//!
//! Replaces every `{d[<device>][<register>]}` in an expression with the
//! snapshot value before evaluation. A `{` that does not start `d[` is
//! copied through unchanged.

use thiserror::Error;

use super::snapshot::DeviceSnapshot;
use super::RegisterIndex;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubstitutionError {
    #[error("expected ']' after device index")]
    MissingDeviceClose,

    #[error("expected '[' before register index")]
    MissingRegisterOpen,

    #[error("expected ']' after register index")]
    MissingRegisterClose,

    #[error("expected '}}' to close device reference")]
    MissingBrace,

    #[error("empty device or register index")]
    MissingIndex,

    #[error("device index {index} out of range (max {max})")]
    DeviceOutOfRange { index: usize, max: isize },

    #[error("register index {index} out of range for device {device} (max {max})")]
    RegisterOutOfRange {
        device: usize,
        index: usize,
        max: isize,
    },
}

/// Format a value as the shortest of `%.6f` with trailing zeros removed
pub fn format_value(value: f64) -> String {
    let mut text = format!("{:.6}", value);
    if text.contains('.') {
        let trimmed = text.trim_end_matches('0').trim_end_matches('.').len();
        text.truncate(trimmed);
    }
    text
}

/// Replace all device placeholders with their snapshot values
pub fn substitute_device_values(
    expression: &str,
    snapshot: &DeviceSnapshot,
) -> Result<String, SubstitutionError> {
    let mut out = String::with_capacity(expression.len());
    let mut rest = expression;

    while let Some(pos) = rest.find('{') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        match after.strip_prefix("d[") {
            Some(body) => {
                let (index, remaining) = parse_placeholder(body)?;
                let value = lookup(snapshot, index)?;
                out.push_str(&format_value(value));
                rest = remaining;
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }

    out.push_str(rest);
    Ok(out)
}

/// Parse `<digits>][<digits>]}` and return the index plus the remaining text
fn parse_placeholder(body: &str) -> Result<(RegisterIndex, &str), SubstitutionError> {
    let (device, rest) = split_digits(body);
    let rest = rest
        .strip_prefix(']')
        .ok_or(SubstitutionError::MissingDeviceClose)?;
    let rest = rest
        .strip_prefix('[')
        .ok_or(SubstitutionError::MissingRegisterOpen)?;
    let (register, rest) = split_digits(rest);
    let rest = rest
        .strip_prefix(']')
        .ok_or(SubstitutionError::MissingRegisterClose)?;
    let rest = rest.strip_prefix('}').ok_or(SubstitutionError::MissingBrace)?;

    if device.is_empty() || register.is_empty() {
        return Err(SubstitutionError::MissingIndex);
    }

    Ok((
        RegisterIndex::new(parse_index(device), parse_index(register)),
        rest,
    ))
}

fn split_digits(text: &str) -> (&str, &str) {
    let end = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    text.split_at(end)
}

/// Digits too large for usize are out of range anyway
pub(crate) fn parse_index(digits: &str) -> usize {
    digits.parse().unwrap_or(usize::MAX)
}

fn lookup(snapshot: &DeviceSnapshot, index: RegisterIndex) -> Result<f64, SubstitutionError> {
    let count = snapshot
        .register_count(index.device)
        .ok_or(SubstitutionError::DeviceOutOfRange {
            index: index.device,
            max: snapshot.device_count() as isize - 1,
        })?;

    snapshot
        .get(index)
        .ok_or(SubstitutionError::RegisterOutOfRange {
            device: index.device,
            index: index.register,
            max: count as isize - 1,
        })
}
