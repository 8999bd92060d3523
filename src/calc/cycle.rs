//! One read-calculate-write pass
//!
//! Phases, all under the cycle lock:
//! 1. Read: refresh cached raw values of polled registers, feeding the
//!    smoothing estimators.
//! 2. Script: build the snapshot once, then run every statement in source
//!    order. Errors are reported per line and never stop the pass.
//! 3. Outputs: write cached raw values of output registers the script did
//!    not write this pass.
//!
//! Statements read device values from the snapshot only, so a register
//! written by one statement shows its new value to the next cycle, not to
//! later statements. Temporary variables are visible to later statements.

use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{Configuration, RegisterConfig};
use crate::console::DiagnosticSink;
use crate::guard::{SharedState, Workspace};
use crate::modbus::StoreError;

use super::assignment::{parse_assignment, AssignmentError, Target};
use super::expr::{evaluate, ExprError};
use super::script::{statements, Statement};
use super::snapshot::DeviceSnapshot;
use super::substitute::{format_value, substitute_device_values, SubstitutionError};
use super::variables::TempVars;
use super::RegisterIndex;

/// Why a register write was not performed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteError {
    #[error("device {device} out of range (max {max})")]
    DeviceOutOfRange { device: usize, max: isize },

    #[error("register {register} out of range for device {device} (max {max})")]
    RegisterOutOfRange {
        device: usize,
        register: usize,
        max: isize,
    },

    #[error("device {0} is disabled")]
    DeviceDisabled(usize),

    #[error("register {0} is read-only")]
    ReadOnly(u16),

    #[error("register {0} has gain 0, cannot convert to raw")]
    ZeroGain(u16),

    #[error("value is not a finite number")]
    NotFinite,

    #[error("bus error 0x{:02X} ({0})", .0.code())]
    Store(#[from] StoreError),
}

/// Failure of one statement
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatementError {
    #[error("invalid assignment: {0}")]
    Assignment(#[from] AssignmentError),

    #[error("substitution error: {0}")]
    Substitution(#[from] SubstitutionError),

    #[error("evaluation error: {0}")]
    Evaluation(#[from] ExprError),

    #[error("write error: {0}")]
    Write(#[from] WriteError),
}

/// Summary of one cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub registers_read: usize,
    pub read_failures: usize,
    pub statements: usize,
    pub errors: usize,
    pub warnings: usize,
    pub writes: usize,
    /// Registers the script attempted to write, in order
    pub written: Vec<RegisterIndex>,
    pub outputs_refreshed: usize,
}

/// Run one full cycle under the shared-state guard
pub fn run_cycle(shared: &SharedState, sink: &dyn DiagnosticSink) -> CycleReport {
    let guard = shared.lock_for_cycle();
    guard.write(|ws| {
        let delay = Duration::from_millis(ws.config.bus.inter_register_delay_ms);

        let (registers_read, read_failures) = refresh_inputs(ws, sink, delay);
        let mut report = execute_script(ws, sink, delay);
        report.registers_read = registers_read;
        report.read_failures = read_failures;
        report.outputs_refreshed = refresh_outputs(ws, sink, &report.written, delay);

        report
    })
}

/// Yield between register operations
fn pace(delay: Duration) {
    if delay.is_zero() {
        thread::yield_now();
    } else {
        thread::sleep(delay);
    }
}

// ============================================================================
// Read phase
// ============================================================================

/// Refresh polled registers of enabled devices; returns (read, failed)
pub fn refresh_inputs(
    ws: &mut Workspace,
    sink: &dyn DiagnosticSink,
    delay: Duration,
) -> (usize, usize) {
    let Workspace {
        config,
        filters,
        store,
    } = ws;
    let mut read = 0;
    let mut failed = 0;

    for (d, device) in config.devices.iter_mut().enumerate() {
        if !device.enabled {
            continue;
        }

        for (r, register) in device.registers.iter_mut().enumerate() {
            if !register.is_polled() {
                continue;
            }
            let index = RegisterIndex::new(d, r);

            match store.read_registers(device.slave_id, register.address, register.kind, register.span)
            {
                Ok(words) => {
                    register.raw = combine_words(register, &words);
                    read += 1;

                    if register.smoothing.enabled {
                        let filtered = filters.update(
                            index,
                            register.raw as f64,
                            register.smoothing.q,
                            register.smoothing.r,
                        );
                        debug!(
                            "Read {} register {}: raw={}, filtered={:.3}",
                            device.name,
                            register.label(),
                            register.raw,
                            filtered
                        );
                    } else {
                        filters.reset(index);
                        debug!(
                            "Read {} register {}: raw={}",
                            device.name,
                            register.label(),
                            register.raw
                        );
                    }
                }
                Err(e) => {
                    failed += 1;
                    warn!(
                        "Failed to read {} (slave {}) register {}: {}",
                        device.name,
                        device.slave_id,
                        register.label(),
                        e
                    );
                    sink.log(&format!(
                        "[bus] read {} failed: error 0x{:02X} ({})\n",
                        index,
                        e.code(),
                        e
                    ));
                }
            }

            pace(delay);
        }
    }

    (read, failed)
}

/// Combine the words of a read into one raw value
pub(crate) fn combine_words(register: &RegisterConfig, words: &[u16]) -> u32 {
    match words {
        [high, low, ..] if register.span >= 2 => register.byte_order.combine([*high, *low]),
        [value, ..] => *value as u32,
        [] => register.raw,
    }
}

// ============================================================================
// Write path
// ============================================================================

/// Inverse linear conversion `raw = (value - offset) / gain`
pub fn inverse_conversion(register: &RegisterConfig, value: f64) -> Result<f64, WriteError> {
    if register.gain == 0.0 {
        return Err(WriteError::ZeroGain(register.address));
    }
    Ok((value - register.offset) / register.gain)
}

/// Round to the nearest integer and clamp to the register's raw range
pub fn clamp_raw(register: &RegisterConfig, raw: f64) -> Result<u32, WriteError> {
    if raw.is_nan() {
        return Err(WriteError::NotFinite);
    }
    Ok(raw.round().clamp(0.0, register.max_raw() as f64) as u32)
}

fn device_out_of_range(index: RegisterIndex, device_count: usize) -> WriteError {
    WriteError::DeviceOutOfRange {
        device: index.device,
        max: device_count as isize - 1,
    }
}

fn register_out_of_range(index: RegisterIndex, register_count: usize) -> WriteError {
    WriteError::RegisterOutOfRange {
        device: index.device,
        register: index.register,
        max: register_count as isize - 1,
    }
}

/// Look up a writable register of an enabled device
fn writable_register(
    config: &Configuration,
    index: RegisterIndex,
) -> Result<&RegisterConfig, WriteError> {
    let device = config
        .devices
        .get(index.device)
        .ok_or_else(|| device_out_of_range(index, config.devices.len()))?;

    let register = device
        .registers
        .get(index.register)
        .ok_or_else(|| register_out_of_range(index, device.registers.len()))?;

    if !device.enabled {
        return Err(WriteError::DeviceDisabled(index.device));
    }
    if register.is_read_only() {
        return Err(WriteError::ReadOnly(register.address));
    }
    Ok(register)
}

/// Validate a write of an engineering value and compute the raw value
pub fn plan_register_write(
    config: &Configuration,
    index: RegisterIndex,
    value: f64,
) -> Result<u32, WriteError> {
    let register = writable_register(config, index)?;
    let raw = inverse_conversion(register, value)?;
    clamp_raw(register, raw)
}

/// Update the cached raw value and write it to the device
pub fn apply_register_write(
    ws: &mut Workspace,
    index: RegisterIndex,
    raw: u32,
) -> Result<(), WriteError> {
    let Workspace { config, store, .. } = ws;
    let device_count = config.devices.len();
    let device = config
        .devices
        .get_mut(index.device)
        .ok_or_else(|| device_out_of_range(index, device_count))?;
    let slave = device.slave_id;
    let register_count = device.registers.len();
    let register = device
        .registers
        .get_mut(index.register)
        .ok_or_else(|| register_out_of_range(index, register_count))?;

    register.raw = raw;

    if register.span >= 2 {
        store.write_registers(slave, register.address, &register.byte_order.split(raw))?;
    } else {
        store.write_register(slave, register.address, raw as u16)?;
    }
    Ok(())
}

/// Convert an engineering value and write it; returns the raw value
pub fn write_engineering_value(
    ws: &mut Workspace,
    index: RegisterIndex,
    value: f64,
) -> Result<u32, WriteError> {
    let raw = plan_register_write(&ws.config, index, value)?;
    apply_register_write(ws, index, raw)?;
    Ok(raw)
}

/// First output register of an enabled device that can be written
pub fn first_output_register(config: &Configuration) -> Option<RegisterIndex> {
    config
        .devices
        .iter()
        .enumerate()
        .filter(|(_, device)| device.enabled)
        .find_map(|(d, device)| {
            device
                .registers
                .iter()
                .position(|r| r.output && !r.is_read_only())
                .map(|r| RegisterIndex::new(d, r))
        })
}

// ============================================================================
// Script phase
// ============================================================================

/// A statement evaluated but not yet dispatched
struct Evaluated<'a> {
    target: Target,
    expression: &'a str,
    substituted: String,
    value: f64,
}

fn evaluate_statement<'a>(
    text: &'a str,
    snapshot: &DeviceSnapshot,
    vars: &TempVars,
) -> Result<Evaluated<'a>, StatementError> {
    let assignment = parse_assignment(text)?;
    let substituted = substitute_device_values(assignment.expression, snapshot)?;
    let value = evaluate(&substituted, vars)?;

    Ok(Evaluated {
        target: assignment.target,
        expression: assignment.expression,
        substituted,
        value,
    })
}

enum Outcome {
    Done(String),
    Warning(String),
}

/// Per-pass state of the legacy single-output fallback
#[derive(Default)]
struct LegacyOutput {
    used: bool,
}

/// Run every statement of the configured script
pub fn execute_script(
    ws: &mut Workspace,
    sink: &dyn DiagnosticSink,
    delay: Duration,
) -> CycleReport {
    let mut report = CycleReport::default();

    let script = ws.config.calculation.script.clone();
    if script.trim().is_empty() {
        return report;
    }

    let snapshot = DeviceSnapshot::build(&ws.config.devices, &ws.filters);
    let mut vars = TempVars::new();
    let mut legacy = LegacyOutput::default();

    for statement in statements(&script) {
        report.statements += 1;
        let attempted = report.written.len();

        match run_statement(ws, &statement, &snapshot, &mut vars, &mut legacy, &mut report) {
            Ok(Outcome::Done(message)) => {
                sink.log(&format!("[line {}] {}\n", statement.line, message));
            }
            Ok(Outcome::Warning(message)) => {
                report.warnings += 1;
                sink.log(&format!("[line {}] warning: {}\n", statement.line, message));
            }
            Err(e) => {
                report.errors += 1;
                debug!("Script line {} failed: {}", statement.line, e);
                sink.log(&format!("[line {}] error: {}\n", statement.line, e));
            }
        }

        if report.written.len() > attempted {
            pace(delay);
        }
    }

    report
}

fn run_statement(
    ws: &mut Workspace,
    statement: &Statement<'_>,
    snapshot: &DeviceSnapshot,
    vars: &mut TempVars,
    legacy: &mut LegacyOutput,
    report: &mut CycleReport,
) -> Result<Outcome, StatementError> {
    let evaluated = evaluate_statement(statement.text, snapshot, vars)?;
    let value = evaluated.value;
    let shown = format_value(value);

    match evaluated.target {
        Target::Variable(name) => match vars.set(&name, value) {
            Ok(()) => Ok(Outcome::Done(format!(
                "{} = {} = {}",
                name, evaluated.substituted, shown
            ))),
            Err(e) => Ok(Outcome::Warning(e.to_string())),
        },

        Target::Register(index) => {
            let raw = plan_register_write(&ws.config, index, value)?;
            report.written.push(index);
            apply_register_write(ws, index, raw)?;
            report.writes += 1;
            Ok(Outcome::Done(format!(
                "{{{}}} = {} = {} (raw {})",
                index, evaluated.substituted, shown, raw
            )))
        }

        Target::None => {
            if legacy.used {
                return Ok(Outcome::Done(format!(
                    "{} = {} (legacy output already assigned this cycle)",
                    evaluated.expression, shown
                )));
            }
            legacy.used = true;

            let Some(index) = first_output_register(&ws.config) else {
                return Ok(Outcome::Warning(format!(
                    "{} = {}, no output register configured, value discarded",
                    evaluated.expression, shown
                )));
            };

            let register = writable_register(&ws.config, index)?;
            let raw = clamp_raw(register, value)?;
            report.written.push(index);
            apply_register_write(ws, index, raw)?;
            report.writes += 1;
            Ok(Outcome::Done(format!(
                "{} = {} -> output {{{}}} (raw {})",
                evaluated.expression, shown, index, raw
            )))
        }
    }
}

// ============================================================================
// Output phase
// ============================================================================

/// Write cached raw values of output registers not written this pass
pub fn refresh_outputs(
    ws: &mut Workspace,
    sink: &dyn DiagnosticSink,
    already_written: &[RegisterIndex],
    delay: Duration,
) -> usize {
    let pending: Vec<(RegisterIndex, u32)> = ws
        .config
        .devices
        .iter()
        .enumerate()
        .filter(|(_, device)| device.enabled)
        .flat_map(|(d, device)| {
            device
                .registers
                .iter()
                .enumerate()
                .filter(|(_, r)| r.output && !r.is_read_only())
                .map(move |(r, register)| (RegisterIndex::new(d, r), register.raw))
        })
        .filter(|(index, _)| !already_written.contains(index))
        .collect();

    let mut refreshed = 0;
    for (index, raw) in pending {
        match apply_register_write(ws, index, raw) {
            Ok(()) => refreshed += 1,
            Err(e) => {
                warn!("Failed to refresh output {}: {}", index, e);
                sink.log(&format!("[bus] write {} failed: {}\n", index, e));
            }
        }
        pace(delay);
    }

    refreshed
}

// ============================================================================
// Dry run
// ============================================================================

/// Result of one statement in a dry run
#[derive(Debug, Clone, PartialEq)]
pub enum LineStatus {
    /// Evaluated; `raw` is what would be written to a register target
    Value { value: f64, raw: Option<u32> },
    Error(StatementError),
}

/// Per-line dry run report
#[derive(Debug, Clone, PartialEq)]
pub struct LineReport {
    pub line: usize,
    pub statement: String,
    pub target: Option<Target>,
    pub substituted: Option<String>,
    pub status: LineStatus,
}

/// Evaluate a script against the current values without side effects
///
/// Temporary variables behave as in a live pass; register targets are
/// validated and converted but never written.
pub fn test_script(ws: &Workspace, script: &str) -> Vec<LineReport> {
    let snapshot = DeviceSnapshot::build(&ws.config.devices, &ws.filters);
    let mut vars = TempVars::new();
    let mut legacy_used = false;

    statements(script)
        .map(|statement| {
            let mut report = LineReport {
                line: statement.line,
                statement: statement.text.to_string(),
                target: None,
                substituted: None,
                status: LineStatus::Value {
                    value: 0.0,
                    raw: None,
                },
            };

            let evaluated = match evaluate_statement(statement.text, &snapshot, &vars) {
                Ok(evaluated) => evaluated,
                Err(e) => {
                    report.status = LineStatus::Error(e);
                    return report;
                }
            };

            let value = evaluated.value;
            let raw = match &evaluated.target {
                Target::Variable(name) => {
                    // a full table drops the variable, as in a live pass
                    let _ = vars.set(name, value);
                    Ok(None)
                }
                Target::Register(index) => {
                    plan_register_write(&ws.config, *index, value).map(Some)
                }
                Target::None if legacy_used => Ok(None),
                Target::None => {
                    legacy_used = true;
                    match first_output_register(&ws.config) {
                        Some(index) => writable_register(&ws.config, index)
                            .and_then(|register| clamp_raw(register, value))
                            .map(Some),
                        None => Ok(None),
                    }
                }
            };

            report.target = Some(evaluated.target);
            report.substituted = Some(evaluated.substituted);
            report.status = match raw {
                Ok(raw) => LineStatus::Value { value, raw },
                Err(e) => LineStatus::Error(e.into()),
            };
            report
        })
        .collect()
}
