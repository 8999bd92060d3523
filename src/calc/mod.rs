//! Calculation engine
//!
//! Runs the operator's formula script against live register values:
//! - `smoothing`: per-register scalar estimator
//! - `snapshot`: converted device values for one cycle
//! - `script`: statement splitting
//! - `assignment`: assignment target resolution
//! - `substitute`: `{d[i][j]}` placeholder interpolation
//! - `expr`: recursive-descent expression evaluator
//! - `variables`: bounded temporary variable table
//! - `cycle`: one read-calculate-write pass
//! - `scheduler`: periodic driver on the tokio runtime

pub mod assignment;
pub mod cycle;
pub mod expr;
pub mod scheduler;
pub mod script;
pub mod smoothing;
pub mod snapshot;
pub mod substitute;
pub mod variables;

use std::fmt;

pub use assignment::{parse_assignment, Assignment, AssignmentError, Target};
pub use cycle::{run_cycle, test_script, CycleReport, LineReport, LineStatus, WriteError};
pub use expr::{evaluate, ExprError};
pub use scheduler::{CalculationScheduler, CycleStats};
pub use smoothing::{SmoothingBank, SmoothingState};
pub use snapshot::DeviceSnapshot;
pub use substitute::{format_value, substitute_device_values, SubstitutionError};
pub use variables::TempVars;

/// Maximum length of a right-hand-side expression
pub const MAX_EXPRESSION_LEN: usize = 2048;

/// Position of a register in the device list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegisterIndex {
    pub device: usize,
    pub register: usize,
}

impl RegisterIndex {
    pub const fn new(device: usize, register: usize) -> Self {
        Self { device, register }
    }
}

impl fmt::Display for RegisterIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "d[{}][{}]", self.device, self.register)
    }
}
