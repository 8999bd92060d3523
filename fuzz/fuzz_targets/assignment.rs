//! Fuzz target for statement handling
//!
//! Runs assignment resolution and device placeholder substitution over
//! arbitrary statements against a small fixed snapshot.

#![no_main]

use fieldcalc::calc::{parse_assignment, substitute_device_values, DeviceSnapshot};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(statement) = std::str::from_utf8(data) else {
        return;
    };

    let snapshot = DeviceSnapshot::from_values(vec![vec![12.5, -3.0], vec![0.001]]);

    if let Ok(assignment) = parse_assignment(statement) {
        let _ = substitute_device_values(assignment.expression, &snapshot);
    }
});
