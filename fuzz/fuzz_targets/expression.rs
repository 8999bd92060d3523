//! Fuzz target for the expression evaluator
//!
//! Arbitrary expression text must evaluate to a value or an error, never
//! panic or exhaust the stack.

#![no_main]

use fieldcalc::calc::{evaluate, TempVars};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(expression) = std::str::from_utf8(data) else {
        return;
    };

    let mut vars = TempVars::new();
    let _ = vars.set("x", 1.5);
    let _ = vars.set("limit", -20.0);

    let _ = evaluate(expression, &vars);
});
