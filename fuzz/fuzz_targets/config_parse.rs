//! Fuzz target for configuration parsing
//!
//! Malformed YAML must be rejected with an error, never a panic, and an
//! accepted configuration must survive a save/load round through YAML.

#![no_main]

use fieldcalc::config::Configuration;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    // generic parse catches panics in serde_yaml itself
    let _ = serde_yaml::from_str::<serde_yaml::Value>(text);

    if let Ok(config) = Configuration::from_yaml(text) {
        if let Ok(yaml) = config.to_yaml() {
            assert!(Configuration::from_yaml(&yaml).is_ok());
        }
    }
});
