//! Per-cycle matrix of converted register values

use crate::config::DeviceConfig;

use super::smoothing::SmoothingBank;
use super::RegisterIndex;

/// Read-only `values[device][register]` matrix built once per cycle
///
/// Each value is `raw * gain + offset`, where `raw` is the smoothing
/// estimate when smoothing is enabled and has seen a measurement. Rows are
/// ragged: each device keeps its own register count.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceSnapshot {
    values: Vec<Vec<f64>>,
}

impl DeviceSnapshot {
    pub fn build(devices: &[DeviceConfig], filters: &SmoothingBank) -> Self {
        let values = devices
            .iter()
            .enumerate()
            .map(|(d, device)| {
                device
                    .registers
                    .iter()
                    .enumerate()
                    .map(|(r, register)| {
                        let raw = if register.smoothing.enabled {
                            filters
                                .estimate(RegisterIndex::new(d, r))
                                .unwrap_or(register.raw as f64)
                        } else {
                            register.raw as f64
                        };
                        register.to_engineering(raw)
                    })
                    .collect()
            })
            .collect();

        Self { values }
    }

    /// Snapshot from precomputed values
    pub fn from_values(values: Vec<Vec<f64>>) -> Self {
        Self { values }
    }

    pub fn get(&self, index: RegisterIndex) -> Option<f64> {
        self.values
            .get(index.device)
            .and_then(|row| row.get(index.register))
            .copied()
    }

    pub fn device_count(&self) -> usize {
        self.values.len()
    }

    /// Register count of one device
    pub fn register_count(&self, device: usize) -> Option<usize> {
        self.values.get(device).map(Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RegisterConfig, SmoothingConfig};

    fn register(raw: u32, gain: f64, offset: f64) -> RegisterConfig {
        RegisterConfig {
            raw,
            gain,
            offset,
            ..RegisterConfig::default()
        }
    }

    fn device(registers: Vec<RegisterConfig>) -> DeviceConfig {
        DeviceConfig {
            name: "dev".to_string(),
            slave_id: 1,
            enabled: true,
            registers,
        }
    }

    #[test]
    fn test_linear_conversion_and_ragged_rows() {
        let devices = vec![
            device(vec![register(100, 0.5, 1.0), register(7, 1.0, 0.0)]),
            device(vec![register(3, 2.0, -1.0)]),
            device(Vec::new()),
        ];

        let snapshot = DeviceSnapshot::build(&devices, &SmoothingBank::new());

        assert_eq!(snapshot.device_count(), 3);
        assert_eq!(snapshot.register_count(0), Some(2));
        assert_eq!(snapshot.register_count(1), Some(1));
        assert_eq!(snapshot.register_count(2), Some(0));
        assert_eq!(snapshot.register_count(3), None);

        assert_eq!(snapshot.get(RegisterIndex::new(0, 0)), Some(51.0));
        assert_eq!(snapshot.get(RegisterIndex::new(0, 1)), Some(7.0));
        assert_eq!(snapshot.get(RegisterIndex::new(1, 0)), Some(5.0));
        assert_eq!(snapshot.get(RegisterIndex::new(1, 1)), None);
    }

    #[test]
    fn test_uses_estimate_when_smoothing_initialized() {
        let mut smoothed = register(20, 2.0, 0.0);
        smoothed.smoothing = SmoothingConfig {
            enabled: true,
            ..SmoothingConfig::default()
        };
        let devices = vec![device(vec![smoothed])];
        let index = RegisterIndex::new(0, 0);

        // not initialized yet: raw value is used
        let mut filters = SmoothingBank::new();
        assert_eq!(
            DeviceSnapshot::build(&devices, &filters).get(index),
            Some(40.0)
        );

        filters.update(index, 10.0, 0.01, 0.1);
        assert_eq!(
            DeviceSnapshot::build(&devices, &filters).get(index),
            Some(20.0)
        );
    }

    #[test]
    fn test_ignores_estimate_when_smoothing_disabled() {
        let devices = vec![device(vec![register(20, 1.0, 0.0)])];
        let index = RegisterIndex::new(0, 0);

        let mut filters = SmoothingBank::new();
        filters.update(index, 10.0, 0.01, 0.1);

        assert_eq!(
            DeviceSnapshot::build(&devices, &filters).get(index),
            Some(20.0)
        );
    }
}
