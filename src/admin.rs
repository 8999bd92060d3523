//! Administrative operations
//!
//! Operator-facing entry points for configuration changes, manual register
//! access and dry runs. Every mutation goes through the pause protocol of
//! [`SharedState::try_acquire_admin`] and keeps the guard held while the
//! configuration is persisted; persistence locks the state again, which the
//! reentrant lock allows.
//!
//! All methods block and may talk to the bus, so async callers run them on
//! the blocking pool.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::calc::cycle::{combine_words, write_engineering_value};
use crate::calc::smoothing::{sanitize_q, sanitize_r};
use crate::calc::{test_script, DeviceSnapshot, LineReport, RegisterIndex, SmoothingBank, WriteError};
use crate::config::{ConfigStore, Configuration, RegisterAccess, SmoothingConfig, MAX_SCRIPT_LEN};
use crate::console::ConsoleLog;
use crate::guard::{AdminGuard, GuardError, SharedState};
use crate::modbus::StoreError;

#[derive(Debug, Error)]
pub enum AdminError {
    #[error(transparent)]
    Busy(#[from] GuardError),

    #[error("invalid configuration: {0:#}")]
    InvalidConfig(anyhow::Error),

    #[error("script too long ({length} characters, max {max})")]
    ScriptTooLong { length: usize, max: usize },

    #[error("register {0} not configured")]
    UnknownRegister(RegisterIndex),

    #[error("write rejected: {0}")]
    Write(#[from] WriteError),

    #[error("failed to persist configuration: {0:#}")]
    Persist(anyhow::Error),
}

/// One register from a manual read pass
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterReading {
    pub index: RegisterIndex,
    pub device: String,
    pub address: u16,
    /// Raw value from the bus, or why it could not be read
    pub raw: Result<u32, StoreError>,
    /// Converted value of a successful read
    pub value: Option<f64>,
}

/// One register as the script currently sees it
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterVariable {
    pub index: RegisterIndex,
    pub device: String,
    pub address: u16,
    pub name: Option<String>,
    /// Cached raw value from the last read or write
    pub raw: u32,
    /// Converted value, from the smoothing estimate when one exists
    pub value: f64,
    pub smoothing: bool,
    pub output: bool,
    pub read_only: bool,
}

pub struct AdminService {
    shared: Arc<SharedState>,
    store: Arc<dyn ConfigStore>,
    console: Arc<ConsoleLog>,
    manual_read_timeout: Duration,
}

impl AdminService {
    pub fn new(
        shared: Arc<SharedState>,
        store: Arc<dyn ConfigStore>,
        console: Arc<ConsoleLog>,
        manual_read_timeout: Duration,
    ) -> Self {
        Self {
            shared,
            store,
            console,
            manual_read_timeout,
        }
    }

    /// Persist the live configuration
    fn persist(&self) -> Result<(), AdminError> {
        let config = self.shared.lock().read(|ws| ws.config.clone());
        self.store.save(&config).map_err(AdminError::Persist)
    }

    /// Persist, or put back `previous` when the save fails
    ///
    /// Must be called with the admin guard held so nothing observes the
    /// unsaved state in between.
    fn persist_or_restore(
        &self,
        guard: &AdminGuard<'_>,
        previous: (Configuration, SmoothingBank),
    ) -> Result<(), AdminError> {
        if let Err(e) = self.persist() {
            warn!("{}, restoring previous configuration", e);
            let (config, filters) = previous;
            guard.write(|ws| {
                ws.config = config;
                ws.filters = filters;
            });
            return Err(e);
        }
        Ok(())
    }

    fn snapshot(guard: &AdminGuard<'_>) -> (Configuration, SmoothingBank) {
        guard.read(|ws| (ws.config.clone(), ws.filters.clone()))
    }

    /// Replace the whole configuration and persist it
    ///
    /// On a persistence failure the live configuration is left unchanged.
    pub fn save_configuration(&self, mut config: Configuration) -> Result<(), AdminError> {
        config.sanitize();
        config.validate().map_err(AdminError::InvalidConfig)?;

        let guard = self.shared.try_acquire_admin()?;
        let previous = Self::snapshot(&guard);
        guard.write(|ws| ws.replace_config(config));
        self.persist_or_restore(&guard, previous)?;
        drop(guard);

        info!("Configuration replaced and saved");
        Ok(())
    }

    /// Replace the configuration from YAML text
    pub fn import_configuration(&self, yaml: &str) -> Result<(), AdminError> {
        let config = Configuration::from_yaml(yaml).map_err(AdminError::InvalidConfig)?;
        self.save_configuration(config)
    }

    /// Current configuration as YAML
    pub fn export_configuration(&self) -> Result<String, AdminError> {
        let guard = self
            .shared
            .try_lock_for(self.manual_read_timeout)
            .ok_or(GuardError::Busy)?;
        guard
            .read(|ws| ws.config.to_yaml())
            .map_err(AdminError::InvalidConfig)
    }

    /// Restore and persist the defaults
    pub fn reset_configuration(&self) -> Result<(), AdminError> {
        warn!("Resetting configuration to defaults");
        self.save_configuration(Configuration::default())
    }

    /// Replace the calculation script
    pub fn update_script(&self, script: &str) -> Result<(), AdminError> {
        if script.len() > MAX_SCRIPT_LEN {
            return Err(AdminError::ScriptTooLong {
                length: script.len(),
                max: MAX_SCRIPT_LEN,
            });
        }

        let guard = self.shared.try_acquire_admin()?;
        let previous = Self::snapshot(&guard);
        guard.write(|ws| ws.config.calculation.script = script.to_string());
        self.persist_or_restore(&guard, previous)?;
        drop(guard);

        info!(length = script.len(), "Calculation script updated");
        Ok(())
    }

    /// Change smoothing parameters of one register
    ///
    /// Disabling drops the estimator state so a later enable starts fresh.
    pub fn set_smoothing(
        &self,
        index: RegisterIndex,
        params: SmoothingConfig,
    ) -> Result<(), AdminError> {
        let params = SmoothingConfig {
            enabled: params.enabled,
            q: sanitize_q(params.q),
            r: sanitize_r(params.r),
        };

        let guard = self.shared.try_acquire_admin()?;
        let previous = Self::snapshot(&guard);
        guard.write(|ws| {
            let register = ws
                .config
                .devices
                .get_mut(index.device)
                .and_then(|d| d.registers.get_mut(index.register))
                .ok_or(AdminError::UnknownRegister(index))?;

            register.smoothing = params;
            if !params.enabled {
                ws.filters.reset(index);
            }
            Ok::<_, AdminError>(())
        })?;
        self.persist_or_restore(&guard, previous)?;
        drop(guard);

        info!(
            register = %index,
            enabled = params.enabled,
            q = params.q,
            r = params.r,
            "Smoothing updated"
        );
        Ok(())
    }

    /// Write an engineering value to one register; returns the raw value
    pub fn write_value(&self, index: RegisterIndex, value: f64) -> Result<u32, AdminError> {
        let guard = self.shared.try_acquire_admin()?;
        let raw = guard.write(|ws| write_engineering_value(ws, index, value))?;

        info!(register = %index, value, raw, "Manual write");
        Ok(raw)
    }

    /// Read every readable register of the enabled devices
    pub fn read_registers(&self) -> Result<Vec<RegisterReading>, AdminError> {
        let guard = self
            .shared
            .try_lock_for(self.manual_read_timeout)
            .ok_or(GuardError::Busy)?;

        let readings = guard.write(|ws| {
            let mut readings = Vec::new();
            for (d, device) in ws.config.devices.iter_mut().enumerate() {
                if !device.enabled {
                    continue;
                }
                for (r, register) in device.registers.iter_mut().enumerate() {
                    if register.access == RegisterAccess::Write {
                        continue;
                    }

                    let raw = ws
                        .store
                        .read_registers(device.slave_id, register.address, register.kind, register.span)
                        .map(|words| combine_words(register, &words));

                    if let Ok(raw) = raw {
                        register.raw = raw;
                    }
                    readings.push(RegisterReading {
                        index: RegisterIndex::new(d, r),
                        device: device.name.clone(),
                        address: register.address,
                        value: raw.ok().map(|raw| register.to_engineering(raw as f64)),
                        raw,
                    });
                }
            }
            readings
        });

        Ok(readings)
    }

    /// Every configured register with the value expressions currently see
    ///
    /// Served from the cache; no bus traffic.
    pub fn variables(&self) -> Result<Vec<RegisterVariable>, AdminError> {
        let guard = self
            .shared
            .try_lock_for(self.manual_read_timeout)
            .ok_or(GuardError::Busy)?;

        let variables = guard.read(|ws| {
            let snapshot = DeviceSnapshot::build(&ws.config.devices, &ws.filters);
            let mut variables = Vec::with_capacity(ws.config.register_count());
            for (d, device) in ws.config.devices.iter().enumerate() {
                for (r, register) in device.registers.iter().enumerate() {
                    let index = RegisterIndex::new(d, r);
                    variables.push(RegisterVariable {
                        index,
                        device: device.name.clone(),
                        address: register.address,
                        name: register.name.clone(),
                        raw: register.raw,
                        value: snapshot
                            .get(index)
                            .unwrap_or_else(|| register.to_engineering(register.raw as f64)),
                        smoothing: register.smoothing.enabled,
                        output: register.output,
                        read_only: register.is_read_only(),
                    });
                }
            }
            variables
        });

        Ok(variables)
    }

    /// Evaluate a script against current values without side effects
    pub fn test_calculation(&self, script: &str) -> Result<Vec<LineReport>, AdminError> {
        if script.len() > MAX_SCRIPT_LEN {
            return Err(AdminError::ScriptTooLong {
                length: script.len(),
                max: MAX_SCRIPT_LEN,
            });
        }

        let guard = self
            .shared
            .try_lock_for(self.manual_read_timeout)
            .ok_or(GuardError::Busy)?;
        Ok(guard.read(|ws| test_script(ws, script)))
    }

    /// Reload the persisted configuration
    ///
    /// The file is read with the guard held so a concurrent save cannot be
    /// overwritten by older contents.
    pub fn reload_from_persistence(&self) -> Result<(), AdminError> {
        let guard = self.shared.try_acquire_admin()?;
        let config = self.store.load().map_err(AdminError::InvalidConfig)?;
        guard.write(|ws| ws.replace_config(config));
        drop(guard);

        info!("Configuration reloaded from persistence");
        Ok(())
    }

    /// Recent diagnostic console lines, oldest first
    pub fn console_history(&self) -> Vec<String> {
        self.console.recent()
    }

    /// Reload the configuration each time a request arrives
    pub async fn serve_reload_requests(self: Arc<Self>, mut requests: mpsc::Receiver<()>) {
        while requests.recv().await.is_some() {
            let admin = self.clone();
            match tokio::task::spawn_blocking(move || admin.reload_from_persistence()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Configuration reload failed: {}", e),
                Err(e) => error!("Configuration reload task failed: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceConfig, RegisterConfig, RegisterKind, YamlConfigStore};
    use crate::console::DiagnosticSink;
    use crate::guard::{GuardTiming, Workspace};
    use crate::modbus::SimulatedStore;
    use std::thread;
    use tempfile::TempDir;

    struct Fixture {
        admin: AdminService,
        shared: Arc<SharedState>,
        bus: SimulatedStore,
        files: YamlConfigStore,
        console: Arc<ConsoleLog>,
        _dir: TempDir,
    }

    fn sample_config() -> Configuration {
        let mut config = Configuration::default();
        config.bus.inter_register_delay_ms = 0;
        config.devices.push(DeviceConfig {
            name: "boiler".to_string(),
            slave_id: 3,
            enabled: true,
            registers: vec![
                RegisterConfig {
                    address: 100,
                    kind: RegisterKind::Input,
                    gain: 0.1,
                    ..RegisterConfig::default()
                },
                RegisterConfig {
                    address: 200,
                    gain: 0.5,
                    offset: 10.0,
                    ..RegisterConfig::default()
                },
                RegisterConfig {
                    address: 300,
                    access: RegisterAccess::Write,
                    ..RegisterConfig::default()
                },
            ],
        });
        config
    }

    fn fixture(timing: GuardTiming) -> Fixture {
        let dir = TempDir::new().unwrap();
        let files = YamlConfigStore::new(dir.path().join("config.yaml"));
        let config = sample_config();
        files.save(&config).unwrap();

        let bus = SimulatedStore::new();
        let shared = Arc::new(SharedState::new(
            Workspace::new(config, Box::new(bus.clone())),
            timing,
        ));
        let console = Arc::new(ConsoleLog::new());
        let admin = AdminService::new(
            shared.clone(),
            Arc::new(files.clone()),
            console.clone(),
            Duration::from_millis(200),
        );

        Fixture {
            admin,
            shared,
            bus,
            files,
            console,
            _dir: dir,
        }
    }

    fn fast_timing() -> GuardTiming {
        GuardTiming {
            cycle_wait: Duration::from_millis(50),
            lock_timeout: Duration::from_millis(20),
        }
    }

    #[test]
    fn test_update_script_persists() {
        let f = fixture(GuardTiming::default());

        f.admin.update_script("{d[0][1]} = 20").unwrap();

        let live = f.shared.lock().read(|ws| ws.config.calculation.script.clone());
        assert_eq!(live, "{d[0][1]} = 20");
        assert_eq!(f.files.load().unwrap().calculation.script, "{d[0][1]} = 20");
    }

    #[test]
    fn test_update_script_length_checked() {
        let f = fixture(GuardTiming::default());
        let long = "x".repeat(MAX_SCRIPT_LEN + 1);

        let err = f.admin.update_script(&long).unwrap_err();

        assert!(matches!(err, AdminError::ScriptTooLong { max: MAX_SCRIPT_LEN, .. }));
        assert!(f.files.load().unwrap().calculation.script.is_empty());
    }

    #[test]
    fn test_busy_while_cycle_holds_lock() {
        let f = fixture(fast_timing());
        let shared = f.shared.clone();
        let (tx, rx) = std::sync::mpsc::channel();

        let cycle = thread::spawn(move || {
            let _guard = shared.lock_for_cycle();
            tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(400));
        });
        rx.recv().unwrap();

        let err = f.admin.update_script("a = 1").unwrap_err();
        assert!(matches!(err, AdminError::Busy(GuardError::Busy)));
        assert_eq!(err.to_string(), "system busy, try again");
        assert!(f.files.load().unwrap().calculation.script.is_empty());

        cycle.join().unwrap();
        f.admin.update_script("a = 1").unwrap();
        assert!(!f.shared.pause_requested());
    }

    #[test]
    fn test_import_invalid_keeps_config() {
        let f = fixture(GuardTiming::default());

        let err = f.admin.import_configuration("devices: [").unwrap_err();

        assert!(matches!(err, AdminError::InvalidConfig(_)));
        assert_eq!(f.shared.lock().read(|ws| ws.config.devices.len()), 1);
    }

    #[test]
    fn test_import_replaces_config_and_resets_smoothing() {
        let f = fixture(GuardTiming::default());
        let index = RegisterIndex::new(0, 0);
        f.shared
            .lock()
            .write(|ws| ws.filters.update(index, 10.0, 0.01, 0.1));

        let yaml = r#"
devices:
  - name: pump
    slave_id: 7
    registers:
      - address: 1
        output: true
calculation:
  script: "4 * 2"
"#;
        f.admin.import_configuration(yaml).unwrap();

        f.shared.lock().read(|ws| {
            assert_eq!(ws.config.devices[0].name, "pump");
            assert_eq!(ws.config.calculation.script, "4 * 2");
            assert!(ws.filters.is_empty());
        });
        assert_eq!(f.files.load().unwrap().devices[0].slave_id, 7);
    }

    #[test]
    fn test_export_then_import() {
        let f = fixture(GuardTiming::default());

        let yaml = f.admin.export_configuration().unwrap();
        f.admin.reset_configuration().unwrap();
        assert!(f.shared.lock().read(|ws| ws.config.devices.is_empty()));

        f.admin.import_configuration(&yaml).unwrap();
        assert_eq!(f.shared.lock().read(|ws| ws.config.clone()), sample_config());
    }

    #[test]
    fn test_reset_configuration() {
        let f = fixture(GuardTiming::default());

        f.admin.reset_configuration().unwrap();

        assert_eq!(f.files.load().unwrap(), Configuration::default());
    }

    #[test]
    fn test_set_smoothing() {
        let f = fixture(GuardTiming::default());
        let index = RegisterIndex::new(0, 0);

        f.admin
            .set_smoothing(
                index,
                SmoothingConfig {
                    enabled: true,
                    q: -1.0,
                    r: 0.5,
                },
            )
            .unwrap();
        f.shared
            .lock()
            .write(|ws| ws.filters.update(index, 10.0, 0.01, 0.5));

        let saved = f.files.load().unwrap().devices[0].registers[0].smoothing;
        assert!(saved.enabled);
        assert_eq!(saved.q, sanitize_q(-1.0));
        assert_eq!(saved.r, 0.5);

        f.admin
            .set_smoothing(index, SmoothingConfig::default())
            .unwrap();
        assert_eq!(f.shared.lock().read(|ws| ws.filters.estimate(index)), None);
    }

    #[test]
    fn test_set_smoothing_unknown_register() {
        let f = fixture(GuardTiming::default());

        let err = f
            .admin
            .set_smoothing(RegisterIndex::new(0, 9), SmoothingConfig::default())
            .unwrap_err();

        assert!(matches!(err, AdminError::UnknownRegister(_)));
        assert!(!f.shared.pause_requested());
    }

    #[test]
    fn test_write_value() {
        let f = fixture(GuardTiming::default());

        // (60 - 10) / 0.5
        let raw = f.admin.write_value(RegisterIndex::new(0, 1), 60.0).unwrap();

        assert_eq!(raw, 100);
        assert_eq!(f.bus.register(3, 200), Some(100));
    }

    #[test]
    fn test_write_value_rejected() {
        let f = fixture(GuardTiming::default());

        let err = f
            .admin
            .write_value(RegisterIndex::new(0, 0), 1.0)
            .unwrap_err();
        assert!(matches!(err, AdminError::Write(WriteError::ReadOnly(100))));

        f.bus.fail_register(3, 200, StoreError::IllegalAddress);
        let err = f
            .admin
            .write_value(RegisterIndex::new(0, 1), 20.0)
            .unwrap_err();
        assert!(matches!(
            err,
            AdminError::Write(WriteError::Store(StoreError::IllegalAddress))
        ));
    }

    #[test]
    fn test_read_registers() {
        let f = fixture(GuardTiming::default());
        f.bus.set_register(3, 100, 215);
        f.bus.fail_register(3, 200, StoreError::Timeout);

        let readings = f.admin.read_registers().unwrap();

        // write-only register is skipped
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[0].raw, Ok(215));
        assert!((readings[0].value.unwrap() - 21.5).abs() < 1e-9);
        assert_eq!(readings[0].device, "boiler");
        assert_eq!(readings[1].raw, Err(StoreError::Timeout));
        assert_eq!(readings[1].value, None);

        let cached = f.shared.lock().read(|ws| ws.config.devices[0].registers[0].raw);
        assert_eq!(cached, 215);
    }

    #[test]
    fn test_read_registers_busy() {
        let f = fixture(GuardTiming::default());
        let shared = f.shared.clone();
        let (tx, rx) = std::sync::mpsc::channel();

        let holder = thread::spawn(move || {
            let _guard = shared.lock();
            tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(500));
        });
        rx.recv().unwrap();

        assert!(matches!(f.admin.read_registers(), Err(AdminError::Busy(_))));
        holder.join().unwrap();
    }

    #[test]
    fn test_calculation_dry_run() {
        let f = fixture(GuardTiming::default());
        f.shared
            .lock()
            .write(|ws| ws.config.devices[0].registers[0].raw = 500);

        let lines = f
            .admin
            .test_calculation("{d[0][1]} = {d[0][0]} + 10")
            .unwrap();

        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].substituted.as_deref(), Some("50 + 10"));
        // (60 - 10) / 0.5
        assert!(matches!(
            lines[0].status,
            crate::calc::LineStatus::Value { raw: Some(100), .. }
        ));
        assert!(f.bus.writes().is_empty());
    }

    #[test]
    fn test_reload_from_persistence() {
        let f = fixture(GuardTiming::default());
        let mut edited = sample_config();
        edited.calculation.script = "y = 2".to_string();
        f.files.save(&edited).unwrap();

        f.admin.reload_from_persistence().unwrap();

        let script = f.shared.lock().read(|ws| ws.config.calculation.script.clone());
        assert_eq!(script, "y = 2");
    }

    #[tokio::test]
    async fn test_reload_requests() {
        let Fixture {
            admin,
            shared,
            files,
            _dir,
            ..
        } = fixture(GuardTiming::default());
        let mut edited = sample_config();
        edited.devices[0].enabled = false;
        files.save(&edited).unwrap();

        let (tx, rx) = mpsc::channel(1);
        let listener = tokio::spawn(Arc::new(admin).serve_reload_requests(rx));
        tx.send(()).await.unwrap();
        drop(tx);
        listener.await.unwrap();

        assert!(!shared.lock().read(|ws| ws.config.devices[0].enabled));
    }

    #[test]
    fn test_console_history() {
        let f = fixture(GuardTiming::default());
        f.console.log("[line 1] a = 1 = 1\n");

        assert_eq!(f.admin.console_history(), vec!["[line 1] a = 1 = 1\n"]);
    }

    /// Delegates to a YAML file and runs a hook in the middle of `load`
    struct InterleavedStore {
        files: YamlConfigStore,
        on_load: parking_lot::Mutex<Option<Box<dyn FnOnce() + Send>>>,
    }

    impl ConfigStore for InterleavedStore {
        fn load(&self) -> anyhow::Result<Configuration> {
            let config = self.files.load()?;
            if let Some(hook) = self.on_load.lock().take() {
                hook();
            }
            Ok(config)
        }

        fn save(&self, config: &Configuration) -> anyhow::Result<()> {
            self.files.save(config)
        }
    }

    #[test]
    fn test_reload_blocks_concurrent_save() {
        let f = fixture(fast_timing());
        f.admin.update_script("OLD = 1").unwrap();

        let writer = Arc::new(AdminService::new(
            f.shared.clone(),
            Arc::new(f.files.clone()),
            f.console.clone(),
            Duration::from_millis(200),
        ));
        let (tx, rx) = std::sync::mpsc::channel();
        let hook: Box<dyn FnOnce() + Send> = Box::new(move || {
            let result = thread::spawn(move || writer.update_script("NEW = 1"))
                .join()
                .unwrap();
            tx.send(result).unwrap();
        });
        let reloader = AdminService::new(
            f.shared.clone(),
            Arc::new(InterleavedStore {
                files: f.files.clone(),
                on_load: parking_lot::Mutex::new(Some(hook)),
            }),
            f.console.clone(),
            Duration::from_millis(200),
        );

        reloader.reload_from_persistence().unwrap();

        let concurrent = rx.recv().unwrap();
        assert!(matches!(concurrent, Err(AdminError::Busy(GuardError::Busy))));
        let live = f.shared.lock().read(|ws| ws.config.calculation.script.clone());
        let disk = f.files.load().unwrap().calculation.script;
        assert_eq!(live, disk);
        assert_eq!(live, "OLD = 1");
    }

    struct ReadOnlyDisk;

    impl ConfigStore for ReadOnlyDisk {
        fn load(&self) -> anyhow::Result<Configuration> {
            Ok(Configuration::default())
        }

        fn save(&self, _config: &Configuration) -> anyhow::Result<()> {
            anyhow::bail!("read-only file system")
        }
    }

    #[test]
    fn test_failed_persist_restores_previous_state() {
        let shared = Arc::new(SharedState::new(
            Workspace::new(sample_config(), Box::new(SimulatedStore::new())),
            GuardTiming::default(),
        ));
        let admin = AdminService::new(
            shared.clone(),
            Arc::new(ReadOnlyDisk),
            Arc::new(ConsoleLog::new()),
            Duration::from_millis(200),
        );
        let index = RegisterIndex::new(0, 1);
        shared
            .lock()
            .write(|ws| ws.filters.update(index, 40.0, 0.01, 0.1));

        let err = admin
            .save_configuration(Configuration::default())
            .unwrap_err();
        assert!(matches!(err, AdminError::Persist(_)));
        assert!(err.to_string().contains("read-only file system"));

        let err = admin.update_script("a = 1").unwrap_err();
        assert!(matches!(err, AdminError::Persist(_)));

        let err = admin
            .set_smoothing(index, SmoothingConfig::default())
            .unwrap_err();
        assert!(matches!(err, AdminError::Persist(_)));

        shared.lock().read(|ws| {
            assert_eq!(ws.config, sample_config());
            assert_eq!(ws.filters.estimate(index), Some(40.0));
        });
        assert!(!shared.pause_requested());
    }

    #[test]
    fn test_variables_report_smoothed_value() {
        let f = fixture(GuardTiming::default());
        let index = RegisterIndex::new(0, 1);
        f.shared.lock().write(|ws| {
            let register = &mut ws.config.devices[0].registers[1];
            register.smoothing.enabled = true;
            register.name = Some("temp".to_string());
            register.raw = 100;
            ws.filters.update(index, 80.0, 0.01, 0.1);
        });

        let variables = f.admin.variables().unwrap();

        assert_eq!(variables.len(), 3);
        let temp = &variables[1];
        assert_eq!(temp.index, index);
        assert_eq!(temp.name.as_deref(), Some("temp"));
        assert_eq!(temp.raw, 100);
        // estimate 80, not the cached 100: 80 * 0.5 + 10
        assert!((temp.value - 50.0).abs() < 1e-9);
        assert!(temp.smoothing);
        assert!(!temp.read_only);

        assert!(variables[0].read_only);
        assert!((variables[0].value - 0.0).abs() < 1e-9);
        assert_eq!(variables[2].device, "boiler");
        assert_eq!(f.bus.read_count(), 0);
    }
}
