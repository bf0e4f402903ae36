//! Device database
//!
//! `start_mxdb` opens a [`DeviceDatabase`] through a [`DeviceProvider`]. The
//! database maps device names to capability trait objects, one map per
//! capability, and knows which binary outputs are shutters and which one is
//! the software trigger line.
//!
//! [`SimulatedProvider`] builds mock devices from [`DeviceDefinition`]s, read
//! either from the `devices` section of the application config or from a TOML
//! database file:
//!
//! ```toml
//! [[devices]]
//! kind = "axis"
//! name = "m1"
//! speed = 50.0
//!
//! [[devices]]
//! kind = "scaler"
//! name = "i0"
//! axis = "m1"
//! center = 1.0
//! sigma = 0.2
//! ```
//!
//! Built beamlines are cached per path: the simulated hardware outlives the
//! worker that opened it, exactly like real devices outlive a worker process.

use crate::error::{ScanError, ScanResult};
use crate::hardware::capabilities::{
    Axis, BinaryOutput, Detector, PulseGenerator, Scaler, Timer,
};
use crate::hardware::mock::{
    BeamProfile, MockAxis, MockBinaryOutput, MockDetector, MockPulseGenerator, MockScaler,
    MockTimer,
};
use async_trait::async_trait;
use figment::{
    providers::{Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

/// Role of a binary output in the scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputRole {
    /// Beam shutter opened for the duration of a sweep
    Shutter,
    /// Software trigger line that starts pulse-generator bursts
    Trigger,
}

/// One simulated device in a database file or the config `devices` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceDefinition {
    /// Motor axis
    Axis {
        /// Device name
        name: String,
        /// Initial position
        #[serde(default)]
        position: f64,
        /// Travel speed (units/s); instantaneous when absent
        #[serde(default)]
        speed: Option<f64>,
        /// Settling time after each move
        #[serde(default)]
        settle_ms: u64,
        /// Lower soft limit
        #[serde(default)]
        low_limit: Option<f64>,
        /// Upper soft limit
        #[serde(default)]
        high_limit: Option<f64>,
    },
    /// Counting gate
    Timer {
        /// Device name
        name: String,
    },
    /// Counter channel
    Scaler {
        /// Device name
        name: String,
        /// Axis the simulated peak follows; constant rate when absent
        #[serde(default)]
        axis: Option<String>,
        /// Peak center on `axis`
        #[serde(default)]
        center: f64,
        /// Peak sigma on `axis`
        #[serde(default = "default_sigma")]
        sigma: f64,
        /// Second axis for 2D maps
        #[serde(default)]
        axis2: Option<String>,
        /// Peak center on `axis2`
        #[serde(default)]
        center2: f64,
        /// Peak sigma on `axis2`
        #[serde(default = "default_sigma")]
        sigma2: f64,
        /// Peak count
        #[serde(default = "default_amplitude")]
        amplitude: f64,
        /// Background count (also the constant rate without an axis)
        #[serde(default)]
        background: f64,
        /// Uniform noise width
        #[serde(default)]
        noise: f64,
        /// Noise seed
        #[serde(default)]
        seed: u64,
    },
    /// Area detector
    Detector {
        /// Device name
        name: String,
    },
    /// Four-channel burst generator
    PulseGenerator {
        /// Device name
        name: String,
        /// Detector whose trigger input the generator drives
        #[serde(default)]
        detector: Option<String>,
    },
    /// Shutter or trigger line
    BinaryOutput {
        /// Device name
        name: String,
        /// What the output is used for
        role: OutputRole,
        /// Pulse generator fired by this line (trigger role)
        #[serde(default)]
        generator: Option<String>,
    },
}

fn default_sigma() -> f64 {
    1.0
}

fn default_amplitude() -> f64 {
    1000.0
}

impl DeviceDefinition {
    /// Device name
    pub fn name(&self) -> &str {
        match self {
            DeviceDefinition::Axis { name, .. }
            | DeviceDefinition::Timer { name }
            | DeviceDefinition::Scaler { name, .. }
            | DeviceDefinition::Detector { name }
            | DeviceDefinition::PulseGenerator { name, .. }
            | DeviceDefinition::BinaryOutput { name, .. } => name,
        }
    }

    /// The demonstration beamline used when nothing else is configured:
    /// two axes, a timer, a peaked and a flat scaler, a detector with its
    /// pulse generator and trigger line, and one shutter.
    pub fn demo_beamline() -> Vec<DeviceDefinition> {
        vec![
            DeviceDefinition::Axis {
                name: "m1".into(),
                position: 0.0,
                speed: Some(200.0),
                settle_ms: 0,
                low_limit: Some(-100.0),
                high_limit: Some(100.0),
            },
            DeviceDefinition::Axis {
                name: "m2".into(),
                position: 0.0,
                speed: Some(200.0),
                settle_ms: 0,
                low_limit: Some(-100.0),
                high_limit: Some(100.0),
            },
            DeviceDefinition::Timer { name: "t1".into() },
            DeviceDefinition::Scaler {
                name: "i0".into(),
                axis: Some("m1".into()),
                center: 1.0,
                sigma: 0.3,
                axis2: Some("m2".into()),
                center2: 0.0,
                sigma2: 5.0,
                amplitude: 1000.0,
                background: 10.0,
                noise: 0.0,
                seed: 0,
            },
            DeviceDefinition::Scaler {
                name: "i1".into(),
                axis: None,
                center: 0.0,
                sigma: 1.0,
                axis2: None,
                center2: 0.0,
                sigma2: 1.0,
                amplitude: 0.0,
                background: 100.0,
                noise: 0.0,
                seed: 0,
            },
            DeviceDefinition::Detector {
                name: "det1".into(),
            },
            DeviceDefinition::PulseGenerator {
                name: "pg1".into(),
                detector: Some("det1".into()),
            },
            DeviceDefinition::BinaryOutput {
                name: "trig".into(),
                role: OutputRole::Trigger,
                generator: Some("pg1".into()),
            },
            DeviceDefinition::BinaryOutput {
                name: "sh1".into(),
                role: OutputRole::Shutter,
                generator: None,
            },
        ]
    }
}

/// Device names per capability, as returned by `get_devices`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceInventory {
    /// Motor axes
    pub axes: Vec<String>,
    /// Counting gates
    pub timers: Vec<String>,
    /// Counter channels
    pub scalers: Vec<String>,
    /// Area detectors
    pub detectors: Vec<String>,
    /// Burst generators
    pub pulse_generators: Vec<String>,
    /// Shutters
    pub shutters: Vec<String>,
}

/// Name-to-capability lookup for one opened device database
#[derive(Clone, Default)]
pub struct DeviceDatabase {
    axes: BTreeMap<String, Arc<dyn Axis>>,
    timers: BTreeMap<String, Arc<dyn Timer>>,
    scalers: BTreeMap<String, Arc<dyn Scaler>>,
    detectors: BTreeMap<String, Arc<dyn Detector>>,
    pulse_generators: BTreeMap<String, Arc<dyn PulseGenerator>>,
    outputs: BTreeMap<String, Arc<dyn BinaryOutput>>,
    shutters: Vec<String>,
    trigger_line: Option<String>,
}

fn lookup<T: ?Sized>(map: &BTreeMap<String, Arc<T>>, name: &str) -> ScanResult<Arc<T>> {
    map.get(name)
        .cloned()
        .ok_or_else(|| ScanError::DeviceNotFound(name.to_string()))
}

impl DeviceDatabase {
    /// Empty database
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an axis
    pub fn with_axis(mut self, name: &str, axis: Arc<dyn Axis>) -> Self {
        self.axes.insert(name.to_string(), axis);
        self
    }

    /// Register a timer
    pub fn with_timer(mut self, name: &str, timer: Arc<dyn Timer>) -> Self {
        self.timers.insert(name.to_string(), timer);
        self
    }

    /// Register a scaler
    pub fn with_scaler(mut self, name: &str, scaler: Arc<dyn Scaler>) -> Self {
        self.scalers.insert(name.to_string(), scaler);
        self
    }

    /// Register a detector
    pub fn with_detector(mut self, name: &str, detector: Arc<dyn Detector>) -> Self {
        self.detectors.insert(name.to_string(), detector);
        self
    }

    /// Register a pulse generator
    pub fn with_pulse_generator(mut self, name: &str, generator: Arc<dyn PulseGenerator>) -> Self {
        self.pulse_generators.insert(name.to_string(), generator);
        self
    }

    /// Register a binary output in the given role
    pub fn with_output(
        mut self,
        name: &str,
        role: OutputRole,
        output: Arc<dyn BinaryOutput>,
    ) -> Self {
        self.outputs.insert(name.to_string(), output);
        match role {
            OutputRole::Shutter => self.shutters.push(name.to_string()),
            OutputRole::Trigger => {
                if self.trigger_line.is_none() {
                    self.trigger_line = Some(name.to_string());
                }
            }
        }
        self
    }

    /// Look up an axis
    pub fn axis(&self, name: &str) -> ScanResult<Arc<dyn Axis>> {
        lookup(&self.axes, name)
    }

    /// Look up a timer
    pub fn timer(&self, name: &str) -> ScanResult<Arc<dyn Timer>> {
        lookup(&self.timers, name)
    }

    /// Look up a scaler
    pub fn scaler(&self, name: &str) -> ScanResult<Arc<dyn Scaler>> {
        lookup(&self.scalers, name)
    }

    /// Look up a detector
    pub fn detector(&self, name: &str) -> ScanResult<Arc<dyn Detector>> {
        lookup(&self.detectors, name)
    }

    /// All shutter outputs
    pub fn shutters(&self) -> Vec<(String, Arc<dyn BinaryOutput>)> {
        self.shutters
            .iter()
            .filter_map(|name| self.outputs.get(name).map(|o| (name.clone(), o.clone())))
            .collect()
    }

    /// The pulse generator and trigger line used for detector scans
    pub fn trigger_hardware(&self) -> ScanResult<(Arc<dyn PulseGenerator>, Arc<dyn BinaryOutput>)> {
        let generator = self
            .pulse_generators
            .values()
            .next()
            .cloned()
            .ok_or_else(|| ScanError::DeviceNotFound("pulse generator".to_string()))?;
        let line = self
            .trigger_line
            .as_ref()
            .and_then(|name| self.outputs.get(name))
            .cloned()
            .ok_or_else(|| ScanError::DeviceNotFound("trigger line".to_string()))?;
        Ok((generator, line))
    }

    /// Names of every device, per capability
    pub fn inventory(&self) -> DeviceInventory {
        DeviceInventory {
            axes: self.axes.keys().cloned().collect(),
            timers: self.timers.keys().cloned().collect(),
            scalers: self.scalers.keys().cloned().collect(),
            detectors: self.detectors.keys().cloned().collect(),
            pulse_generators: self.pulse_generators.keys().cloned().collect(),
            shutters: self.shutters.clone(),
        }
    }
}

/// Concrete simulated devices, kept so tests can inspect them
#[derive(Clone, Default)]
pub struct SimulatedBeamline {
    /// Axes by name
    pub axes: HashMap<String, Arc<MockAxis>>,
    /// Timers by name
    pub timers: HashMap<String, Arc<MockTimer>>,
    /// Scalers by name
    pub scalers: HashMap<String, Arc<MockScaler>>,
    /// Detectors by name
    pub detectors: HashMap<String, Arc<MockDetector>>,
    /// Pulse generators by name
    pub pulse_generators: HashMap<String, Arc<MockPulseGenerator>>,
    /// Binary outputs by name, with their role
    pub outputs: HashMap<String, (OutputRole, Arc<MockBinaryOutput>)>,
}

impl SimulatedBeamline {
    /// Build mock devices from definitions
    ///
    /// Devices are built in dependency order (axes, detectors, generators,
    /// outputs, then scalers), so definitions may appear in any order. A
    /// reference to an unknown device is an error.
    pub fn build(definitions: &[DeviceDefinition]) -> ScanResult<Self> {
        let mut beamline = SimulatedBeamline::default();

        for def in definitions {
            match def {
                DeviceDefinition::Axis {
                    name,
                    position,
                    speed,
                    settle_ms,
                    low_limit,
                    high_limit,
                } => {
                    let mut axis = MockAxis::new(name, *position)
                        .with_settle(Duration::from_millis(*settle_ms))
                        .with_limits(
                            low_limit.unwrap_or(f64::NEG_INFINITY),
                            high_limit.unwrap_or(f64::INFINITY),
                        );
                    if let Some(speed) = speed {
                        axis = axis.with_speed(*speed);
                    }
                    beamline.axes.insert(name.clone(), Arc::new(axis));
                }
                DeviceDefinition::Timer { name } => {
                    beamline
                        .timers
                        .insert(name.clone(), Arc::new(MockTimer::new()));
                }
                DeviceDefinition::Detector { name } => {
                    beamline
                        .detectors
                        .insert(name.clone(), Arc::new(MockDetector::new()));
                }
                _ => {}
            }
        }

        for def in definitions {
            if let DeviceDefinition::PulseGenerator { name, detector } = def {
                let mut generator = MockPulseGenerator::new();
                if let Some(det) = detector {
                    let det = beamline
                        .detectors
                        .get(det)
                        .ok_or_else(|| ScanError::DeviceNotFound(det.clone()))?;
                    generator = generator.with_detector(det.clone());
                }
                beamline
                    .pulse_generators
                    .insert(name.clone(), Arc::new(generator));
            }
        }

        for def in definitions {
            match def {
                DeviceDefinition::BinaryOutput {
                    name,
                    role,
                    generator,
                } => {
                    let mut output = MockBinaryOutput::new();
                    if let Some(gen) = generator {
                        let gen = beamline
                            .pulse_generators
                            .get(gen)
                            .ok_or_else(|| ScanError::DeviceNotFound(gen.clone()))?;
                        output = output.with_generator(gen.clone());
                    }
                    beamline
                        .outputs
                        .insert(name.clone(), (*role, Arc::new(output)));
                }
                DeviceDefinition::Scaler {
                    name,
                    axis,
                    center,
                    sigma,
                    axis2,
                    center2,
                    sigma2,
                    amplitude,
                    background,
                    noise,
                    seed,
                } => {
                    let scaler = match axis {
                        Some(axis) => {
                            let axis = beamline.find_axis(axis)?;
                            let axis2 = match axis2 {
                                Some(a2) => Some((beamline.find_axis(a2)?, *center2, *sigma2)),
                                None => None,
                            };
                            MockScaler::with_profile(BeamProfile {
                                axis,
                                center: *center,
                                sigma: *sigma,
                                axis2,
                                amplitude: *amplitude,
                                background: *background,
                            })
                        }
                        None => MockScaler::constant(*background),
                    };
                    beamline
                        .scalers
                        .insert(name.clone(), Arc::new(scaler.with_noise(*noise, *seed)));
                }
                _ => {}
            }
        }

        Ok(beamline)
    }

    fn find_axis(&self, name: &str) -> ScanResult<Arc<MockAxis>> {
        self.axes
            .get(name)
            .cloned()
            .ok_or_else(|| ScanError::DeviceNotFound(name.to_string()))
    }

    /// Trait-object view of the simulated devices
    pub fn database(&self) -> DeviceDatabase {
        let mut db = DeviceDatabase::new();
        for (name, axis) in &self.axes {
            db = db.with_axis(name, axis.clone());
        }
        for (name, timer) in &self.timers {
            db = db.with_timer(name, timer.clone());
        }
        for (name, scaler) in &self.scalers {
            db = db.with_scaler(name, scaler.clone());
        }
        for (name, detector) in &self.detectors {
            db = db.with_detector(name, detector.clone());
        }
        for (name, generator) in &self.pulse_generators {
            db = db.with_pulse_generator(name, generator.clone());
        }
        let mut outputs: Vec<_> = self.outputs.iter().collect();
        outputs.sort_by(|a, b| a.0.cmp(b.0));
        for (name, (role, output)) in outputs {
            db = db.with_output(name, *role, output.clone());
        }
        db
    }
}

/// Source of device databases for `start_mxdb`
#[async_trait]
pub trait DeviceProvider: Send + Sync {
    /// Open the database at `path`
    async fn open(&self, path: &str) -> ScanResult<DeviceDatabase>;
}

#[derive(Debug, Deserialize)]
struct DatabaseFile {
    #[serde(default)]
    devices: Vec<DeviceDefinition>,
}

/// Provider serving simulated devices
///
/// An empty path selects the provider's default definitions; any other path
/// is read as a TOML database file.
pub struct SimulatedProvider {
    defaults: Vec<DeviceDefinition>,
    opened: Mutex<HashMap<String, SimulatedBeamline>>,
}

impl SimulatedProvider {
    /// Provider whose default database is built from `definitions`
    ///
    /// An empty list falls back to [`DeviceDefinition::demo_beamline`].
    pub fn new(definitions: Vec<DeviceDefinition>) -> Self {
        let defaults = if definitions.is_empty() {
            DeviceDefinition::demo_beamline()
        } else {
            definitions
        };
        Self {
            defaults,
            opened: Mutex::new(HashMap::new()),
        }
    }

    /// Provider whose default database is an already-built beamline
    pub fn with_beamline(beamline: SimulatedBeamline) -> Self {
        let mut opened = HashMap::new();
        opened.insert(String::new(), beamline);
        Self {
            defaults: Vec::new(),
            opened: Mutex::new(opened),
        }
    }

    /// The beamline opened at `path`, if any
    pub fn beamline(&self, path: &str) -> Option<SimulatedBeamline> {
        self.opened.lock().ok()?.get(path).cloned()
    }

    fn load_definitions(&self, path: &str) -> ScanResult<Vec<DeviceDefinition>> {
        if path.is_empty() {
            return Ok(self.defaults.clone());
        }
        if !Path::new(path).exists() {
            return Err(ScanError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("device database '{}' not found", path),
            )));
        }
        let file: DatabaseFile = Figment::new().merge(Toml::file(path)).extract()?;
        Ok(file.devices)
    }
}

#[async_trait]
impl DeviceProvider for SimulatedProvider {
    async fn open(&self, path: &str) -> ScanResult<DeviceDatabase> {
        let mut opened = self
            .opened
            .lock()
            .map_err(|_| ScanError::Hardware("device cache poisoned".to_string()))?;

        if let Some(beamline) = opened.get(path) {
            info!(path, "reopening simulated device database");
            return Ok(beamline.database());
        }

        let definitions = self.load_definitions(path)?;
        if definitions.is_empty() {
            warn!(path, "device database defines no devices");
        }
        let beamline = SimulatedBeamline::build(&definitions)?;
        let db = beamline.database();
        info!(path, devices = definitions.len(), "opened simulated device database");
        opened.insert(path.to_string(), beamline);
        Ok(db)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_demo_beamline_inventory() {
        let provider = SimulatedProvider::new(Vec::new());
        let db = provider.open("").await.unwrap();
        let inventory = db.inventory();

        assert_eq!(inventory.axes, vec!["m1", "m2"]);
        assert_eq!(inventory.timers, vec!["t1"]);
        assert_eq!(inventory.scalers, vec!["i0", "i1"]);
        assert_eq!(inventory.detectors, vec!["det1"]);
        assert_eq!(inventory.shutters, vec!["sh1"]);
        assert!(db.trigger_hardware().is_ok());
    }

    #[tokio::test]
    async fn test_missing_device_is_reported_by_name() {
        let db = SimulatedProvider::new(Vec::new()).open("").await.unwrap();
        match db.axis("nope") {
            Err(ScanError::DeviceNotFound(name)) => assert_eq!(name, "nope"),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("lookup of unknown axis succeeded"),
        }
    }

    #[tokio::test]
    async fn test_database_file_and_cache() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[[devices]]
kind = "scaler"
name = "i0"
axis = "mx"

[[devices]]
kind = "axis"
name = "mx"
position = 2.0
"#
        )
        .unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let provider = SimulatedProvider::new(Vec::new());
        let db = provider.open(&path).await.unwrap();
        let axis = db.axis("mx").unwrap();
        assert_eq!(axis.get_position().await.unwrap(), 2.0);

        axis.move_absolute(3.0).await.unwrap();
        let reopened = provider.open(&path).await.unwrap();
        assert_eq!(reopened.axis("mx").unwrap().get_position().await.unwrap(), 3.0);
        assert!(provider.beamline(&path).is_some());
    }

    #[tokio::test]
    async fn test_unknown_reference_fails_build() {
        let defs = vec![DeviceDefinition::PulseGenerator {
            name: "pg".into(),
            detector: Some("ghost".into()),
        }];
        assert!(matches!(
            SimulatedBeamline::build(&defs),
            Err(ScanError::DeviceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_database_file() {
        let provider = SimulatedProvider::new(Vec::new());
        assert!(matches!(
            provider.open("/definitely/not/here.toml").await,
            Err(ScanError::Io(_))
        ));
    }
}
