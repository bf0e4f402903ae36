//! Hardware layer
//!
//! Capability traits the scan engine consumes, the device database that
//! resolves device names to them, and simulated implementations.

pub mod capabilities;
pub mod mock;
pub mod registry;

pub use capabilities::{
    Axis, BinaryOutput, Detector, DetectorParams, PulseGenerator, PulseSetup, Scaler, Timer,
    TriggerMode,
};
pub use registry::{
    DeviceDatabase, DeviceDefinition, DeviceInventory, DeviceProvider, OutputRole,
    SimulatedBeamline, SimulatedProvider,
};
