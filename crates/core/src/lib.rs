//! Shared types for the warden helper: the settings triple, the inspection
//! engine interface, telemetry and the helper configuration file.
//! No sockets, no threads.

pub mod config;
pub mod engine;
pub mod error;
pub mod settings;
pub mod telemetry;

pub use config::{HelperConfig, runtime_dir};
pub use engine::{
    Action, ActionKind, Engine, EngineContext, EngineFactory, EngineResult, Ruleset,
    UpdateOutcome,
};
pub use error::{EngineError, Result};
pub use settings::{
    EngineSettings, RemoteConfigSettings, SchemaExtractionSettings, TelemetrySettings,
};
pub use telemetry::{MetricsCollector, Tags, TelemetrySubmitter};
