//! Remote configuration pipeline.
//!
//! A [`RemoteConfigClient`] polls a [`ConfigTransport`], routes each product's
//! configs to the [`Listener`] that owns it and commits the merged result
//! once per cycle.

pub mod aggregator;
pub mod client;
pub mod config;
pub mod error;
pub mod listener;
pub mod transport;

pub use client::RemoteConfigClient;
pub use config::{Config, Product};
pub use error::{ConfigError, TransportError};
pub use listener::{
    AsmStatus, AutoUserInstrumMode, EngineListener, FeatureState, FeaturesListener, Listener,
    SharedFeatures,
};
pub use transport::{ConfigTransport, FileTransport};
