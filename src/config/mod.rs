//! Configuration management for Sikt.

mod settings;

pub use settings::Settings;
