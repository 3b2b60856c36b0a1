//! Configuration Module
//!
//! Environment-driven settings for the storage client and CLI.

mod settings;

pub use settings::{
    AccessToken, ClientConfig, ConfigError, DEFAULT_ENDPOINT, RetrySettings, WriterSettings,
};
