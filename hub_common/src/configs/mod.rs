//! # Configuration Modules
//!
//! Typed settings for the gateway engine. The server binary layers defaults,
//! a JSON file and environment/CLI values, then hands the result here for
//! validation.

/// Device-proxy and polling settings plus their validation.
pub mod config_hub;
