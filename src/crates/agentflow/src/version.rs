// Version information module for agentflow
//
// Provides version constants for the engine crate

/// Version string for the agentflow crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Package name
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Build timestamp, if the environment supplied one at compile time.
pub const BUILD_TIMESTAMP: Option<&str> = option_env!("AGENTFLOW_BUILD_TIMESTAMP");
