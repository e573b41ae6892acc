//! Configuration module.
//!
//! Gets custom values from environment variables, falling back to
//! defaults.  The server's bind address, port, and log level are
//! Rocket's own configuration (Rocket.toml or `ROCKET_*` variables);
//! only the protocol-level knobs live here.

use std::env;
use std::time::Duration;

const HOST_ENV_NAME: &str = "VOXELGATE_HOST";
const HOST_DEFAULT: &str = "localhost:8000";

/// The server a client should talk to, e.g. `"localhost:8000"`.
pub fn get_host() -> String {
    match env::var(HOST_ENV_NAME) {
        Ok(val) => val,
        Err(_) => HOST_DEFAULT.to_string(),
    }
}

const NODES_ENV_NAME: &str = "VOXELGATE_NODES";
const NODES_DEFAULT: &str = "abc123";

/// Node uuids the reference server registers at startup.
///
/// Volumes can only be created under a known node; node management
/// itself is not part of the protocol, so the set is fixed at launch.
pub fn get_seed_nodes() -> Vec<String> {
    let raw = env::var(NODES_ENV_NAME).unwrap_or_else(|_| NODES_DEFAULT.to_string());
    parse_nodes(&raw)
}

fn parse_nodes(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|uuid| !uuid.is_empty())
        .map(str::to_string)
        .collect()
}

const TIMEOUT_ENV_NAME: &str = "VOXELGATE_TIMEOUT_SECS";

/// Transport connect/read timeout for client connections, if set.
/// Independent of the busy-retry loop's own timeout.
pub fn get_timeout() -> Option<Duration> {
    env::var(TIMEOUT_ENV_NAME)
        .ok()
        .and_then(|val| val.parse::<f64>().ok())
        .map(Duration::from_secs_f64)
}
