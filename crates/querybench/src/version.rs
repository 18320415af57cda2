//! Version information for querybench.

/// Crate version from Cargo.toml
pub const QUERYBENCH_VERSION: &str = env!("CARGO_PKG_VERSION");

/// `User-Agent` sent to proxies.
pub fn user_agent() -> String {
    format!("querybench/{QUERYBENCH_VERSION}")
}
