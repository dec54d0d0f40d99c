//! Version information for relaykit.

/// relaykit version from Cargo.toml
pub const RELAYKIT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// `<name> <version>` line printed by `--version`.
pub fn version_line(name: &str) -> String {
    format!("{name} {RELAYKIT_VERSION}")
}
