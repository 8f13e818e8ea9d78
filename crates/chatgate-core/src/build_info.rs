//! Build-time metadata embedded by the build script.
//!
//! Surfaced on `GET /health` (spec §6.1/§10) for version/commit diagnostics.

/// The git commit hash at build time (short form).
pub const GIT_HASH: &str = env!("CHATGATE_GIT_HASH");

/// The build timestamp as a Unix epoch string.
pub const BUILD_TIMESTAMP: &str = env!("CHATGATE_BUILD_TIMESTAMP");

/// The build profile (`debug` or `release`).
pub const BUILD_PROFILE: &str = env!("CHATGATE_BUILD_PROFILE");

/// The crate version from Cargo.toml.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Return a formatted version string including git hash and profile.
///
/// Example: `"0.1.0 (abc1234, debug)"`
pub fn version_string() -> String {
    format!("{VERSION} ({GIT_HASH}, {BUILD_PROFILE})")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_string_not_empty() {
        let v = version_string();
        assert!(!v.is_empty());
        assert!(v.contains(VERSION));
    }

    #[test]
    fn git_hash_not_empty() {
        assert!(!GIT_HASH.is_empty());
    }
}
