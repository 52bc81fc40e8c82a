//! Build-time metadata embedded by the build script.

/// Short git commit hash, or `unknown` outside a checkout.
pub const GIT_HASH: &str = env!("BERTH_GIT_HASH");

/// Build time as seconds since the Unix epoch.
pub const BUILD_TIMESTAMP: &str = env!("BERTH_BUILD_TIMESTAMP");

/// Cargo profile the binary was built with.
pub const BUILD_PROFILE: &str = env!("BERTH_BUILD_PROFILE");

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version line shown by `berth --version` and logged at startup.
///
/// Example: `"0.1.0 (abc1234, debug)"`
pub const VERSION_LINE: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("BERTH_GIT_HASH"),
    ", ",
    env!("BERTH_BUILD_PROFILE"),
    ")"
);

pub fn version_string() -> String {
    VERSION_LINE.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_string_mentions_version_and_hash() {
        let v = version_string();
        assert!(v.starts_with(VERSION));
        assert!(v.contains(GIT_HASH));
    }

    #[test]
    fn test_build_timestamp_is_numeric() {
        assert!(BUILD_TIMESTAMP.parse::<u64>().is_ok());
    }

    #[test]
    fn test_build_profile() {
        assert!(matches!(BUILD_PROFILE, "debug" | "release"));
        assert!(VERSION_LINE.ends_with(&format!("{BUILD_PROFILE})")));
    }
}
