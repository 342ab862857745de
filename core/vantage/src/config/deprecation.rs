//! Deprecation handling for plugins and individual options.
//!
//! Registrations may carry a [`DeprecationInfo`]; the binder compares it
//! against the running agent version and either warns or refuses to activate
//! the plugin (or the specific option). Version metadata is written by
//! plugin authors, so malformed versions are a programming fault and panic
//! instead of being silently downgraded.

use std::fmt;

use semver::Version;

/// Deprecation metadata attached to a plugin or to one of its options.
#[derive(Debug, Clone, Copy)]
pub struct DeprecationInfo {
    /// Version since which the item is deprecated, e.g. `"1.7.0"`.
    pub since: &'static str,
    /// Version in which the item will be removed. Defaults to the next
    /// major release after `since`.
    pub removal_in: Option<&'static str>,
    /// What the user should do instead.
    pub notice: &'static str,
}

/// Deprecation metadata for a single configuration option.
#[derive(Debug, Clone, Copy)]
pub struct OptionDeprecation {
    pub option: &'static str,
    pub info: DeprecationInfo,
}

/// How strongly a deprecation applies to the running version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeprecationLevel {
    None,
    Warn,
    Error,
}

impl fmt::Display for DeprecationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeprecationLevel::None => f.write_str("none"),
            DeprecationLevel::Warn => f.write_str("warning"),
            DeprecationLevel::Error => f.write_str("error"),
        }
    }
}

/// The running agent version with patch and pre-release stripped, so that
/// `1.7.3-rc1` deprecates exactly like `1.7.0`.
pub fn running_version() -> Version {
    parse_version(env!("CARGO_PKG_VERSION"), "agent version")
}

fn parse_version(s: &str, what: &str) -> Version {
    match Version::parse(s.trim_start_matches('v')) {
        Ok(v) => Version::new(v.major, v.minor, 0),
        // Version metadata is part of the code, not of user configuration.
        Err(e) => panic!("malformed {what} {s:?}: {e}"),
    }
}

impl DeprecationInfo {
    /// Computes the escalation level against `running`.
    pub fn level_against(&self, running: &Version) -> DeprecationLevel {
        let since = parse_version(self.since, "deprecation 'since' version");
        let removal = match self.removal_in {
            Some(r) => parse_version(r, "deprecation 'removal' version"),
            None => Version::new(since.major + 1, 0, 0),
        };
        if *running >= removal {
            DeprecationLevel::Error
        } else if *running >= since {
            DeprecationLevel::Warn
        } else {
            DeprecationLevel::None
        }
    }

    pub fn level(&self) -> DeprecationLevel {
        self.level_against(&running_version())
    }

    pub(crate) fn removal_text(&self) -> String {
        match self.removal_in {
            Some(r) => r.to_owned(),
            None => {
                let since = parse_version(self.since, "deprecation 'since' version");
                format!("{}.0.0", since.major + 1)
            }
        }
    }
}

/// Logs a deprecation warning for a whole plugin.
pub(crate) fn warn_plugin(category: &str, name: &str, info: &DeprecationInfo) {
    log::warn!(
        "plugin {category}.{name} is deprecated since {} and will be removed in {}: {}",
        info.since,
        info.removal_text(),
        info.notice
    );
}

/// Logs a deprecation warning for a single option.
pub(crate) fn warn_option(category: &str, name: &str, option: &str, info: &DeprecationInfo) {
    log::warn!(
        "option {option:?} of plugin {category}.{name} is deprecated since {} and will be removed in {}: {}",
        info.since,
        info.removal_text(),
        info.notice
    );
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const NOTICE: &str = "use something else";

    #[test]
    fn not_yet_deprecated() {
        let info = DeprecationInfo {
            since: "9.0.0",
            removal_in: None,
            notice: NOTICE,
        };
        assert_eq!(info.level_against(&Version::new(1, 2, 0)), DeprecationLevel::None);
    }

    #[test]
    fn warns_between_since_and_removal() {
        let info = DeprecationInfo {
            since: "1.2.0",
            removal_in: Some("2.0.0"),
            notice: NOTICE,
        };
        assert_eq!(info.level_against(&Version::new(1, 2, 0)), DeprecationLevel::Warn);
        assert_eq!(info.level_against(&Version::new(1, 9, 0)), DeprecationLevel::Warn);
    }

    #[test]
    fn errors_at_removal() {
        let info = DeprecationInfo {
            since: "1.2.0",
            removal_in: Some("2.0.0"),
            notice: NOTICE,
        };
        assert_eq!(info.level_against(&Version::new(2, 0, 0)), DeprecationLevel::Error);
        assert_eq!(info.level_against(&Version::new(3, 1, 0)), DeprecationLevel::Error);
    }

    #[test]
    fn removal_defaults_to_next_major() {
        let info = DeprecationInfo {
            since: "1.2.0",
            removal_in: None,
            notice: NOTICE,
        };
        assert_eq!(info.level_against(&Version::new(1, 9, 0)), DeprecationLevel::Warn);
        assert_eq!(info.level_against(&Version::new(2, 0, 0)), DeprecationLevel::Error);
        assert_eq!(info.removal_text(), "2.0.0");
    }

    #[test]
    #[should_panic(expected = "malformed deprecation 'since' version")]
    fn malformed_version_panics() {
        let info = DeprecationInfo {
            since: "not-a-version",
            removal_in: None,
            notice: NOTICE,
        };
        let _ = info.level_against(&Version::new(1, 0, 0));
    }

    #[test]
    fn patch_and_prerelease_are_ignored() {
        let info = DeprecationInfo {
            since: "1.30.7-rc2",
            removal_in: Some("2.0.0"),
            notice: NOTICE,
        };
        // "since" is compared as 1.30.0
        assert_eq!(info.level_against(&Version::new(1, 30, 0)), DeprecationLevel::Warn);
    }
}
