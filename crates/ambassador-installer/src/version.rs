//! Version selectors and release ordering
//!
//! A chart carries two versions: the Ambassador (app) version it installs and
//! its own packaging (chart) version. Selectors constrain the app version; the
//! chart version only breaks ties between charts shipping the same app.
//!
//! Ordering rules:
//! - numeric components compare pairwise, missing trailing components are zero
//! - at equal numbers a GA release outranks an early-access one (`-ea3`),
//!   which outranks any other pre-release tag
//! - early-access builds compare by their number (`ea2` < `ea10`)

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use tracing::debug;

/// Errors from parsing versions or resolving a selector
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VersionError {
    /// A release version could not be parsed
    #[error("invalid version {input:?}")]
    InvalidVersion {
        /// The offending input
        input: String,
    },

    /// A version selector could not be parsed
    #[error("invalid version selector {input:?}")]
    InvalidSelector {
        /// The offending input
        input: String,
    },

    /// No candidate satisfies the selector
    #[error("no release matches version selector {selector:?}")]
    NoMatch {
        /// The selector that matched nothing
        selector: String,
    },
}

/// Release channel of a version
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Channel {
    /// Any pre-release tag other than early access (`-rc1`, `-beta`)
    Prerelease(String),
    /// Early-access build with its sequence number
    EarlyAccess(u64),
    /// General availability
    Ga,
}

impl Channel {
    fn rank(&self) -> u8 {
        match self {
            Self::Prerelease(_) => 0,
            Self::EarlyAccess(_) => 1,
            Self::Ga => 2,
        }
    }

    fn parse(tag: &str) -> Self {
        let lower = tag.to_ascii_lowercase();
        match lower.strip_prefix("ea") {
            Some(rest) => {
                let digits = rest.trim_start_matches(['.', '-']);
                if digits.is_empty() {
                    Self::EarlyAccess(0)
                } else {
                    digits
                        .parse()
                        .map(Self::EarlyAccess)
                        .unwrap_or_else(|_| Self::Prerelease(lower.clone()))
                }
            }
            None => Self::Prerelease(lower),
        }
    }
}

impl Ord for Channel {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::EarlyAccess(a), Self::EarlyAccess(b)) => a.cmp(b),
            (Self::Prerelease(a), Self::Prerelease(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Channel {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A dotted release version with an optional channel suffix
#[derive(Clone, Debug)]
pub struct Version {
    numbers: Vec<u64>,
    channel: Channel,
}

impl Version {
    /// Numeric component at `index`, zero when absent
    fn component(&self, index: usize) -> u64 {
        self.numbers.get(index).copied().unwrap_or(0)
    }

    /// Release channel
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Whether the leading numeric components equal `prefix`
    fn starts_with(&self, prefix: &[u64]) -> bool {
        prefix
            .iter()
            .enumerate()
            .all(|(i, n)| self.component(i) == *n)
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || VersionError::InvalidVersion {
            input: s.to_string(),
        };

        let trimmed = s.trim();
        let trimmed = trimmed.strip_prefix(['v', 'V']).unwrap_or(trimmed);
        let without_build = trimmed.split('+').next().unwrap_or_default();
        let (core, tag) = match without_build.split_once('-') {
            Some((core, tag)) => (core, Some(tag)),
            None => (without_build, None),
        };

        let numbers = core
            .split('.')
            .map(|part| part.parse::<u64>().map_err(|_| invalid()))
            .collect::<Result<Vec<_>, _>>()?;

        let channel = match tag {
            None => Channel::Ga,
            Some("") => return Err(invalid()),
            Some(tag) => Channel::parse(tag),
        };

        Ok(Self { numbers, channel })
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.numbers.len().max(other.numbers.len());
        (0..len)
            .map(|i| self.component(i).cmp(&other.component(i)))
            .find(|o| o.is_ne())
            .unwrap_or(Ordering::Equal)
            .then_with(|| self.channel.cmp(&other.channel))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let numbers: Vec<String> = self.numbers.iter().map(u64::to_string).collect();
        write!(f, "{}", numbers.join("."))?;
        match &self.channel {
            Channel::Ga => Ok(()),
            Channel::EarlyAccess(n) => write!(f, "-ea{}", n),
            Channel::Prerelease(tag) => write!(f, "-{}", tag),
        }
    }
}

/// Whether version `a` is strictly newer than version `b`
pub fn more_recent_than(a: &str, b: &str) -> Result<bool, VersionError> {
    Ok(a.parse::<Version>()? > b.parse::<Version>()?)
}

/// Whether versions `a` and `b` are the same release
pub fn equal(a: &str, b: &str) -> Result<bool, VersionError> {
    Ok(a.parse::<Version>()? == b.parse::<Version>()?)
}

/// A chart published in a repository index
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChartCandidate {
    /// Ambassador version installed by the chart
    pub app_version: String,
    /// Version of the chart itself
    pub chart_version: String,
    /// Download URLs for the chart archive
    pub urls: Vec<String>,
}

/// Parsed version selector
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionConstraint {
    raw: String,
    prefix: Vec<u64>,
    early_access: bool,
}

impl VersionConstraint {
    /// Parse a selector: `X.Y[.Z]`, `X.*`, `X.Y.*`, `*`, `X.*-ea` or `X.Y-ea`
    pub fn parse(selector: &str) -> Result<Self, VersionError> {
        let invalid = || VersionError::InvalidSelector {
            input: selector.to_string(),
        };

        let raw = selector.trim();
        let lower = raw.to_ascii_lowercase();
        let (body, early_access) = match lower.strip_suffix("-ea") {
            Some(body) => (body, true),
            None => (lower.as_str(), false),
        };

        let mut parts: Vec<&str> = body.split('.').collect();
        let wildcard = parts.last() == Some(&"*");
        if wildcard {
            parts.pop();
        }

        let prefix = parts
            .iter()
            .map(|p| p.parse::<u64>().map_err(|_| invalid()))
            .collect::<Result<Vec<_>, _>>()?;

        let valid_len = if wildcard {
            prefix.len() <= 2
        } else {
            (2..=3).contains(&prefix.len())
        };
        if !valid_len {
            return Err(invalid());
        }

        Ok(Self {
            raw: raw.to_string(),
            prefix,
            early_access,
        })
    }

    /// Whether the selector accepts early-access releases
    pub fn early_access(&self) -> bool {
        self.early_access
    }

    /// Whether an app version satisfies the selector
    pub fn allowed(&self, app_version: &str) -> Result<bool, VersionError> {
        let version: Version = app_version.parse()?;
        let channel_ok = match version.channel() {
            Channel::Ga => true,
            Channel::EarlyAccess(_) => self.early_access,
            Channel::Prerelease(_) => false,
        };
        Ok(channel_ok && version.starts_with(&self.prefix))
    }

    /// Pick the newest allowed candidate
    ///
    /// Candidates are ranked by app version, then by chart version.
    /// Unparsable candidates are skipped.
    pub fn select_best<'a>(
        &self,
        candidates: &'a [ChartCandidate],
    ) -> Result<&'a ChartCandidate, VersionError> {
        let mut best: Option<(&ChartCandidate, Version, Option<Version>)> = None;

        for candidate in candidates {
            match self.allowed(&candidate.app_version) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    debug!(error = %e, chart_version = %candidate.chart_version, "skipping chart");
                    continue;
                }
            }
            let Ok(app) = candidate.app_version.parse::<Version>() else {
                continue;
            };
            let chart = candidate.chart_version.parse::<Version>().ok();

            let newer = match &best {
                None => true,
                Some((_, best_app, best_chart)) => match app.cmp(best_app) {
                    Ordering::Greater => true,
                    Ordering::Less => false,
                    Ordering::Equal => chart > *best_chart,
                },
            };
            if newer {
                best = Some((candidate, app, chart));
            }
        }

        best.map(|(candidate, _, _)| candidate)
            .ok_or_else(|| VersionError::NoMatch {
                selector: self.raw.clone(),
            })
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(app: &str, chart: &str) -> ChartCandidate {
        ChartCandidate {
            app_version: app.to_string(),
            chart_version: chart.to_string(),
            urls: vec![format!("ambassador-{}.tgz", chart)],
        }
    }

    fn allowed(selector: &str, version: &str) -> bool {
        VersionConstraint::parse(selector)
            .unwrap()
            .allowed(version)
            .unwrap()
    }

    // =========================================================================
    // Ordering
    // =========================================================================

    #[test]
    fn more_recent_than_compares_componentwise() {
        assert!(more_recent_than("2.0", "1.0").unwrap());
        assert!(!more_recent_than("1.0", "2.0").unwrap());
        assert!(more_recent_than("1.1", "1.0").unwrap());
        assert!(more_recent_than("1.0.1", "1.0").unwrap());
        assert!(!more_recent_than("1.0.0", "1.0.1").unwrap());
        assert!(more_recent_than("1.10", "1.9").unwrap());
    }

    #[test]
    fn equal_pads_missing_components() {
        assert!(equal("1.0", "1.0").unwrap());
        assert!(equal("2.1", "2.1").unwrap());
        assert!(equal("1.1.1", "1.1.1").unwrap());
        assert!(!equal("9.0", "8.0").unwrap());
        assert!(equal("1.0", "1.0.0").unwrap());
    }

    #[test]
    fn ga_outranks_early_access_of_same_numbers() {
        assert!(more_recent_than("3.0", "3.0-ea5").unwrap());
        assert!(more_recent_than("3.0-ea10", "3.0-ea2").unwrap());
        assert!(more_recent_than("3.0-EA1", "3.0-rc9").unwrap());
        assert!(more_recent_than("3.1-ea1", "3.0.9").unwrap());
    }

    #[test]
    fn garbage_versions_are_errors() {
        assert!(more_recent_than("one", "1.0").is_err());
        assert!(equal("1.0", "1..0").is_err());
        assert!("1.0-".parse::<Version>().is_err());
    }

    #[test]
    fn leading_v_and_build_metadata_are_ignored() {
        assert!(equal("v1.2.3", "1.2.3+build.7").unwrap());
    }

    // =========================================================================
    // Selector parsing
    // =========================================================================

    #[test]
    fn accepts_every_documented_form() {
        for selector in ["1.0", "1.0.3", "1.*", "1.1.*", "*", "4.*-ea", "3.0-ea", "3.0-EA"] {
            assert!(
                VersionConstraint::parse(selector).is_ok(),
                "{} should parse",
                selector
            );
        }
    }

    #[test]
    fn rejects_malformed_selectors() {
        for selector in ["", "latest", "1", "1.*.3", "1.2.3.4", "*.1", "1.x", "-ea"] {
            assert!(
                VersionConstraint::parse(selector).is_err(),
                "{} should not parse",
                selector
            );
        }
    }

    // =========================================================================
    // Allowed
    // =========================================================================

    #[test]
    fn wildcard_tail_matches_prefix() {
        assert!(!allowed("2.*", "1.0"));
        assert!(allowed("2.*", "2.5"));
        assert!(allowed("2.*", "2.0.1"));
        assert!(allowed("1.1.*", "1.1.7"));
        assert!(!allowed("1.1.*", "1.2.0"));
    }

    #[test]
    fn exact_pin_matches_its_patch_releases_only() {
        assert!(allowed("1.1", "1.1"));
        assert!(allowed("1.1", "1.1.4"));
        assert!(!allowed("1.1", "1.2"));
        assert!(!allowed("1.1", "2.1"));
        assert!(allowed("1.1.4", "1.1.4"));
        assert!(!allowed("1.1.4", "1.1.5"));
    }

    #[test]
    fn full_wildcard_matches_any_ga() {
        assert!(allowed("*", "1.0"));
        assert!(allowed("*", "13.2.1"));
        assert!(!allowed("*", "2.0-ea1"));
    }

    #[test]
    fn early_access_only_with_ea_selector() {
        assert!(!allowed("3.0", "3.0-ea1"));
        assert!(allowed("3.0-ea", "3.0-ea1"));
        assert!(allowed("3.0-ea", "3.0"));
        assert!(!allowed("3.0-ea", "3.1-ea1"));
        assert!(allowed("4.*-ea", "4.1-EA3"));
        assert!(!allowed("4.*-ea", "4.1-rc1"));
    }

    #[test]
    fn unparsable_candidate_is_an_error() {
        let constraint = VersionConstraint::parse("*").unwrap();
        assert!(constraint.allowed("nightly").is_err());
    }

    // =========================================================================
    // SelectBest
    // =========================================================================

    #[test]
    fn selects_highest_allowed_app_version() {
        let charts = vec![
            candidate("1.4.0", "6.3.0"),
            candidate("1.5.1", "6.4.2"),
            candidate("2.0.0", "7.0.0"),
            candidate("1.5.0", "6.4.0"),
        ];
        let constraint = VersionConstraint::parse("1.*").unwrap();
        assert_eq!(constraint.select_best(&charts).unwrap().app_version, "1.5.1");
    }

    #[test]
    fn ties_on_app_version_break_on_chart_version() {
        let charts = vec![
            candidate("1.0", "6.0.1"),
            candidate("1.0", "6.0.10"),
            candidate("1.0", "6.0.3"),
        ];
        let constraint = VersionConstraint::parse("1.0").unwrap();
        assert_eq!(
            constraint.select_best(&charts).unwrap().chart_version,
            "6.0.10"
        );
    }

    #[test]
    fn early_access_preferred_until_newer_ga_exists() {
        let mut charts = vec![candidate("4.0.5", "8.0.5"), candidate("4.1-ea3", "8.1.0-ea3")];
        let constraint = VersionConstraint::parse("4.*-ea").unwrap();
        assert_eq!(constraint.select_best(&charts).unwrap().app_version, "4.1-ea3");

        charts.push(candidate("4.1", "8.1.0"));
        assert_eq!(constraint.select_best(&charts).unwrap().app_version, "4.1");
    }

    #[test]
    fn skips_unparsable_candidates() {
        let charts = vec![candidate("garbage", "1.0.0"), candidate("1.2", "6.1.0")];
        let constraint = VersionConstraint::parse("*").unwrap();
        assert_eq!(constraint.select_best(&charts).unwrap().app_version, "1.2");
    }

    #[test]
    fn no_match_names_the_selector() {
        let charts = vec![candidate("1.0", "6.0.0")];
        let constraint = VersionConstraint::parse("2.*").unwrap();
        assert_eq!(
            constraint.select_best(&charts),
            Err(VersionError::NoMatch {
                selector: "2.*".to_string()
            })
        );
    }
}
