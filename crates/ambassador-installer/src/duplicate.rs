//! Duplicate arbitration
//!
//! Only one AmbassadorInstallation per namespace is acted upon: the oldest,
//! with ties broken by name. Losers are marked once and never re-evaluated,
//! even after the primary goes away.

use ambassador_common::crd::AmbassadorInstallation;
use kube::ResourceExt;

/// Condition message recorded on installations that lost arbitration
pub const DUPLICATE_MESSAGE: &str =
    "There is a previous AmbassadorInstallation in this namespace. Disabling this one.";

/// Whether `candidate` is the primary installation among `all`
///
/// Objects without a creation timestamp sort after every timestamped one.
/// A candidate missing from `all` is only primary when `all` is empty.
pub fn is_primary(candidate: &AmbassadorInstallation, all: &[AmbassadorInstallation]) -> bool {
    let primary = all.iter().min_by(|a, b| {
        let created_a = a.metadata.creation_timestamp.as_ref().map(|t| t.0);
        let created_b = b.metadata.creation_timestamp.as_ref().map(|t| t.0);
        match (created_a, created_b) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        }
        .then_with(|| a.name_any().cmp(&b.name_any()))
    });

    match primary {
        Some(primary) => primary.name_any() == candidate.name_any(),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ambassador_common::crd::AmbassadorInstallationSpec;
    use chrono::{Duration, TimeZone, Utc};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn installation(name: &str, created_offset_secs: Option<i64>) -> AmbassadorInstallation {
        let mut inst = AmbassadorInstallation::new(name, AmbassadorInstallationSpec::default());
        inst.metadata.namespace = Some("ambassador".to_string());
        inst.metadata.creation_timestamp = created_offset_secs.map(|secs| {
            Time(Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap() + Duration::seconds(secs))
        });
        inst
    }

    #[test]
    fn only_the_oldest_of_three_is_primary() {
        let all = vec![
            installation("second", Some(10)),
            installation("first", Some(0)),
            installation("third", Some(20)),
        ];

        assert!(is_primary(&all[1], &all));
        assert!(!is_primary(&all[0], &all));
        assert!(!is_primary(&all[2], &all));
    }

    #[test]
    fn same_timestamp_breaks_ties_by_name() {
        let all = vec![installation("beta", Some(0)), installation("alpha", Some(0))];
        assert!(is_primary(&all[1], &all));
        assert!(!is_primary(&all[0], &all));
    }

    #[test]
    fn missing_timestamp_sorts_last() {
        let all = vec![installation("aaa", None), installation("zzz", Some(0))];
        assert!(is_primary(&all[1], &all));
    }

    #[test]
    fn lone_installation_is_primary() {
        let only = installation("ambassador", Some(0));
        assert!(is_primary(&only, std::slice::from_ref(&only)));
        assert!(is_primary(&only, &[]));
    }
}
