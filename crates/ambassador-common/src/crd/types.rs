//! Status condition types and the condition ledger
//!
//! The ledger is the only way status conditions are mutated. It keeps at most
//! one condition per type and owns the transition-time bookkeeping.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition status following Kubernetes conventions
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Axis an installation condition describes
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum ConditionType {
    /// The installation has been picked up by the operator
    Initialized,
    /// A release is (or is no longer) deployed
    Deployed,
    /// The last attempted operation failed
    Failed,
    /// The installation cannot be acted upon
    Irreconcilable,
}

impl std::fmt::Display for ConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initialized => write!(f, "Initialized"),
            Self::Deployed => write!(f, "Deployed"),
            Self::Failed => write!(f, "Failed"),
            Self::Irreconcilable => write!(f, "Irreconcilable"),
        }
    }
}

/// Machine-readable reason attached to a condition
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum ConditionReason {
    /// First installation of the release succeeded
    InstallSuccessful,
    /// Upgrade of the release succeeded
    UpdateSuccessful,
    /// In-place reconciliation of the release succeeded
    ReconcileSuccessful,
    /// The release was removed
    UninstallSuccessful,
    /// Installing the release failed
    InstallError,
    /// Upgrading the release failed
    UpdateError,
    /// Reconciling the release failed
    ReconcileError,
    /// Removing the release failed
    UninstallError,
    /// The chart could not be retrieved
    DownloadError,
    /// The spec is invalid; nothing happens until it changes
    ParametersError,
    /// A flavor migration is blocked by existing resources
    UpgradePreconditionError,
    /// Another installation in the namespace is primary
    DuplicateError,
}

impl std::fmt::Display for ConditionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::InstallSuccessful => "InstallSuccessful",
            Self::UpdateSuccessful => "UpdateSuccessful",
            Self::ReconcileSuccessful => "ReconcileSuccessful",
            Self::UninstallSuccessful => "UninstallSuccessful",
            Self::InstallError => "InstallError",
            Self::UpdateError => "UpdateError",
            Self::ReconcileError => "ReconcileError",
            Self::UninstallError => "UninstallError",
            Self::DownloadError => "DownloadError",
            Self::ParametersError => "ParametersError",
            Self::UpgradePreconditionError => "UpgradePreconditionError",
            Self::DuplicateError => "DuplicateError",
        };
        f.write_str(s)
    }
}

/// Kubernetes-style condition for installation status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    #[serde(rename = "type")]
    pub type_: ConditionType,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<ConditionReason>,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// Last time the condition transitioned
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(type_: ConditionType, status: ConditionStatus) -> Self {
        Self {
            type_,
            status,
            reason: None,
            message: String::new(),
            last_transition_time: Utc::now(),
        }
    }

    /// Attach a reason
    pub fn with_reason(mut self, reason: ConditionReason) -> Self {
        self.reason = Some(reason);
        self
    }

    /// Attach a message
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    fn matches(&self, filter: &ConditionFilter) -> bool {
        filter.type_.map_or(true, |t| t == self.type_)
            && filter.status.map_or(true, |s| s == self.status)
            && filter.reason.map_or(true, |r| Some(r) == self.reason)
    }
}

/// Query over conditions; unset fields match anything
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConditionFilter {
    /// Required condition type
    pub type_: Option<ConditionType>,
    /// Required condition status
    pub status: Option<ConditionStatus>,
    /// Required condition reason
    pub reason: Option<ConditionReason>,
}

impl ConditionFilter {
    /// Filter matching every condition
    pub fn any() -> Self {
        Self::default()
    }

    /// Restrict to a condition type
    pub fn of_type(mut self, type_: ConditionType) -> Self {
        self.type_ = Some(type_);
        self
    }

    /// Restrict to a status
    pub fn with_status(mut self, status: ConditionStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Restrict to a reason
    pub fn with_reason(mut self, reason: ConditionReason) -> Self {
        self.reason = Some(reason);
        self
    }
}

/// Ordered set of conditions, one per type
///
/// Serializes as a plain list so the wire format stays the standard
/// `status.conditions` array.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ConditionLedger(Vec<Condition>);

impl ConditionLedger {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a condition, stamping transitions with the current time
    pub fn set(&mut self, condition: Condition) {
        self.set_at(condition, Utc::now());
    }

    /// Record a condition, stamping transitions with `now`
    ///
    /// An existing condition of the same type is replaced in place. Its
    /// transition time survives when the status is unchanged.
    pub fn set_at(&mut self, mut condition: Condition, now: DateTime<Utc>) {
        match self.0.iter_mut().find(|c| c.type_ == condition.type_) {
            Some(existing) => {
                condition.last_transition_time = if existing.status == condition.status {
                    existing.last_transition_time
                } else {
                    now
                };
                *existing = condition;
            }
            None => {
                condition.last_transition_time = now;
                self.0.push(condition);
            }
        }
    }

    /// Drop the condition of the given type, if present
    pub fn remove(&mut self, type_: ConditionType) {
        self.0.retain(|c| c.type_ != type_);
    }

    /// Condition of the given type
    pub fn get(&self, type_: ConditionType) -> Option<&Condition> {
        self.0.iter().find(|c| c.type_ == type_)
    }

    /// Most recently transitioned condition matching the filter
    ///
    /// On equal transition times the later entry wins, so a condition set
    /// after another within the same clock tick is still the latest.
    pub fn last_matching(&self, filter: ConditionFilter) -> Option<&Condition> {
        self.0
            .iter()
            .filter(|c| c.matches(&filter))
            .fold(None, |latest: Option<&Condition>, c| match latest {
                Some(l) if l.last_transition_time > c.last_transition_time => Some(l),
                _ => Some(c),
            })
    }

    /// Most recently transitioned condition of any kind
    pub fn latest(&self) -> Option<&Condition> {
        self.last_matching(ConditionFilter::any())
    }

    /// Whether the installation was marked as a duplicate
    pub fn is_duplicate(&self) -> bool {
        self.last_matching(ConditionFilter::any().with_reason(ConditionReason::DuplicateError))
            .is_some()
    }

    /// Iterate conditions in ledger order
    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.0.iter()
    }

    /// Number of conditions
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the ledger is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn deployed(status: ConditionStatus) -> Condition {
        Condition::new(ConditionType::Deployed, status)
            .with_reason(ConditionReason::InstallSuccessful)
            .with_message("New release installed successfully")
    }

    mod set {
        use super::*;

        #[test]
        fn appends_with_now_when_absent() {
            let mut ledger = ConditionLedger::new();
            ledger.set_at(deployed(ConditionStatus::True), t(0));

            assert_eq!(ledger.len(), 1);
            assert_eq!(
                ledger.get(ConditionType::Deployed).unwrap().last_transition_time,
                t(0)
            );
        }

        #[test]
        fn identical_set_keeps_transition_time() {
            let mut ledger = ConditionLedger::new();
            ledger.set_at(deployed(ConditionStatus::True), t(0));
            ledger.set_at(deployed(ConditionStatus::True), t(60));

            assert_eq!(ledger.len(), 1);
            assert_eq!(
                ledger.get(ConditionType::Deployed).unwrap().last_transition_time,
                t(0)
            );
        }

        #[test]
        fn status_change_restamps_transition_time() {
            let mut ledger = ConditionLedger::new();
            ledger.set_at(deployed(ConditionStatus::True), t(0));
            ledger.set_at(
                Condition::new(ConditionType::Deployed, ConditionStatus::False)
                    .with_reason(ConditionReason::UninstallSuccessful),
                t(90),
            );

            let condition = ledger.get(ConditionType::Deployed).unwrap();
            assert_eq!(condition.status, ConditionStatus::False);
            assert_eq!(condition.reason, Some(ConditionReason::UninstallSuccessful));
            assert_eq!(condition.last_transition_time, t(90));
        }

        #[test]
        fn same_status_still_replaces_reason_and_message() {
            let mut ledger = ConditionLedger::new();
            ledger.set_at(deployed(ConditionStatus::True), t(0));
            ledger.set_at(
                Condition::new(ConditionType::Deployed, ConditionStatus::True)
                    .with_reason(ConditionReason::UpdateSuccessful)
                    .with_message("upgraded"),
                t(30),
            );

            let condition = ledger.get(ConditionType::Deployed).unwrap();
            assert_eq!(condition.reason, Some(ConditionReason::UpdateSuccessful));
            assert_eq!(condition.message, "upgraded");
            assert_eq!(condition.last_transition_time, t(0));
        }

        #[test]
        fn one_entry_per_type() {
            let mut ledger = ConditionLedger::new();
            ledger.set_at(
                Condition::new(ConditionType::Initialized, ConditionStatus::True),
                t(0),
            );
            ledger.set_at(deployed(ConditionStatus::True), t(1));
            ledger.set_at(
                Condition::new(ConditionType::Initialized, ConditionStatus::True),
                t(2),
            );

            assert_eq!(ledger.len(), 2);
        }
    }

    mod remove {
        use super::*;

        #[test]
        fn removes_present_type_and_ignores_absent() {
            let mut ledger = ConditionLedger::new();
            ledger.set_at(deployed(ConditionStatus::True), t(0));

            ledger.remove(ConditionType::Failed);
            assert_eq!(ledger.len(), 1);

            ledger.remove(ConditionType::Deployed);
            assert!(ledger.is_empty());
        }
    }

    mod last_matching {
        use super::*;

        #[test]
        fn empty_ledger_matches_nothing() {
            assert!(ConditionLedger::new().latest().is_none());
        }

        #[test]
        fn returns_most_recent_transition() {
            let mut ledger = ConditionLedger::new();
            ledger.set_at(
                Condition::new(ConditionType::Initialized, ConditionStatus::True),
                t(0),
            );
            ledger.set_at(deployed(ConditionStatus::True), t(10));
            ledger.set_at(
                Condition::new(ConditionType::Failed, ConditionStatus::True)
                    .with_reason(ConditionReason::UpdateError),
                t(5),
            );

            assert_eq!(ledger.latest().unwrap().type_, ConditionType::Deployed);
        }

        #[test]
        fn later_entry_wins_on_equal_times() {
            let mut ledger = ConditionLedger::new();
            ledger.set_at(
                Condition::new(ConditionType::Initialized, ConditionStatus::True),
                t(0),
            );
            ledger.set_at(deployed(ConditionStatus::True), t(0));

            assert_eq!(ledger.latest().unwrap().type_, ConditionType::Deployed);
        }

        #[test]
        fn filters_on_every_set_field() {
            let mut ledger = ConditionLedger::new();
            ledger.set_at(deployed(ConditionStatus::True), t(0));
            ledger.set_at(
                Condition::new(ConditionType::Failed, ConditionStatus::True)
                    .with_reason(ConditionReason::DownloadError),
                t(10),
            );

            let filter = ConditionFilter::any()
                .of_type(ConditionType::Deployed)
                .with_status(ConditionStatus::True);
            assert_eq!(
                ledger.last_matching(filter).unwrap().reason,
                Some(ConditionReason::InstallSuccessful)
            );

            let filter = ConditionFilter::any().with_reason(ConditionReason::ParametersError);
            assert!(ledger.last_matching(filter).is_none());
        }

        #[test]
        fn duplicate_marker_is_found_by_reason() {
            let mut ledger = ConditionLedger::new();
            assert!(!ledger.is_duplicate());

            ledger.set_at(
                Condition::new(ConditionType::Irreconcilable, ConditionStatus::False)
                    .with_reason(ConditionReason::DuplicateError),
                t(0),
            );
            assert!(ledger.is_duplicate());
        }
    }

    mod wire_format {
        use super::*;

        #[test]
        fn serializes_as_plain_condition_list() {
            let mut ledger = ConditionLedger::new();
            ledger.set_at(
                Condition::new(ConditionType::Initialized, ConditionStatus::True),
                t(0),
            );

            let json = serde_json::to_value(&ledger).unwrap();
            let first = &json.as_array().unwrap()[0];
            assert_eq!(first["type"], "Initialized");
            assert_eq!(first["status"], "True");
            assert!(first.get("reason").is_none());
            assert!(first.get("lastTransitionTime").is_some());
        }
    }
}
