//! Installation state machine
//!
//! The state of an installation is never stored directly. It is derived from
//! the condition ledger on every pass, and each pass records its outcome back
//! into the ledger.
//!
//! ```text
//! Uninitialized -> Initialized -> (install | upgrade | reconcile) -> Deployed
//!                                        |
//!                                        +-> Failed(reason) -> retried
//! Duplicate / Irreconcilable: terminal
//! Deleting: any state once a deletion timestamp is set
//! ```

use chrono::{DateTime, Duration, Utc};

use ambassador_common::crd::{
    AmbassadorInstallationStatus, ConditionFilter, ConditionReason, ConditionStatus,
    ConditionType,
};

/// Lifecycle state derived from an installation's conditions
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstallationState {
    /// Never seen by the operator
    Uninitialized,
    /// Picked up, nothing deployed yet
    Initialized,
    /// The last release operation succeeded
    Deployed,
    /// The last operation failed with the given reason
    Failed(Option<ConditionReason>),
    /// Marked as a duplicate of another installation in the namespace
    Duplicate,
    /// Marked as impossible to act upon for another reason
    Irreconcilable,
    /// Deletion requested
    Deleting,
}

impl InstallationState {
    /// Derive the state from the status and the object's deletion marker
    pub fn derive(status: Option<&AmbassadorInstallationStatus>, deleting: bool) -> Self {
        if deleting {
            return Self::Deleting;
        }
        let Some(status) = status else {
            return Self::Uninitialized;
        };
        let ledger = &status.conditions;

        if ledger.is_duplicate() {
            return Self::Duplicate;
        }
        if ledger
            .last_matching(
                ConditionFilter::any()
                    .of_type(ConditionType::Irreconcilable)
                    .with_status(ConditionStatus::True),
            )
            .is_some()
        {
            return Self::Irreconcilable;
        }

        match ledger.latest() {
            Some(c) if c.type_ == ConditionType::Failed && c.status == ConditionStatus::True => {
                Self::Failed(c.reason)
            }
            Some(c) if c.type_ == ConditionType::Deployed && c.status == ConditionStatus::True => {
                Self::Deployed
            }
            _ if ledger.get(ConditionType::Initialized).is_some() => Self::Initialized,
            _ => Self::Uninitialized,
        }
    }

    /// Whether passes for this installation must stop without acting
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Duplicate)
    }
}

/// Release operation chosen for a pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseAction {
    /// No release exists yet
    Install,
    /// The release exists but differs from the desired one
    Upgrade,
    /// The release is current; re-apply it in place
    Reconcile,
}

impl ReleaseAction {
    /// Pick the operation from the release manager's predicates
    pub fn choose(installed: bool, update_required: bool) -> Self {
        match (installed, update_required) {
            (false, _) => Self::Install,
            (true, true) => Self::Upgrade,
            (true, false) => Self::Reconcile,
        }
    }

    /// Condition reason recorded when the operation succeeds
    pub fn success_reason(&self) -> ConditionReason {
        match self {
            Self::Install => ConditionReason::InstallSuccessful,
            Self::Upgrade => ConditionReason::UpdateSuccessful,
            Self::Reconcile => ConditionReason::ReconcileSuccessful,
        }
    }

    /// Default condition message when the release has no notes
    pub fn success_message(&self) -> &'static str {
        match self {
            Self::Install => "New release installed successfully",
            Self::Upgrade => "Release updated successfully",
            Self::Reconcile => "Reconciled release",
        }
    }
}

/// Outcome of the timing gate
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateGate {
    /// Go ahead with the release step
    Proceed,
    /// A check ran less than one update interval ago
    RecentlyChecked,
    /// The update window is closed
    OutsideWindow,
}

/// Inputs of the timing gate
#[derive(Clone, Copy, Debug)]
pub struct GateInput {
    /// Derived installation state
    pub state: InstallationState,
    /// A migration is pending or the spec changed
    pub urgent: bool,
    /// Time of the last successful check
    pub last_check: Option<DateTime<Utc>>,
    /// Current time
    pub now: DateTime<Utc>,
    /// Minimum time between two checks
    pub update_interval: Duration,
    /// Whether the update window allows an upgrade now
    pub window_open: bool,
}

/// Decide whether a pass may proceed to the release step
///
/// Only a healthy deployment is held back. Fresh installations, failures and
/// urgent changes always proceed.
pub fn update_gate(input: GateInput) -> UpdateGate {
    if input.state != InstallationState::Deployed || input.urgent {
        return UpdateGate::Proceed;
    }
    if input
        .last_check
        .is_some_and(|checked| input.now - checked < input.update_interval)
    {
        return UpdateGate::RecentlyChecked;
    }
    if !input.window_open {
        return UpdateGate::OutsideWindow;
    }
    UpdateGate::Proceed
}
