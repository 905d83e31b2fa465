//! Custom Resource Definitions for the Ambassador operator

mod installation;
mod types;

pub use installation::{
    AmbassadorInstallation, AmbassadorInstallationSpec, AmbassadorInstallationStatus,
    DeployedRelease, Flavor, DEFAULT_VERSION_SELECTOR,
};
pub use types::{
    Condition, ConditionFilter, ConditionLedger, ConditionReason, ConditionStatus, ConditionType,
};
