//! Ambassador installation management
//!
//! This crate provides the reconciliation decision engine for
//! AmbassadorInstallation resources and the Kubernetes controller that drives
//! it. The decision modules are pure; only `controller` and `release` talk to
//! the outside world.
//!
//! Related crates:
//! - `ambassador-common`: CRD types, errors, logging
//! - `ambassador-operator`: the operator binary

#![deny(missing_docs)]

pub mod config;
pub mod controller;
pub mod duplicate;
pub mod migration;
pub mod release;
pub mod spec_change;
pub mod state;
pub mod values;
pub mod version;
pub mod watches;
pub mod window;

// Re-export controller types
pub use config::ControllerConfig;
pub use controller::{
    error_policy, reconcile, Context, ContextBuilder, DependentSender, KubeClient, KubeClientImpl,
};
pub use release::{ChartIndex, HelmCli, HttpChartIndex, ReleaseManager};

// Re-export common error types
pub use ambassador_common::{Error, Result};
