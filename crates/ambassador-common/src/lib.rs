//! Common types for the Ambassador operator: CRDs, the condition ledger, errors, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod telemetry;

pub use error::{Error, ReleaseOperation};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group of the AmbassadorInstallation CRD and the Ambassador resources it inspects
pub const AMBASSADOR_GROUP: &str = "getambassador.io";

/// API version of the Ambassador resources the operator inspects
pub const AMBASSADOR_VERSION: &str = "v2";

/// Finalizer that holds an installation until its Helm release is uninstalled
pub const INSTALLATION_FINALIZER: &str = "uninstall-amb-operator-release";

/// Annotation storing the hash of the last evaluated spec
pub const SPEC_HASH_ANNOTATION: &str = "getambassador.io/last-applied-spec-hash";

/// Field manager used for server-side patches
pub const FIELD_MANAGER: &str = "ambassador-operator";
