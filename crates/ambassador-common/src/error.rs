//! Error types for the Ambassador operator
//!
//! Every failure a reconciliation pass can hit maps onto one condition reason.
//! The controller records that reason together with a short, stable message
//! (`condition_message`) and decides whether to retry on a timer from
//! `is_retryable`. The `Display` form keeps the underlying cause for logs.

use std::fmt;

use thiserror::Error;

use crate::crd::ConditionReason;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Release operation delegated to the release manager
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseOperation {
    /// First installation of the release
    Install,
    /// Upgrade of an installed release
    Update,
    /// In-place reconciliation of an up-to-date release
    Reconcile,
    /// Removal of the release
    Uninstall,
}

impl ReleaseOperation {
    /// Condition reason recorded when this operation fails
    pub fn failure_reason(&self) -> ConditionReason {
        match self {
            Self::Install => ConditionReason::InstallError,
            Self::Update => ConditionReason::UpdateError,
            Self::Reconcile => ConditionReason::ReconcileError,
            Self::Uninstall => ConditionReason::UninstallError,
        }
    }

    /// Condition message recorded when this operation fails
    pub fn failure_message(&self) -> &'static str {
        match self {
            Self::Install => "Installation of a new release failed",
            Self::Update => "Update of the installed release failed",
            Self::Reconcile => "Failed to reconcile release",
            Self::Uninstall => "Failed to uninstall release",
        }
    }
}

impl fmt::Display for ReleaseOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Install => write!(f, "install"),
            Self::Update => write!(f, "update"),
            Self::Reconcile => write!(f, "reconcile"),
            Self::Uninstall => write!(f, "uninstall"),
        }
    }
}

/// Main error type for Ambassador operator operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The installation spec cannot be acted upon until it changes
    #[error("invalid parameters for {installation}: {message}")]
    Parameters {
        /// Name of the installation with invalid parameters
        installation: String,
        /// Stable, user-facing description of the problem
        message: String,
    },

    /// Chart index or archive could not be retrieved
    #[error("download error from {url}: {message}")]
    Download {
        /// Repository or archive URL
        url: String,
        /// Description of what failed
        message: String,
    },

    /// A release operation failed or exceeded its deadline
    #[error("{operation} of release {release} failed: {message}")]
    Release {
        /// Operation that failed
        operation: ReleaseOperation,
        /// Helm release name
        release: String,
        /// Description of what failed
        message: String,
    },

    /// A flavor migration is blocked by resources in the namespace
    #[error("upgrade precondition not met: {message}")]
    Precondition {
        /// Stable, user-facing description of the blocking resources
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "helm")
        context: String,
    },
}

impl Error {
    /// Create a parameters error without installation context
    pub fn parameters(msg: impl Into<String>) -> Self {
        Self::Parameters {
            installation: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create a parameters error for the given installation
    pub fn parameters_for(installation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Parameters {
            installation: installation.into(),
            message: msg.into(),
        }
    }

    /// Create a download error
    pub fn download(url: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Download {
            url: url.into(),
            message: msg.into(),
        }
    }

    /// Create a release operation error
    pub fn release(
        operation: ReleaseOperation,
        release: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Release {
            operation,
            release: release.into(),
            message: msg.into(),
        }
    }

    /// Create a migration precondition error
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition {
            message: msg.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(msg: impl Into<String>, context: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Attach the installation name to a parameters error
    ///
    /// Other errors are returned unchanged.
    pub fn for_installation(self, name: &str) -> Self {
        match self {
            Self::Parameters { message, .. } => Self::Parameters {
                installation: name.to_string(),
                message,
            },
            other => other,
        }
    }

    /// Whether the controller should retry this error on its poll interval
    ///
    /// Parameter errors need a spec change; everything else is transient.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Parameters { .. })
    }

    /// Condition reason recorded on the installation for this error
    ///
    /// Returns `None` for errors that are not surfaced as conditions
    /// (API and internal failures go through the controller's error policy).
    pub fn condition_reason(&self) -> Option<ConditionReason> {
        match self {
            Self::Parameters { .. } => Some(ConditionReason::ParametersError),
            Self::Download { .. } => Some(ConditionReason::DownloadError),
            Self::Release { operation, .. } => Some(operation.failure_reason()),
            Self::Precondition { .. } => Some(ConditionReason::UpgradePreconditionError),
            Self::Kube { .. } | Self::Serialization { .. } | Self::Internal { .. } => None,
        }
    }

    /// Short human-readable sentence for the installation's condition list
    pub fn condition_message(&self) -> String {
        match self {
            Self::Parameters { message, .. } | Self::Precondition { message } => message.clone(),
            Self::Download { .. } => "Failed to download latest release".to_string(),
            Self::Release { operation, .. } => operation.failure_message().to_string(),
            Self::Kube { .. } => "Kubernetes API request failed".to_string(),
            Self::Serialization { .. } => "Failed to encode installation data".to_string(),
            Self::Internal { .. } => "Internal operator error".to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameters_errors_are_not_retried() {
        let err = Error::parameters_for("default", "could not parse version from \"x\"");
        assert!(!err.is_retryable());
        assert_eq!(
            err.condition_reason(),
            Some(ConditionReason::ParametersError)
        );
        assert_eq!(err.condition_message(), "could not parse version from \"x\"");
        assert!(err.to_string().contains("default"));
    }

    #[test]
    fn release_errors_map_to_operation_reasons() {
        let cases = [
            (ReleaseOperation::Install, ConditionReason::InstallError),
            (ReleaseOperation::Update, ConditionReason::UpdateError),
            (ReleaseOperation::Reconcile, ConditionReason::ReconcileError),
            (ReleaseOperation::Uninstall, ConditionReason::UninstallError),
        ];
        for (operation, reason) in cases {
            let err = Error::release(operation, "ambassador", "exit status 1");
            assert!(err.is_retryable());
            assert_eq!(err.condition_reason(), Some(reason));
        }
    }

    #[test]
    fn condition_message_hides_library_output() {
        let err = Error::release(
            ReleaseOperation::Install,
            "ambassador",
            "Error: INSTALLATION FAILED: context deadline exceeded",
        );
        assert_eq!(
            err.condition_message(),
            "Installation of a new release failed"
        );
        assert!(err.to_string().contains("context deadline exceeded"));
    }

    #[test]
    fn download_and_precondition_are_retryable() {
        let download = Error::download("https://www.getambassador.io", "connection refused");
        assert!(download.is_retryable());
        assert_eq!(
            download.condition_reason(),
            Some(ConditionReason::DownloadError)
        );

        let precondition = Error::precondition("1 AuthService(s) exist in the namespace");
        assert!(precondition.is_retryable());
        assert_eq!(
            precondition.condition_reason(),
            Some(ConditionReason::UpgradePreconditionError)
        );
    }

    #[test]
    fn for_installation_names_parameters_errors_only() {
        let err = Error::parameters("bad window").for_installation("ambassador");
        assert_eq!(
            err.to_string(),
            "invalid parameters for ambassador: bad window"
        );

        let err = Error::download("https://x", "HTTP 500").for_installation("ambassador");
        assert!(matches!(err, Error::Download { .. }));
    }

    #[test]
    fn json_errors_become_serialization_errors() {
        let err: Error = serde_json::from_str::<serde_json::Value>("{").unwrap_err().into();
        assert!(matches!(err, Error::Serialization { .. }));
        assert!(err.is_retryable());
        assert!(err.condition_reason().is_none());
    }

    #[test]
    fn internal_errors_have_no_condition_reason() {
        let err = Error::internal_with_context("boom", "reconciler");
        assert!(err.condition_reason().is_none());
        assert_eq!(err.to_string(), "internal error [reconciler]: boom");
    }
}
