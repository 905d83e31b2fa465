//! Flavor planning and migration preconditions
//!
//! The flavor follows `installOSS`. Moving an OSS release to the Edge Stack
//! is a migration: it is refused while resources that the Edge Stack would
//! take over (`AuthService`, `RateLimitService`) exist in the namespace.
//! Moving back from the Edge Stack to OSS is not supported.

use std::collections::BTreeMap;

use ambassador_common::crd::Flavor;
use ambassador_common::Error;
use thiserror::Error as ThisError;

/// Kinds whose presence blocks an OSS to AES migration
pub const AES_EXCLUSIVE_KINDS: [&str; 2] = ["AuthService", "RateLimitService"];

/// Why a migration cannot proceed
#[derive(Debug, ThisError, PartialEq, Eq)]
pub enum MigrationError {
    /// The migration direction is not supported at all
    #[error("migration from {from} to {to} not supported")]
    Unsupported {
        /// Currently deployed flavor
        from: Flavor,
        /// Requested flavor
        to: Flavor,
    },

    /// Resources in the namespace must be removed first
    #[error("{count} {kind}(s) exist in the cluster, please remove to upgrade to AES")]
    Blocked {
        /// Blocking kind
        kind: String,
        /// Number of blocking objects
        count: usize,
    },
}

impl From<MigrationError> for Error {
    fn from(err: MigrationError) -> Self {
        match err {
            MigrationError::Unsupported { .. } => Error::parameters(err.to_string()),
            MigrationError::Blocked { .. } => Error::precondition(err.to_string()),
        }
    }
}

/// Flavor to install and whether that changes the deployed one
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlavorPlan {
    /// Target flavor
    pub flavor: Flavor,
    /// The deployed release is OSS and the target is AES
    pub migrating: bool,
}

/// Decide the target flavor
///
/// `enable_aes` is the `enableAES` helm value when the user set it as a
/// boolean. It must agree with `install_oss`.
pub fn plan_flavor(
    install_oss: bool,
    enable_aes: Option<bool>,
    deployed: Option<Flavor>,
) -> Result<FlavorPlan, Error> {
    if enable_aes.is_some_and(|aes| aes == install_oss) {
        return Err(Error::parameters(
            "helmValues.enableAES and installOSS fields conflict with each other",
        ));
    }

    let flavor = if install_oss { Flavor::Oss } else { Flavor::Aes };
    match (deployed, flavor) {
        (Some(Flavor::Aes), Flavor::Oss) => Err(MigrationError::Unsupported {
            from: Flavor::Aes,
            to: Flavor::Oss,
        }
        .into()),
        (Some(Flavor::Oss), Flavor::Aes) => Ok(FlavorPlan {
            flavor,
            migrating: true,
        }),
        _ => Ok(FlavorPlan {
            flavor,
            migrating: false,
        }),
    }
}

/// Check that moving from `current` to `target` is safe
///
/// `scope_resources` maps kind to the number of objects of that kind in the
/// installation's namespace. Missing kinds count as zero.
pub fn can_migrate(
    target: Flavor,
    current: Flavor,
    scope_resources: &BTreeMap<String, usize>,
) -> Result<(), MigrationError> {
    match (current, target) {
        (Flavor::Aes, Flavor::Oss) => Err(MigrationError::Unsupported {
            from: current,
            to: target,
        }),
        (Flavor::Oss, Flavor::Aes) => {
            for kind in AES_EXCLUSIVE_KINDS {
                let count = scope_resources.get(kind).copied().unwrap_or(0);
                if count > 0 {
                    return Err(MigrationError::Blocked {
                        kind: kind.to_string(),
                        count,
                    });
                }
            }
            Ok(())
        }
        _ => Ok(()),
    }
}
