//! Small helpers shared by the controller and the operator binary

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// Compute a deterministic hash of the input string as a 64-char hex digest.
///
/// Uses SHA-256 for stability across Rust toolchain versions.
/// `DefaultHasher` is NOT guaranteed stable across Rust releases, so this
/// function should be used whenever the hash is persisted (e.g., K8s annotations).
pub fn deterministic_hash(input: &str) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    hash.as_ref()
        .iter()
        .fold(String::with_capacity(64), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}

/// Check whether an object carries the given finalizer
pub fn has_finalizer(meta: &ObjectMeta, finalizer: &str) -> bool {
    meta.finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|x| x == finalizer))
}

/// Read an annotation value
pub fn annotation<'a>(meta: &'a ObjectMeta, key: &str) -> Option<&'a str> {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

/// Whether a kube error is an API 404
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Split an `apiVersion` into (group, version); the core group is empty
pub fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn hash_is_stable_and_full_length() {
        let a = deterministic_hash(r#"{"version":"1.*"}"#);
        let b = deterministic_hash(r#"{"version":"1.*"}"#);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn hash_matches_known_sha256() {
        assert_eq!(
            deterministic_hash("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn hash_differs_on_any_change() {
        assert_ne!(
            deterministic_hash(r#"{"version":"1.*"}"#),
            deterministic_hash(r#"{"version":"2.*"}"#)
        );
    }

    #[test]
    fn finalizer_lookup() {
        let meta = ObjectMeta {
            finalizers: Some(vec!["a".to_string(), "b".to_string()]),
            ..Default::default()
        };
        assert!(has_finalizer(&meta, "b"));
        assert!(!has_finalizer(&meta, "c"));
        assert!(!has_finalizer(&ObjectMeta::default(), "a"));
    }

    #[test]
    fn annotation_lookup() {
        let meta = ObjectMeta {
            annotations: Some(BTreeMap::from([("k".to_string(), "v".to_string())])),
            ..Default::default()
        };
        assert_eq!(annotation(&meta, "k"), Some("v"));
        assert_eq!(annotation(&meta, "missing"), None);
    }

    #[test]
    fn api_version_split() {
        assert_eq!(split_api_version("apps/v1"), ("apps", "v1"));
        assert_eq!(split_api_version("v1"), ("", "v1"));
        assert_eq!(
            split_api_version("getambassador.io/v2"),
            ("getambassador.io", "v2")
        );
    }
}
