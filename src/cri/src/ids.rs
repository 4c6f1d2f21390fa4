//! Shim-generated identifiers and the pod/container naming scheme.
//!
//! A sandbox ID is a single path segment; a container ID is
//! `<pod-id>/<child-id>`. Deeper names (`pod/ctr/exec-…`) belong to
//! ephemeral exec children.

use rand::Rng;

/// Longest name prefix kept in a generated ID. With the dash and four hex
/// digits the result stays within the 63-character CRI limit.
const NAME_PREFIX_MAX: usize = 58;

/// Generate an ID: the first ≤ 58 characters of `name`, a dash and four
/// lowercase hex digits of process-wide randomness. Collisions are expected
/// to surface as `ContainerAlreadyExists` from the backend and act as a
/// retry signal for the caller.
pub fn create_id(name: &str) -> String {
    let prefix: String = name.chars().take(NAME_PREFIX_MAX).collect();
    let suffix: u16 = rand::thread_rng().gen();
    format!("{}-{:04x}", prefix, suffix)
}

/// Split an ID into `(pod, remainder)`. The remainder is empty for
/// sandbox-level IDs and may itself contain slashes for exec children.
pub fn split_pod_container(id: &str) -> (&str, &str) {
    match id.split_once('/') {
        Some((pod, rest)) => (pod, rest),
        None => (id, ""),
    }
}

/// True when the ID names a container (or deeper), not a sandbox.
pub fn is_container(id: &str) -> bool {
    let (_, rest) = split_pod_container(id);
    !rest.is_empty()
}
