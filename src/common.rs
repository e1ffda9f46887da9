use std::collections::BTreeMap;
use std::path::Path;

use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube::Resource;

use crate::vcluster_types::{Role, VirtualCluster};

pub const APP_CONTAINER_NAME: &str = "app";
pub const INIT_CONTAINER_NAME: &str = "init";

/// Name of the shared filesystem-mode claim template; every resolved persist
/// directory is a sub-path mount of this one claim.
pub const PVC_NAME: &str = "persist";

/// Block-mode claim templates are named `block-<index>`.
pub const BLOCK_PVC_NAME_PREFIX: &str = "block-";

/// Prefix handed to generateName when the cluster uses UID naming.
pub const STATEFULSET_NAME_PREFIX: &str = "vcss-";

/// Size cap for each of the memory-backed /tmp, /run and /run/lock volumes.
pub const TMPFS_VOL_SIZE: &str = "20Gi";

/// Block device size used when the role does not specify one.
pub const DEFAULT_BLOCK_DEVICE_SIZE: &str = "10Gi";

/// Sentinel written (relative to the mounted volume root) once the init
/// container has populated persistent storage. Its presence short-circuits
/// any later re-population.
pub const INIT_MARKER_FILE: &str = "/etc/vcluster.init";

/// Where the init container's copy tool logs progress, relative to the
/// mounted volume root.
pub const INIT_LOG_FILE: &str = "/var/log/vcluster/init.log";
pub const INIT_PROGRESS_FILE: &str = "/var/log/vcluster/init.progress";

/// Host paths mounted into the container when systemd support is emulated.
pub const CGROUP_FS_PATH: &str = "/sys/fs/cgroup";
pub const SYSTEMD_FS_PATH: &str = "/sys/fs/cgroup/systemd";

pub const NVIDIA_GPU_RESOURCE_NAME: &str = "nvidia.com/gpu";
pub const NVIDIA_GPU_HIDE_ENV_NAME: &str = "NVIDIA_VISIBLE_DEVICES";
pub const NVIDIA_GPU_HIDE_ENV_VALUE: &str = "void";

pub const PYTHON_USER_BASE_ENV_NAME: &str = "PYTHONUSERBASE";

/// Install location of the per-member config CLI under the new setup layout.
pub const CONFIG_CLI_LOC: &str = "/usr/local";

/// Directories always placed on shared persistent storage.
pub const DEFAULT_MOUNT_DIRS: &[&str] = &["/etc"];

/// Directories placed on shared persistent storage when the role has a setup
/// package using the new layout. Superset of DEFAULT_MOUNT_DIRS.
pub const SETUP_MOUNT_DIRS: &[&str] = &[
    "/etc",
    "/opt/guestconfig",
    "/var/log/guestconfig",
    "/usr/local/bin",
    "/usr/local/lib",
];

/// Directories placed on shared persistent storage when the role has a setup
/// package using the legacy layout.
pub const SETUP_LEGACY_MOUNT_DIRS: &[&str] = &["/etc", "/opt", "/usr"];

/// Longest object name we will hand to generateName; leaves room for the
/// random suffix within the 63-character label limit.
const MAX_GENERATED_NAME_LEN: usize = 57;

pub fn labels_for_stateful_set(cluster: &VirtualCluster, role: &Role) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "app".to_string(),
            cluster.meta().name.as_ref().unwrap().clone(),
        ),
        ("role".to_string(), role.name.clone()),
    ])
}

pub fn labels_for_pod(cluster: &VirtualCluster, role: &Role) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "app".to_string(),
            cluster.meta().name.as_ref().unwrap().clone(),
        ),
        ("role".to_string(), role.name.clone()),
        ("kind".to_string(), "VirtualClusterMember".to_string()),
    ])
}

/// The canonical owner-reference set linking a child object back to its
/// virtual cluster.
pub fn owner_references(cluster: &VirtualCluster) -> Vec<metav1::OwnerReference> {
    vec![cluster.controller_owner_ref(&()).unwrap()]
}

/// True if the canonical controller reference for the cluster is present in
/// the given owner-reference list.
pub fn owner_references_present(
    cluster: &VirtualCluster,
    refs: Option<&Vec<metav1::OwnerReference>>,
) -> bool {
    let expected = cluster.controller_owner_ref(&()).unwrap();
    refs.map_or(false, |refs| {
        refs.iter().any(|r| r.uid == expected.uid && r.kind == expected.kind)
    })
}

/// Munges an arbitrary string into something acceptable as a Kubernetes
/// object name: lowercase alphanumerics and dashes, bounded length, no
/// leading or trailing dash.
pub fn sanitize_object_name(name: &str) -> String {
    let mut munged: String = name
        .to_ascii_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    munged.truncate(MAX_GENERATED_NAME_LEN);
    munged.trim_matches('-').to_string()
}

/// Directory the init container must create before the copy tool can open
/// its log file there.
pub fn init_log_dir() -> &'static str {
    Path::new(INIT_LOG_FILE)
        .parent()
        .and_then(|p| p.to_str())
        .unwrap_or("/")
}
