use k8s_openapi::api::core::v1 as corev1;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A virtual cluster: a set of independently-scaled member roles implemented
/// by one statefulset per role.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(group = "vcluster.dev", version = "v1beta1", kind = "VirtualCluster")]
#[kube(shortname = "vc", namespaced, status = "VirtualClusterStatus")]
#[serde(rename_all = "camelCase")]
pub struct VirtualClusterSpec {
    /// Name of the VirtualClusterApp catalog entry this cluster instantiates.
    pub app: String,
    #[serde(default)]
    pub naming_scheme: NamingScheme,
    pub roles: Vec<Role>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum NamingScheme {
    /// Deterministic names derived from cluster name + role name.
    CrNameRole,
    /// Platform-generated unique names.
    #[serde(rename = "UID")]
    Uid,
}

impl Default for NamingScheme {
    fn default() -> Self {
        NamingScheme::CrNameRole
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub name: String,
    /// Desired member count for this role.
    pub members: i32,
    #[serde(default)]
    pub resources: corev1::ResourceRequirements,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_storage: Option<BlockStorageSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<SecretSpec>,
    #[serde(default)]
    pub volume_projections: Vec<VolumeProjection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<corev1::Affinity>,
    #[serde(default)]
    pub env: Vec<corev1::EnvVar>,
    /// Extra directories this role wants on persistent storage, in addition
    /// to whatever the app catalog declares.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persist_dirs: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// Requested capacity of the shared filesystem claim, e.g. "100Gi".
    pub size: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BlockStorageSpec {
    pub num_devices: i32,
    /// Per-device capacity; DEFAULT_BLOCK_DEVICE_SIZE when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
    /// Device path prefix; device N lands at `<path><N>`.
    pub path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretSpec {
    pub name: String,
    pub mount_path: String,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_mode: Option<i32>,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeProjection {
    /// Pre-existing claim to mount.
    pub pvc_name: String,
    pub mount_path: String,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VirtualClusterStatus {
    /// Headless service providing the cluster's DNS subdomain.
    #[serde(default)]
    pub cluster_service: String,
    #[serde(default)]
    pub roles: Vec<RoleStatus>,
}

/// Per-role record of the statefulset identity once assigned. Written back
/// after first create; a later synthesis for the same role reuses the stored
/// name instead of generating a new one.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RoleStatus {
    pub name: String,
    #[serde(default)]
    pub stateful_set: String,
}

impl VirtualCluster {
    pub fn role_status(&self, role_name: &str) -> Option<&RoleStatus> {
        self.status
            .as_ref()
            .and_then(|s| s.roles.iter().find(|r| r.name == role_name))
    }

    pub fn cluster_service(&self) -> String {
        self.status
            .as_ref()
            .map(|s| s.cluster_service.clone())
            .unwrap_or_default()
    }
}
