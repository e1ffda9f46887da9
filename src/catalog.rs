use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Catalog entry describing an application that virtual clusters can
/// instantiate: per-role images, service endpoints, persistence requests and
/// container settings.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(group = "vcluster.dev", version = "v1beta1", kind = "VirtualClusterApp")]
#[kube(shortname = "vcapp", namespaced)]
#[serde(rename_all = "camelCase")]
pub struct VirtualClusterAppSpec {
    /// Default container image, overridable per role.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Extra Linux capabilities the app containers need.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Whether app containers run systemd as their init system.
    #[serde(default)]
    pub systemd_required: bool,
    pub roles: Vec<AppRole>,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AppRole {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default)]
    pub ports: Vec<PortInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persist_dirs: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_package: Option<SetupPackageInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<RoleContainerSpec>,
}

/// One service endpoint exposed by a role's containers.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PortInfo {
    pub id: String,
    pub port: i32,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SetupPackageInfo {
    /// True if the setup package follows the new filesystem layout.
    #[serde(default)]
    pub use_new_setup_layout: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RoleContainerSpec {
    #[serde(default)]
    pub tty: bool,
    #[serde(default)]
    pub stdin: bool,
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("app catalog has no role named {0}")]
    UnknownRole(String),
    #[error("app catalog declares no image for role {0}")]
    MissingImage(String),
}

/// Per-application metadata lookups consumed during statefulset synthesis.
/// Every lookup may fail; failures abort synthesis with no partial object.
/// Trait objects cross the reconcile future, so implementations must be
/// shareable across threads.
pub trait Catalog: Send + Sync {
    fn ports_for_role(&self, role_name: &str) -> Result<Vec<PortInfo>, CatalogError>;
    fn persist_dirs_for_role(&self, role_name: &str) -> Result<Option<Vec<String>>, CatalogError>;
    fn setup_package_for_role(
        &self,
        role_name: &str,
    ) -> Result<Option<SetupPackageInfo>, CatalogError>;
    fn image_for_role(&self, role_name: &str) -> Result<String, CatalogError>;
    fn capabilities(&self) -> Result<Vec<String>, CatalogError>;
    fn systemd_required(&self) -> Result<bool, CatalogError>;
    fn container_spec_for_role(
        &self,
        role_name: &str,
    ) -> Result<Option<RoleContainerSpec>, CatalogError>;
}

/// Catalog backed by a fetched VirtualClusterApp object.
pub struct AppCatalog {
    app: VirtualClusterApp,
}

impl AppCatalog {
    pub fn new(app: VirtualClusterApp) -> Self {
        AppCatalog { app }
    }

    fn role(&self, role_name: &str) -> Result<&AppRole, CatalogError> {
        self.app
            .spec
            .roles
            .iter()
            .find(|r| r.name == role_name)
            .ok_or_else(|| CatalogError::UnknownRole(role_name.to_string()))
    }
}

impl Catalog for AppCatalog {
    fn ports_for_role(&self, role_name: &str) -> Result<Vec<PortInfo>, CatalogError> {
        Ok(self.role(role_name)?.ports.clone())
    }

    fn persist_dirs_for_role(&self, role_name: &str) -> Result<Option<Vec<String>>, CatalogError> {
        Ok(self.role(role_name)?.persist_dirs.clone())
    }

    fn setup_package_for_role(
        &self,
        role_name: &str,
    ) -> Result<Option<SetupPackageInfo>, CatalogError> {
        Ok(self.role(role_name)?.setup_package.clone())
    }

    fn image_for_role(&self, role_name: &str) -> Result<String, CatalogError> {
        let role = self.role(role_name)?;
        role.image
            .clone()
            .or_else(|| self.app.spec.image.clone())
            .ok_or_else(|| CatalogError::MissingImage(role_name.to_string()))
    }

    fn capabilities(&self) -> Result<Vec<String>, CatalogError> {
        Ok(self.app.spec.capabilities.clone())
    }

    fn systemd_required(&self) -> Result<bool, CatalogError> {
        Ok(self.app.spec.systemd_required)
    }

    fn container_spec_for_role(
        &self,
        role_name: &str,
    ) -> Result<Option<RoleContainerSpec>, CatalogError> {
        Ok(self.role(role_name)?.container.clone())
    }
}
