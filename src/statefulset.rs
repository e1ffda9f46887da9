//! Composes the statefulset implementing one role of a virtual cluster:
//! catalog lookups, directory-coverage resolution, volume composition, the
//! init container that seeds persistent storage, environment policy and the
//! naming directive.

use k8s_openapi::api::apps::v1 as appsv1;
use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube::api::ObjectMeta;
use kube::Resource;
use tracing::info;

use crate::bootstrap::init_container_command;
use crate::catalog::{Catalog, CatalogError, SetupPackageInfo};
use crate::common::*;
use crate::persist_dirs::{resolve_persist_dirs, Resolution};
use crate::vcluster_types::{NamingScheme, Role, RoleStatus, VirtualCluster};
use crate::volumes::{block_volume_devices, init_volume_mounts, volume_mounts_and_volumes};
use crate::Error;

/// Composes the complete statefulset spec for the given role at the given
/// replica count. Any catalog lookup failure aborts with no partial object.
/// Once a role has a stored statefulset identity the naming directive is
/// taken from it verbatim; the generate-name path only runs before first
/// assignment.
pub fn make_statefulset(
    cluster: &VirtualCluster,
    role: &Role,
    role_status: Option<&RoleStatus>,
    catalog: &dyn Catalog,
    native_systemd_support: bool,
    replicas: i32,
) -> Result<appsv1::StatefulSet, Error> {
    let cluster_name = cluster
        .meta()
        .name
        .as_ref()
        .ok_or(Error::MissingObjectKey(".metadata.name"))?;

    let port_info = catalog.ports_for_role(&role.name)?;
    let endpoint_ports: Vec<corev1::ContainerPort> = port_info
        .iter()
        .map(|p| corev1::ContainerPort {
            name: Some(p.id.clone()),
            container_port: p.port,
            ..corev1::ContainerPort::default()
        })
        .collect();

    let setup_info = catalog.setup_package_for_role(&role.name)?;
    let app_dirs = app_persist_dirs(role, catalog)?;
    let resolution = resolve_persist_dirs(default_dirs_for(setup_info.as_ref()), app_dirs.as_deref());
    log_dropped_dirs(cluster_name, role, &resolution);
    let persist_dirs = resolution.dirs;

    let image = catalog.image_for_role(&role.name)?;
    let security_context = security_context(catalog)?;
    let container_spec = catalog.container_spec_for_role(&role.name)?;

    let (volume_mounts, volumes) =
        volume_mounts_and_volumes(role, catalog, native_systemd_support, &persist_dirs)?;
    let volume_devices = role
        .block_storage
        .as_ref()
        .map(|block| block_volume_devices(block));

    let labels = labels_for_stateful_set(cluster, role);
    let pod_labels = labels_for_pod(cluster, role);

    let mut sts = appsv1::StatefulSet {
        metadata: ObjectMeta {
            namespace: cluster.meta().namespace.clone(),
            owner_references: Some(owner_references(cluster)),
            labels: Some(labels),
            ..ObjectMeta::default()
        },
        spec: Some(appsv1::StatefulSetSpec {
            pod_management_policy: Some("Parallel".to_string()),
            replicas: Some(replicas),
            service_name: cluster.cluster_service(),
            selector: metav1::LabelSelector {
                match_labels: Some(pod_labels.clone()),
                ..metav1::LabelSelector::default()
            },
            template: corev1::PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    ..ObjectMeta::default()
                }),
                spec: Some(corev1::PodSpec {
                    automount_service_account_token: Some(role.service_account_name.is_some()),
                    service_account_name: role.service_account_name.clone(),
                    affinity: role.affinity.clone(),
                    init_containers: init_containers(role, &image, &persist_dirs),
                    containers: vec![corev1::Container {
                        name: APP_CONTAINER_NAME.to_string(),
                        image: Some(image),
                        resources: Some(role.resources.clone()),
                        lifecycle: Some(post_start_lifecycle(&cluster.cluster_service())),
                        ports: Some(endpoint_ports),
                        volume_mounts: Some(volume_mounts),
                        volume_devices,
                        security_context,
                        env: Some(role_env_vars(role, setup_info.as_ref())),
                        tty: Some(container_spec.as_ref().map_or(false, |c| c.tty)),
                        stdin: Some(container_spec.as_ref().map_or(false, |c| c.stdin)),
                        ..corev1::Container::default()
                    }],
                    volumes: Some(volumes),
                    ..corev1::PodSpec::default()
                }),
            },
            volume_claim_templates: Some(volume_claim_templates(role)),
            ..appsv1::StatefulSetSpec::default()
        }),
        ..appsv1::StatefulSet::default()
    };

    match role_status {
        Some(status) if !status.stateful_set.is_empty() => {
            sts.metadata.name = Some(status.stateful_set.clone());
        }
        _ => match cluster.spec.naming_scheme {
            NamingScheme::CrNameRole => {
                sts.metadata.generate_name = Some(format!(
                    "{}-",
                    sanitize_object_name(&format!("{}-{}", cluster_name, role.name))
                ));
            }
            NamingScheme::Uid => {
                sts.metadata.generate_name = Some(STATEFULSET_NAME_PREFIX.to_string());
            }
        },
    }

    Ok(sts)
}

/// Default persist-dir table selection: roles with a setup package pull in
/// the layout-specific superset.
fn default_dirs_for(setup_info: Option<&SetupPackageInfo>) -> &'static [&'static str] {
    match setup_info {
        Some(info) if info.use_new_setup_layout => SETUP_MOUNT_DIRS,
        Some(_) => SETUP_LEGACY_MOUNT_DIRS,
        None => DEFAULT_MOUNT_DIRS,
    }
}

/// The application directory list fed to coverage resolution: catalog
/// declarations first, then the role's own extras.
fn app_persist_dirs(role: &Role, catalog: &dyn Catalog) -> Result<Option<Vec<String>>, CatalogError> {
    let mut dirs = catalog.persist_dirs_for_role(&role.name)?.unwrap_or_default();
    if let Some(extra) = &role.persist_dirs {
        dirs.extend(extra.iter().cloned());
    }
    Ok(if dirs.is_empty() { None } else { Some(dirs) })
}

fn log_dropped_dirs(cluster_name: &str, role: &Role, resolution: &Resolution) {
    for dropped in &resolution.dropped {
        info!(
            cluster = cluster_name,
            role = role.name.as_str(),
            dir = dropped.dir.as_str(),
            covered_by = dropped.covered_by.as_str(),
            source = %dropped.source,
            "skipping persist dir; already covered"
        );
    }
}

/// Appends policy-driven environment variables to the role's own list:
/// PYTHONUSERBASE under the new setup layout, and the GPU-hiding workaround
/// whenever the role does not request a non-zero GPU quantity (the device
/// plugin's visibility default is "expose all"). Existing entries are never
/// removed or reordered.
pub fn role_env_vars(role: &Role, setup_info: Option<&SetupPackageInfo>) -> Vec<corev1::EnvVar> {
    let mut env = role.env.clone();

    if setup_info.map_or(false, |info| info.use_new_setup_layout) {
        env.push(corev1::EnvVar {
            name: PYTHON_USER_BASE_ENV_NAME.to_string(),
            value: Some(CONFIG_CLI_LOC.to_string()),
            ..corev1::EnvVar::default()
        });
    }

    let gpu_requested = role
        .resources
        .requests
        .as_ref()
        .and_then(|requests| requests.get(NVIDIA_GPU_RESOURCE_NAME))
        .map_or(false, |quantity| !quantity_is_zero(quantity));
    if !gpu_requested {
        env.push(corev1::EnvVar {
            name: NVIDIA_GPU_HIDE_ENV_NAME.to_string(),
            value: Some(NVIDIA_GPU_HIDE_ENV_VALUE.to_string()),
            ..corev1::EnvVar::default()
        });
    }

    env
}

fn quantity_is_zero(quantity: &Quantity) -> bool {
    matches!(quantity.0.trim(), "" | "0")
}

/// The transient root container that populates persistent storage from the
/// image, present only when the role requests durable storage.
fn init_containers(
    role: &Role,
    image: &str,
    persist_dirs: &[String],
) -> Option<Vec<corev1::Container>> {
    role.storage.as_ref()?;

    let root_uid = 0i64;
    Some(vec![corev1::Container {
        name: INIT_CONTAINER_NAME.to_string(),
        image: Some(image.to_string()),
        command: Some(vec!["/bin/bash".to_string()]),
        args: Some(vec!["-c".to_string(), init_container_command(persist_dirs)]),
        resources: Some(role.resources.clone()),
        security_context: Some(corev1::SecurityContext {
            run_as_user: Some(root_uid),
            ..corev1::SecurityContext::default()
        }),
        volume_mounts: Some(init_volume_mounts()),
        ..corev1::Container::default()
    }])
}

/// Security context carrying capability additions only; omitted entirely
/// when the app requests no extra capabilities.
fn security_context(catalog: &dyn Catalog) -> Result<Option<corev1::SecurityContext>, CatalogError> {
    let capabilities = catalog.capabilities()?;
    if capabilities.is_empty() {
        return Ok(None);
    }
    Ok(Some(corev1::SecurityContext {
        capabilities: Some(corev1::Capabilities {
            add: Some(capabilities),
            ..corev1::Capabilities::default()
        }),
        ..corev1::SecurityContext::default()
    }))
}

/// Claim templates: one filesystem-mode claim shared by all persist dirs
/// when durable storage is requested, plus one block-mode claim per
/// requested raw device.
fn volume_claim_templates(role: &Role) -> Vec<corev1::PersistentVolumeClaim> {
    let mut templates = Vec::new();

    if let Some(storage) = &role.storage {
        templates.push(corev1::PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(PVC_NAME.to_string()),
                ..ObjectMeta::default()
            },
            spec: Some(corev1::PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                resources: Some(corev1::ResourceRequirements {
                    requests: Some(
                        [("storage".to_string(), Quantity(storage.size.clone()))].into(),
                    ),
                    ..corev1::ResourceRequirements::default()
                }),
                storage_class_name: storage.storage_class.clone(),
                ..corev1::PersistentVolumeClaimSpec::default()
            }),
            ..corev1::PersistentVolumeClaim::default()
        });
    }

    if let Some(block) = &role.block_storage {
        let size = block
            .size
            .clone()
            .unwrap_or_else(|| DEFAULT_BLOCK_DEVICE_SIZE.to_string());
        for index in 0..block.num_devices {
            templates.push(corev1::PersistentVolumeClaim {
                metadata: ObjectMeta {
                    name: Some(format!("{}{}", BLOCK_PVC_NAME_PREFIX, index)),
                    ..ObjectMeta::default()
                },
                spec: Some(corev1::PersistentVolumeClaimSpec {
                    access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                    resources: Some(corev1::ResourceRequirements {
                        requests: Some(
                            [("storage".to_string(), Quantity(size.clone()))].into(),
                        ),
                        ..corev1::ResourceRequirements::default()
                    }),
                    storage_class_name: block.storage_class.clone(),
                    volume_mode: Some("Block".to_string()),
                    ..corev1::PersistentVolumeClaimSpec::default()
                }),
                ..corev1::PersistentVolumeClaim::default()
            });
        }
    }

    templates
}

/// Post-start hook adding the cluster's DNS subdomain to the member's
/// resolv.conf search list, once the kubelet has written resolv.conf.
fn post_start_lifecycle(cluster_service: &str) -> corev1::Lifecycle {
    corev1::Lifecycle {
        post_start: Some(corev1::LifecycleHandler {
            exec: Some(corev1::ExecAction {
                command: Some(vec![
                    "/bin/bash".to_string(),
                    "-c".to_string(),
                    format!(
                        "exec 2>>/tmp/vc-poststart.log; set -x;\
                         Retries=60; while [[ $Retries && ! -s /etc/resolv.conf ]]; do \
                         sleep 1; Retries=$(expr $Retries - 1); done; \
                         sed \"s/^search \\([^ ]\\+\\)/search {service}.\\1 \\1/\" /etc/resolv.conf > /tmp/resolv.conf.new && \
                         cat /tmp/resolv.conf.new > /etc/resolv.conf;\
                         rm -f /tmp/resolv.conf.new;\
                         chmod 755 /run;\
                         exit 0",
                        service = cluster_service
                    ),
                ]),
            }),
            ..corev1::LifecycleHandler::default()
        }),
        ..corev1::Lifecycle::default()
    }
}
