//! Builds the volume, mount and device lists for a role's app container:
//! sub-path mounts of the shared persistent claim, raw block devices, the
//! memory-backed scratch volumes, secret mounts, projected claims, and the
//! cgroup passthrough needed for emulated systemd support.

use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::catalog::{Catalog, CatalogError};
use crate::common::*;
use crate::vcluster_types::{BlockStorageSpec, Role, SecretSpec, VolumeProjection};

/// The full set of volume mounts and volumes for a role's app container.
/// Catalog lookup failures propagate unmodified; no retry here.
pub fn volume_mounts_and_volumes(
    role: &Role,
    catalog: &dyn Catalog,
    native_systemd_support: bool,
    persist_dirs: &[String],
) -> Result<(Vec<corev1::VolumeMount>, Vec<corev1::Volume>), CatalogError> {
    let mut volume_mounts = Vec::new();
    let mut volumes = Vec::new();

    if role.storage.is_some() {
        volume_mounts.extend(claim_mounts(persist_dirs));
    }

    let (tmpfs_mounts, tmpfs_vols) = tmpfs_support();
    volume_mounts.extend(tmpfs_mounts);
    volumes.extend(tmpfs_vols);

    let (secret_mounts, secret_vols) = secret_volume(role.secret.as_ref());
    volume_mounts.extend(secret_mounts);
    volumes.extend(secret_vols);

    for (index, projection) in role.volume_projections.iter().enumerate() {
        let (mount, volume) = projection_mount(index, projection);
        volume_mounts.push(mount);
        volumes.push(volume);
    }

    let systemd_required = catalog.systemd_required()?;
    if systemd_required && !native_systemd_support {
        let (cgroup_mounts, cgroup_vols) = systemd_support();
        volume_mounts.extend(cgroup_mounts);
        volumes.extend(cgroup_vols);
    }

    Ok((volume_mounts, volumes))
}

/// One mount per persist directory, all backed by the shared claim. The
/// sub-path is the directory with its leading separator stripped so the
/// directories coexist on one volume without colliding.
pub fn claim_mounts(persist_dirs: &[String]) -> Vec<corev1::VolumeMount> {
    persist_dirs
        .iter()
        .map(|dir| corev1::VolumeMount {
            name: PVC_NAME.to_string(),
            mount_path: dir.clone(),
            sub_path: Some(dir[1..].to_string()),
            read_only: Some(false),
            ..corev1::VolumeMount::default()
        })
        .collect()
}

/// Raw block devices surfaced at `<path><index>`, one per requested device,
/// each backed by its own block-mode claim.
pub fn block_volume_devices(block_storage: &BlockStorageSpec) -> Vec<corev1::VolumeDevice> {
    (0..block_storage.num_devices)
        .map(|index| corev1::VolumeDevice {
            name: format!("{}{}", BLOCK_PVC_NAME_PREFIX, index),
            device_path: format!("{}{}", block_storage.path, index),
        })
        .collect()
}

/// The single whole-volume mount used by the init container to populate
/// persistent storage.
pub fn init_volume_mounts() -> Vec<corev1::VolumeMount> {
    vec![corev1::VolumeMount {
        name: PVC_NAME.to_string(),
        mount_path: "/mnt".to_string(),
        read_only: Some(false),
        ..corev1::VolumeMount::default()
    }]
}

/// Memory-backed, size-capped volumes for /tmp, /run and /run/lock. Always
/// present, whether or not the role uses persistent storage.
fn tmpfs_support() -> (Vec<corev1::VolumeMount>, Vec<corev1::Volume>) {
    let names_and_paths = [
        ("tmpfs-tmp", "/tmp"),
        ("tmpfs-run", "/run"),
        ("tmpfs-run-lock", "/run/lock"),
    ];
    let mounts = names_and_paths
        .iter()
        .map(|(name, path)| corev1::VolumeMount {
            name: name.to_string(),
            mount_path: path.to_string(),
            ..corev1::VolumeMount::default()
        })
        .collect();
    let volumes = names_and_paths
        .iter()
        .map(|(name, _)| corev1::Volume {
            name: name.to_string(),
            empty_dir: Some(corev1::EmptyDirVolumeSource {
                medium: Some("Memory".to_string()),
                size_limit: Some(Quantity(TMPFS_VOL_SIZE.to_string())),
            }),
            ..corev1::Volume::default()
        })
        .collect();
    (mounts, volumes)
}

fn secret_volume(
    secret: Option<&SecretSpec>,
) -> (Vec<corev1::VolumeMount>, Vec<corev1::Volume>) {
    match secret {
        Some(secret) => {
            let volume_name = format!("secret-vol-{}", secret.name);
            (
                vec![corev1::VolumeMount {
                    name: volume_name.clone(),
                    mount_path: secret.mount_path.clone(),
                    read_only: Some(secret.read_only),
                    ..corev1::VolumeMount::default()
                }],
                vec![corev1::Volume {
                    name: volume_name,
                    secret: Some(corev1::SecretVolumeSource {
                        secret_name: Some(secret.name.clone()),
                        default_mode: secret.default_mode,
                        ..corev1::SecretVolumeSource::default()
                    }),
                    ..corev1::Volume::default()
                }],
            )
        }
        None => (vec![], vec![]),
    }
}

/// Volume names are derived from ordinal position, which keeps them unique
/// within the pod even when the same claim is projected twice.
fn projection_mount(
    index: usize,
    projection: &VolumeProjection,
) -> (corev1::VolumeMount, corev1::Volume) {
    let volume_name = format!("projected-vol-{}", index);
    (
        corev1::VolumeMount {
            name: volume_name.clone(),
            mount_path: projection.mount_path.clone(),
            read_only: Some(projection.read_only),
            ..corev1::VolumeMount::default()
        },
        corev1::Volume {
            name: volume_name,
            persistent_volume_claim: Some(corev1::PersistentVolumeClaimVolumeSource {
                claim_name: projection.pvc_name.clone(),
                read_only: Some(projection.read_only),
            }),
            ..corev1::Volume::default()
        },
    )
}

/// Host-path mounts of the cgroup filesystems, required for containers that
/// run systemd on platforms without native systemd support.
fn systemd_support() -> (Vec<corev1::VolumeMount>, Vec<corev1::Volume>) {
    let mounts = vec![
        corev1::VolumeMount {
            name: "cgroupfs".to_string(),
            mount_path: CGROUP_FS_PATH.to_string(),
            read_only: Some(true),
            ..corev1::VolumeMount::default()
        },
        corev1::VolumeMount {
            name: "systemd".to_string(),
            mount_path: SYSTEMD_FS_PATH.to_string(),
            ..corev1::VolumeMount::default()
        },
    ];
    let volumes = vec![
        corev1::Volume {
            name: "cgroupfs".to_string(),
            host_path: Some(corev1::HostPathVolumeSource {
                path: CGROUP_FS_PATH.to_string(),
                ..corev1::HostPathVolumeSource::default()
            }),
            ..corev1::Volume::default()
        },
        corev1::Volume {
            name: "systemd".to_string(),
            host_path: Some(corev1::HostPathVolumeSource {
                path: SYSTEMD_FS_PATH.to_string(),
                ..corev1::HostPathVolumeSource::default()
            }),
            ..corev1::Volume::default()
        },
    ];
    (mounts, volumes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::PortInfo;
    use crate::catalog::{RoleContainerSpec, SetupPackageInfo};
    use crate::vcluster_types::StorageSpec;

    struct FakeCatalog {
        systemd_required: bool,
    }

    impl Catalog for FakeCatalog {
        fn ports_for_role(&self, _: &str) -> Result<Vec<PortInfo>, CatalogError> {
            Ok(vec![])
        }
        fn persist_dirs_for_role(&self, _: &str) -> Result<Option<Vec<String>>, CatalogError> {
            Ok(None)
        }
        fn setup_package_for_role(
            &self,
            _: &str,
        ) -> Result<Option<SetupPackageInfo>, CatalogError> {
            Ok(None)
        }
        fn image_for_role(&self, _: &str) -> Result<String, CatalogError> {
            Ok("img".to_string())
        }
        fn capabilities(&self) -> Result<Vec<String>, CatalogError> {
            Ok(vec![])
        }
        fn systemd_required(&self) -> Result<bool, CatalogError> {
            Ok(self.systemd_required)
        }
        fn container_spec_for_role(
            &self,
            _: &str,
        ) -> Result<Option<RoleContainerSpec>, CatalogError> {
            Ok(None)
        }
    }

    fn role_with_storage() -> Role {
        Role {
            name: "server".to_string(),
            members: 1,
            resources: Default::default(),
            storage: Some(StorageSpec {
                size: "10Gi".to_string(),
                storage_class: None,
            }),
            block_storage: None,
            service_account_name: None,
            secret: None,
            volume_projections: vec![],
            affinity: None,
            env: vec![],
            persist_dirs: None,
        }
    }

    #[test]
    fn claim_mounts_share_one_claim_with_stripped_sub_paths() {
        let dirs = vec!["/etc".to_string(), "/home".to_string()];
        let mounts = claim_mounts(&dirs);
        assert_eq!(mounts.len(), 2);
        for mount in &mounts {
            assert_eq!(mount.name, PVC_NAME);
        }
        assert_eq!(mounts[0].sub_path.as_deref(), Some("etc"));
        assert_eq!(mounts[1].sub_path.as_deref(), Some("home"));
        assert_eq!(mounts[0].mount_path, "/etc");
        assert_eq!(mounts[1].mount_path, "/home");
    }

    #[test]
    fn block_devices_are_indexed_from_zero() {
        let devices = block_volume_devices(&BlockStorageSpec {
            num_devices: 3,
            size: None,
            storage_class: None,
            path: "/dev/xvd".to_string(),
        });
        assert_eq!(devices.len(), 3);
        assert_eq!(devices[0].name, "block-0");
        assert_eq!(devices[0].device_path, "/dev/xvd0");
        assert_eq!(devices[2].device_path, "/dev/xvd2");
    }

    #[test]
    fn tmpfs_volumes_always_present_even_without_storage() {
        let mut role = role_with_storage();
        role.storage = None;
        let catalog = FakeCatalog {
            systemd_required: false,
        };
        let (mounts, volumes) = volume_mounts_and_volumes(&role, &catalog, false, &[]).unwrap();
        let tmpfs: Vec<_> = mounts.iter().filter(|m| m.name.starts_with("tmpfs-")).collect();
        assert_eq!(tmpfs.len(), 3);
        assert!(volumes
            .iter()
            .all(|v| v.empty_dir.as_ref().map_or(true, |e| e.medium.as_deref()
                == Some("Memory"))));
    }

    #[test]
    fn secret_volume_name_is_derived_from_secret_name() {
        let mut role = role_with_storage();
        role.secret = Some(SecretSpec {
            name: "creds".to_string(),
            mount_path: "/secrets".to_string(),
            read_only: true,
            default_mode: Some(0o400),
        });
        let catalog = FakeCatalog {
            systemd_required: false,
        };
        let (mounts, volumes) =
            volume_mounts_and_volumes(&role, &catalog, false, &["/etc".to_string()]).unwrap();
        let secret_mount = mounts.iter().find(|m| m.name == "secret-vol-creds").unwrap();
        assert_eq!(secret_mount.mount_path, "/secrets");
        assert_eq!(secret_mount.read_only, Some(true));
        assert!(volumes.iter().any(|v| v.name == "secret-vol-creds"));
    }

    #[test]
    fn projected_volume_names_are_ordinal() {
        let mut role = role_with_storage();
        role.volume_projections = vec![
            VolumeProjection {
                pvc_name: "shared-a".to_string(),
                mount_path: "/proj/a".to_string(),
                read_only: true,
            },
            VolumeProjection {
                pvc_name: "shared-a".to_string(),
                mount_path: "/proj/b".to_string(),
                read_only: false,
            },
        ];
        let catalog = FakeCatalog {
            systemd_required: false,
        };
        let (mounts, volumes) =
            volume_mounts_and_volumes(&role, &catalog, false, &[]).unwrap();
        assert!(mounts.iter().any(|m| m.name == "projected-vol-0"));
        assert!(mounts.iter().any(|m| m.name == "projected-vol-1"));
        // Same claim projected twice still yields unique volume names.
        assert_eq!(
            volumes
                .iter()
                .filter(|v| v.persistent_volume_claim.is_some())
                .count(),
            2
        );
    }

    #[test]
    fn systemd_passthrough_only_when_required_and_not_native() {
        let role = role_with_storage();
        let required = FakeCatalog {
            systemd_required: true,
        };
        let not_required = FakeCatalog {
            systemd_required: false,
        };

        let (mounts, _) = volume_mounts_and_volumes(&role, &required, false, &[]).unwrap();
        assert!(mounts.iter().any(|m| m.name == "cgroupfs"));
        assert!(mounts.iter().any(|m| m.name == "systemd"));

        let (mounts, _) = volume_mounts_and_volumes(&role, &required, true, &[]).unwrap();
        assert!(!mounts.iter().any(|m| m.name == "cgroupfs"));

        let (mounts, _) = volume_mounts_and_volumes(&role, &not_required, false, &[]).unwrap();
        assert!(!mounts.iter().any(|m| m.name == "cgroupfs"));
    }
}
