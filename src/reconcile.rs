//! Lifecycle operations on a role's statefulset: create, scale with a
//! single conflict retry, owner-reference drift repair, and delete.

use k8s_openapi::api::apps::v1::StatefulSet;
use serde_json::json;
use tracing::{info, warn};

use crate::catalog::Catalog;
use crate::client::{is_already_exists, is_conflict, StatefulSets};
use crate::common::{owner_references, owner_references_present};
use crate::statefulset::make_statefulset;
use crate::vcluster_types::{Role, RoleStatus, VirtualCluster};
use crate::Error;

/// Retry behavior scoped to one operation. The default everywhere is no
/// retry; the only sanctioned exception is a single extra attempt after an
/// optimistic-concurrency conflict during a replica update. Anything beyond
/// that belongs to the outer control loop's requeue.
pub struct RetryPolicy {
    max_attempts: u32,
    retryable: fn(&kube::Error) -> bool,
}

impl RetryPolicy {
    pub fn conflict_only() -> Self {
        RetryPolicy {
            max_attempts: 2,
            retryable: is_conflict,
        }
    }

    pub fn none() -> Self {
        RetryPolicy {
            max_attempts: 1,
            retryable: |_| false,
        }
    }

    /// True if the attempt that just failed with `err` may be repeated.
    /// `attempt` counts from zero.
    pub fn should_retry(&self, attempt: u32, err: &kube::Error) -> bool {
        attempt + 1 < self.max_attempts && (self.retryable)(err)
    }
}

/// Synthesizes the role's statefulset at zero replicas and submits it as
/// new. Already-exists is surfaced like any other failure; the caller owns
/// deciding whether that is fatal. Returns the created object so the caller
/// can record the assigned name in the role status.
pub async fn create_stateful_set(
    sts_client: &dyn StatefulSets,
    cluster: &VirtualCluster,
    role: &Role,
    role_status: Option<&RoleStatus>,
    catalog: &dyn Catalog,
    native_systemd_support: bool,
) -> Result<StatefulSet, Error> {
    let sts = make_statefulset(cluster, role, role_status, catalog, native_systemd_support, 0)?;
    let name = sts
        .metadata
        .name
        .clone()
        .or_else(|| sts.metadata.generate_name.clone())
        .unwrap_or_default();
    sts_client.create(&sts).await.map_err(|source| {
        if is_already_exists(&source) {
            warn!(
                statefulset = name.as_str(),
                "statefulset already exists; surfacing to the outer loop"
            );
        }
        Error::CreateStatefulSetFailed { name, source }
    })
}

/// Sets the desired replica count on an already-fetched statefulset and
/// submits it. On a resource-version conflict the current object is
/// refetched by identity and the update retried exactly once; a second
/// conflict, or any other failure, is fatal for this call.
pub async fn update_stateful_set_replicas(
    sts_client: &dyn StatefulSets,
    replicas: i32,
    sts: &mut StatefulSet,
) -> Result<(), Error> {
    let name = sts
        .metadata
        .name
        .clone()
        .ok_or(Error::MissingObjectKey(".metadata.name"))?;
    let policy = RetryPolicy::conflict_only();
    let mut attempt = 0;

    loop {
        sts.spec
            .as_mut()
            .ok_or(Error::MissingObjectKey(".spec"))?
            .replicas = Some(replicas);
        match sts_client.replace(&name, sts).await {
            Ok(updated) => {
                *sts = updated;
                return Ok(());
            }
            Err(err) if policy.should_retry(attempt, &err) => {
                warn!(
                    statefulset = name.as_str(),
                    "replica update hit a resource-version conflict; refetching and retrying"
                );
                *sts = sts_client.get(&name).await.map_err(|source| {
                    Error::GetStatefulSetFailed {
                        name: name.clone(),
                        source,
                    }
                })?;
                attempt += 1;
            }
            Err(source) => {
                return Err(Error::UpdateStatefulSetFailed { name, source });
            }
        }
    }
}

/// Repairs ownership drift on a live statefulset. The only property this
/// corrects is the owner-reference list: when the parent cluster is no
/// longer among the owners the whole list is replaced with the canonical
/// set. A stale partial-ownership state (bad backup/restore, another
/// controller's leftover ref) is reset wholesale rather than merged.
pub async fn update_stateful_set_non_replicas(
    sts_client: &dyn StatefulSets,
    cluster: &VirtualCluster,
    sts: &StatefulSet,
) -> Result<(), Error> {
    if owner_references_present(cluster, sts.metadata.owner_references.as_ref()) {
        return Ok(());
    }
    let name = sts
        .metadata
        .name
        .clone()
        .ok_or(Error::MissingObjectKey(".metadata.name"))?;
    info!(
        statefulset = name.as_str(),
        "repairing owner references on statefulset"
    );
    let patch = json!({
        "metadata": { "ownerReferences": owner_references(cluster) }
    });
    sts_client
        .patch_metadata(&name, patch)
        .await
        .map_err(|source| Error::OwnerRepairFailed { name, source })?;
    Ok(())
}

/// Deletes a statefulset by identity. Errors, including not-found,
/// propagate to the caller.
pub async fn delete_stateful_set(
    sts_client: &dyn StatefulSets,
    name: &str,
) -> Result<(), Error> {
    sts_client
        .delete(name)
        .await
        .map_err(|source| Error::DeleteStatefulSetFailed {
            name: name.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogError, PortInfo, RoleContainerSpec, SetupPackageInfo};
    use crate::vcluster_types::{NamingScheme, StorageSpec, VirtualClusterSpec};
    use async_trait::async_trait;
    use kube::api::ObjectMeta;
    use kube::core::ErrorResponse;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn conflict() -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "the object has been modified".to_string(),
            reason: "Conflict".to_string(),
            code: 409,
        })
    }

    fn already_exists() -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "statefulsets.apps already exists".to_string(),
            reason: "AlreadyExists".to_string(),
            code: 409,
        })
    }

    #[derive(Default)]
    struct FakeStatefulSets {
        live: Mutex<StatefulSet>,
        replace_errors: Mutex<VecDeque<kube::Error>>,
        create_errors: Mutex<VecDeque<kube::Error>>,
        get_count: Mutex<u32>,
        replace_count: Mutex<u32>,
        patched: Mutex<Option<serde_json::Value>>,
        delete_errors: Mutex<VecDeque<kube::Error>>,
    }

    #[async_trait]
    impl StatefulSets for FakeStatefulSets {
        async fn create(&self, sts: &StatefulSet) -> Result<StatefulSet, kube::Error> {
            if let Some(err) = self.create_errors.lock().unwrap().pop_front() {
                return Err(err);
            }
            let mut created = sts.clone();
            if created.metadata.name.is_none() {
                let prefix = created.metadata.generate_name.clone().unwrap_or_default();
                created.metadata.name = Some(format!("{}abcde", prefix));
            }
            *self.live.lock().unwrap() = created.clone();
            Ok(created)
        }

        async fn get(&self, _name: &str) -> Result<StatefulSet, kube::Error> {
            *self.get_count.lock().unwrap() += 1;
            Ok(self.live.lock().unwrap().clone())
        }

        async fn replace(&self, _name: &str, sts: &StatefulSet) -> Result<StatefulSet, kube::Error> {
            *self.replace_count.lock().unwrap() += 1;
            if let Some(err) = self.replace_errors.lock().unwrap().pop_front() {
                return Err(err);
            }
            *self.live.lock().unwrap() = sts.clone();
            Ok(sts.clone())
        }

        async fn patch_metadata(
            &self,
            _name: &str,
            patch: serde_json::Value,
        ) -> Result<StatefulSet, kube::Error> {
            *self.patched.lock().unwrap() = Some(patch);
            Ok(self.live.lock().unwrap().clone())
        }

        async fn delete(&self, _name: &str) -> Result<(), kube::Error> {
            if let Some(err) = self.delete_errors.lock().unwrap().pop_front() {
                return Err(err);
            }
            Ok(())
        }
    }

    struct FakeCatalog;

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
            Ok("registry.example.com/app:1".to_string())
        }
        fn capabilities(&self) -> Result<Vec<String>, CatalogError> {
            Ok(vec![])
        }
        fn systemd_required(&self) -> Result<bool, CatalogError> {
            Ok(false)
        }
        fn container_spec_for_role(
            &self,
            _: &str,
        ) -> Result<Option<RoleContainerSpec>, CatalogError> {
            Ok(None)
        }
    }

    fn cluster() -> VirtualCluster {
        let mut vc = VirtualCluster::new(
            "demo",
            VirtualClusterSpec {
                app: "spark".to_string(),
                naming_scheme: NamingScheme::CrNameRole,
                roles: vec![role()],
            },
        );
        vc.metadata.namespace = Some("default".to_string());
        vc.metadata.uid = Some("abc-123".to_string());
        vc
    }

    fn role() -> Role {
        Role {
            name: "worker".to_string(),
            members: 3,
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

    fn live_sts(name: &str, replicas: i32) -> StatefulSet {
        StatefulSet {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..ObjectMeta::default()
            },
            spec: Some(k8s_openapi::api::apps::v1::StatefulSetSpec {
                replicas: Some(replicas),
                ..Default::default()
            }),
            ..StatefulSet::default()
        }
    }

    #[tokio::test]
    async fn scale_update_recovers_from_one_conflict() {
        let fake = FakeStatefulSets::default();
        *fake.live.lock().unwrap() = live_sts("demo-worker-abcde", 1);
        fake.replace_errors.lock().unwrap().push_back(conflict());

        let mut sts = live_sts("demo-worker-abcde", 1);
        update_stateful_set_replicas(&fake, 5, &mut sts).await.unwrap();

        assert_eq!(*fake.get_count.lock().unwrap(), 1);
        assert_eq!(*fake.replace_count.lock().unwrap(), 2);
        assert_eq!(sts.spec.as_ref().unwrap().replicas, Some(5));
        assert_eq!(
            fake.live.lock().unwrap().spec.as_ref().unwrap().replicas,
            Some(5)
        );
    }

    #[tokio::test]
    async fn scale_update_gives_up_after_second_conflict() {
        let fake = FakeStatefulSets::default();
        *fake.live.lock().unwrap() = live_sts("demo-worker-abcde", 1);
        {
            let mut errors = fake.replace_errors.lock().unwrap();
            errors.push_back(conflict());
            errors.push_back(conflict());
        }

        let mut sts = live_sts("demo-worker-abcde", 1);
        let result = update_stateful_set_replicas(&fake, 5, &mut sts).await;

        assert!(matches!(
            result,
            Err(Error::UpdateStatefulSetFailed { .. })
        ));
        // Exactly one refetch and no third attempt.
        assert_eq!(*fake.get_count.lock().unwrap(), 1);
        assert_eq!(*fake.replace_count.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn non_conflict_failure_is_not_retried() {
        let fake = FakeStatefulSets::default();
        fake.replace_errors
            .lock()
            .unwrap()
            .push_back(already_exists());

        let mut sts = live_sts("demo-worker-abcde", 1);
        let result = update_stateful_set_replicas(&fake, 5, &mut sts).await;

        assert!(matches!(
            result,
            Err(Error::UpdateStatefulSetFailed { .. })
        ));
        assert_eq!(*fake.get_count.lock().unwrap(), 0);
        assert_eq!(*fake.replace_count.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn create_submits_at_zero_replicas_and_returns_assigned_name() {
        let fake = FakeStatefulSets::default();
        let created = create_stateful_set(&fake, &cluster(), &role(), None, &FakeCatalog, false)
            .await
            .unwrap();
        assert_eq!(created.metadata.name.as_deref(), Some("demo-worker-abcde"));
        assert_eq!(created.spec.as_ref().unwrap().replicas, Some(0));
    }

    #[tokio::test]
    async fn create_surfaces_already_exists() {
        let fake = FakeStatefulSets::default();
        fake.create_errors
            .lock()
            .unwrap()
            .push_back(already_exists());
        let result =
            create_stateful_set(&fake, &cluster(), &role(), None, &FakeCatalog, false).await;
        match result {
            Err(Error::CreateStatefulSetFailed { source, .. }) => {
                assert!(is_already_exists(&source));
            }
            other => panic!("expected CreateStatefulSetFailed, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn owner_repair_resets_references_wholesale() {
        let fake = FakeStatefulSets::default();
        let sts = live_sts("demo-worker-abcde", 1);
        update_stateful_set_non_replicas(&fake, &cluster(), &sts)
            .await
            .unwrap();

        let patch = fake.patched.lock().unwrap().clone().unwrap();
        let refs = patch["metadata"]["ownerReferences"].as_array().unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0]["uid"], "abc-123");
        assert_eq!(refs[0]["kind"], "VirtualCluster");
    }

    #[tokio::test]
    async fn owner_repair_is_a_no_op_when_reference_present() {
        let fake = FakeStatefulSets::default();
        let cluster = cluster();
        let mut sts = live_sts("demo-worker-abcde", 1);
        sts.metadata.owner_references = Some(owner_references(&cluster));
        update_stateful_set_non_replicas(&fake, &cluster, &sts)
            .await
            .unwrap();
        assert!(fake.patched.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_propagates_errors() {
        let fake = FakeStatefulSets::default();
        fake.delete_errors.lock().unwrap().push_back(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "not found".to_string(),
            reason: "NotFound".to_string(),
            code: 404,
        }));
        let result = delete_stateful_set(&fake, "demo-worker-abcde").await;
        assert!(matches!(result, Err(Error::DeleteStatefulSetFailed { .. })));

        assert!(delete_stateful_set(&fake, "demo-worker-abcde").await.is_ok());
    }

    #[test]
    fn retry_policy_none_never_retries() {
        let policy = RetryPolicy::none();
        assert!(!policy.should_retry(0, &conflict()));
    }

    #[test]
    fn conflict_policy_allows_exactly_one_retry() {
        let policy = RetryPolicy::conflict_only();
        assert!(policy.should_retry(0, &conflict()));
        assert!(!policy.should_retry(1, &conflict()));
        assert!(!policy.should_retry(0, &already_exists()));
    }
}
