//! Thin seam over the orchestration API's statefulset operations. The
//! reconciler talks to this trait so conflict handling can be exercised
//! against a scripted fake.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::core::ErrorResponse;

#[async_trait]
pub trait StatefulSets: Send + Sync {
    async fn create(&self, sts: &StatefulSet) -> Result<StatefulSet, kube::Error>;
    async fn get(&self, name: &str) -> Result<StatefulSet, kube::Error>;
    async fn replace(&self, name: &str, sts: &StatefulSet) -> Result<StatefulSet, kube::Error>;
    async fn patch_metadata(
        &self,
        name: &str,
        patch: serde_json::Value,
    ) -> Result<StatefulSet, kube::Error>;
    async fn delete(&self, name: &str) -> Result<(), kube::Error>;
}

/// Production implementation backed by a namespaced Api handle.
pub struct KubeStatefulSets {
    api: Api<StatefulSet>,
}

impl KubeStatefulSets {
    pub fn new(api: Api<StatefulSet>) -> Self {
        KubeStatefulSets { api }
    }
}

#[async_trait]
impl StatefulSets for KubeStatefulSets {
    async fn create(&self, sts: &StatefulSet) -> Result<StatefulSet, kube::Error> {
        self.api.create(&PostParams::default(), sts).await
    }

    async fn get(&self, name: &str) -> Result<StatefulSet, kube::Error> {
        self.api.get(name).await
    }

    async fn replace(&self, name: &str, sts: &StatefulSet) -> Result<StatefulSet, kube::Error> {
        self.api.replace(name, &PostParams::default(), sts).await
    }

    async fn patch_metadata(
        &self,
        name: &str,
        patch: serde_json::Value,
    ) -> Result<StatefulSet, kube::Error> {
        self.api
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
    }

    async fn delete(&self, name: &str) -> Result<(), kube::Error> {
        self.api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }
}

/// An update rejected because the object changed since it was last read.
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ErrorResponse { reason, .. }) if reason == "Conflict")
}

pub fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ErrorResponse { reason, .. }) if reason == "AlreadyExists")
}
