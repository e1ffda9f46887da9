#![allow(clippy::unnecessary_lazy_evaluations)]

use anyhow::Result;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::{
    api::{Api, Patch, PatchParams},
    runtime::controller::{Action, Controller},
    Client, CustomResourceExt,
};
use serde_json::json;
use std::{env, sync::Arc};
use thiserror::Error;
use tokio::time::Duration;
use tracing::*;

use vcluster_controller::catalog::{AppCatalog, VirtualClusterApp};
use vcluster_controller::client::{KubeStatefulSets, StatefulSets};
use vcluster_controller::reconcile::{
    create_stateful_set, update_stateful_set_non_replicas, update_stateful_set_replicas,
};
use vcluster_controller::vcluster_types::{RoleStatus, VirtualCluster};

#[derive(Debug, Error)]
enum Error {
    #[error("Failed to get CR: {0}")]
    CRGetFailed(#[source] kube::Error),
    #[error("Failed to get app catalog entry: {0}")]
    AppGetFailed(#[source] kube::Error),
    #[error("Failed to update cluster status: {0}")]
    StatusUpdateFailed(#[source] kube::Error),
    #[error(transparent)]
    Reconcile(#[from] vcluster_controller::Error),
    #[error("MissingObjectKey: {0}")]
    MissingObjectKey(&'static str),
}

// Data we want access to in error/reconcile calls
struct Data {
    client: Client,
    native_systemd_support: bool,
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(kube::core::ErrorResponse { reason, .. }) if reason == "NotFound")
}

/// Controller triggers this whenever our main object or our children changed
async fn reconcile(vc_from_cache: Arc<VirtualCluster>, ctx: Arc<Data>) -> Result<Action, Error> {
    let client = &ctx.client;

    let vc_name = vc_from_cache
        .metadata
        .name
        .as_ref()
        .ok_or_else(|| Error::MissingObjectKey(".metadata.name"))?;
    let vc_ns = vc_from_cache
        .metadata
        .namespace
        .as_ref()
        .ok_or_else(|| Error::MissingObjectKey(".metadata.namespace"))?;

    let vc_api = Api::<VirtualCluster>::namespaced(client.clone(), vc_ns);

    // Get the VirtualCluster custom resource before taking any
    // reconciliation actions.
    let vc = match vc_api.get(vc_name).await {
        Err(e) if is_not_found(&e) => {
            info!("{} not found, end reconcile", vc_name);
            return Ok(Action::await_change());
        }
        Err(e) => return Err(Error::CRGetFailed(e)),
        Ok(vc) => vc,
    };

    let app_api = Api::<VirtualClusterApp>::namespaced(client.clone(), vc_ns);
    let app = app_api
        .get(&vc.spec.app)
        .await
        .map_err(Error::AppGetFailed)?;
    let catalog = AppCatalog::new(app);

    let sts_client =
        KubeStatefulSets::new(Api::<StatefulSet>::namespaced(client.clone(), vc_ns));

    let mut role_statuses: Vec<RoleStatus> = Vec::new();
    let mut status_changed = false;
    for role in &vc.spec.roles {
        let stored = vc.role_status(&role.name).cloned();
        let assigned = match &stored {
            Some(status) if !status.stateful_set.is_empty() => {
                match sts_client.get(&status.stateful_set).await {
                    Ok(mut sts) => {
                        update_stateful_set_replicas(&sts_client, role.members, &mut sts).await?;
                        update_stateful_set_non_replicas(&sts_client, &vc, &sts).await?;
                        status.stateful_set.clone()
                    }
                    Err(e) if is_not_found(&e) => {
                        // The recorded statefulset is gone; recreate it
                        // under the stored identity.
                        info!(
                            cluster = vc_name.as_str(),
                            role = role.name.as_str(),
                            "recorded statefulset missing, recreating"
                        );
                        let created = create_stateful_set(
                            &sts_client,
                            &vc,
                            role,
                            stored.as_ref(),
                            &catalog,
                            ctx.native_systemd_support,
                        )
                        .await?;
                        created.metadata.name.clone().unwrap_or_default()
                    }
                    Err(e) => {
                        return Err(vcluster_controller::Error::GetStatefulSetFailed {
                            name: status.stateful_set.clone(),
                            source: e,
                        }
                        .into())
                    }
                }
            }
            _ => {
                info!(
                    cluster = vc_name.as_str(),
                    role = role.name.as_str(),
                    "creating statefulset for role"
                );
                let created = create_stateful_set(
                    &sts_client,
                    &vc,
                    role,
                    None,
                    &catalog,
                    ctx.native_systemd_support,
                )
                .await?;
                status_changed = true;
                created.metadata.name.clone().unwrap_or_default()
            }
        };
        role_statuses.push(RoleStatus {
            name: role.name.clone(),
            stateful_set: assigned,
        });
    }

    if status_changed {
        vc_api
            .patch_status(
                vc_name,
                &PatchParams::default(),
                &Patch::Merge(json!({ "status": { "roles": role_statuses } })),
            )
            .await
            .map_err(Error::StatusUpdateFailed)?;
    }

    Ok(Action::requeue(Duration::from_secs(60)))
}

/// The controller triggers this on reconcile errors
fn error_policy(_object: Arc<VirtualCluster>, error: &Error, _ctx: Arc<Data>) -> Action {
    warn!("Reconcile failed due to error: {}", error);
    Action::requeue(Duration::from_secs(10))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = env::args().collect();
    let cmd = args[1].clone();
    if cmd == String::from("export") {
        info!("exporting custom resource definitions");
        println!("{}", serde_yaml::to_string(&VirtualCluster::crd())?);
        println!("{}", serde_yaml::to_string(&VirtualClusterApp::crd())?);
    } else if cmd == String::from("run") {
        info!("running vcluster-controller");
        let native_systemd_support = env::var("VC_NATIVE_SYSTEMD")
            .map(|v| v == "true")
            .unwrap_or(false);
        let client = Client::try_default().await?;
        let vcs = Api::<VirtualCluster>::all(client.clone());

        Controller::new(vcs, kube::runtime::watcher::Config::default())
            .shutdown_on_signal()
            .run(
                reconcile,
                error_policy,
                Arc::new(Data {
                    client,
                    native_systemd_support,
                }),
            )
            .for_each(|res| async move {
                match res {
                    Ok(o) => info!("reconciled {:?}", o),
                    Err(e) => warn!("reconcile failed: {}", e),
                }
            })
            .await;
        info!("controller terminated");
    } else {
        warn!("wrong command; please use \"export\" or \"run\"");
    }
    Ok(())
}
