#![allow(clippy::unnecessary_lazy_evaluations)]

pub mod bootstrap;
pub mod catalog;
pub mod client;
pub mod common;
pub mod persist_dirs;
pub mod reconcile;
pub mod statefulset;
pub mod vcluster_types;
pub mod volumes;

use thiserror::Error;

use crate::catalog::CatalogError;

/// Errors surfaced by statefulset synthesis and reconciliation. Client
/// failures carry the operation and the statefulset identity so callers can
/// log them with context.
#[derive(Debug, Error)]
pub enum Error {
    #[error("catalog lookup failed: {0}")]
    CatalogLookupFailed(#[from] CatalogError),

    #[error("failed to create statefulset {name}: {source}")]
    CreateStatefulSetFailed {
        name: String,
        #[source]
        source: kube::Error,
    },

    #[error("failed to retrieve statefulset {name}: {source}")]
    GetStatefulSetFailed {
        name: String,
        #[source]
        source: kube::Error,
    },

    #[error("failed to update statefulset {name}: {source}")]
    UpdateStatefulSetFailed {
        name: String,
        #[source]
        source: kube::Error,
    },

    #[error("failed to repair owner references on statefulset {name}: {source}")]
    OwnerRepairFailed {
        name: String,
        #[source]
        source: kube::Error,
    },

    #[error("failed to delete statefulset {name}: {source}")]
    DeleteStatefulSetFailed {
        name: String,
        #[source]
        source: kube::Error,
    },

    #[error("MissingObjectKey: {0}")]
    MissingObjectKey(&'static str),
}
