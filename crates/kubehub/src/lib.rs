//! kiln kubehub: everything that talks to a real API server.
//!
//! - [`KubeBackend`]: the store backend over `Api<DynamicObject>`
//! - [`KubeEvents`]: event sink publishing through kube's `Recorder`
//! - [`watch`]: watchers turning cluster changes into work-queue keys
//! - [`LeaseKeeper`]: the namespace lock held by local operators

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use kube::Client;

pub mod backend;
pub mod events;
pub mod lease;
pub mod watch;

pub use backend::KubeBackend;
pub use events::KubeEvents;
pub use lease::LeaseKeeper;
pub use watch::{Queues, Watchers};

/// Client from the ambient kubeconfig or in-cluster service account.
pub async fn connect() -> Result<Client> {
    Client::try_default().await.context("building kube client")
}
