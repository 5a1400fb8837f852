//! Resource lookup against the orchestration control plane.
//!
//! The [`Locator`] turns a logical reference (namespace plus label selector,
//! or namespace plus claim name) into something a [`Transport`] can act on.
//! Lookups are read-only.
//!
//! [`Transport`]: crate::transfer::Transport

pub mod kubectl;

use crate::transfer::Target;
use crate::utils::{DrError, Result};
use async_trait::async_trait;
use std::fmt;

pub use kubectl::{Kubectl, KubectlSettings};

/// Container that runs postgres in CNPG instance pods.
pub const CNPG_CONTAINER: &str = "postgres";

/// Read-only queries the locator needs from the cluster.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Names of running pods matching `selector`, in API listing order.
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<String>>;

    /// Node and backing path of the volume bound to `claim`, if it has one.
    async fn volume_binding(&self, namespace: &str, claim: &str) -> Result<Option<VolumeBinding>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeBinding {
    pub node: String,
    pub path: String,
}

/// A logical resource reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    Pod {
        namespace: String,
        labels: String,
        container: Option<String>,
    },
    Claim {
        namespace: String,
        claim: String,
    },
}

impl Selector {
    pub fn pod(
        namespace: impl Into<String>,
        labels: impl Into<String>,
        container: Option<String>,
    ) -> Self {
        Selector::Pod {
            namespace: namespace.into(),
            labels: labels.into(),
            container,
        }
    }

    pub fn claim(namespace: impl Into<String>, claim: impl Into<String>) -> Self {
        Selector::Claim {
            namespace: namespace.into(),
            claim: claim.into(),
        }
    }

    /// The primary instance of a CNPG database cluster.
    pub fn cnpg_primary(namespace: &str, cluster: &str) -> Self {
        Selector::pod(
            namespace,
            format!("cnpg.io/cluster={cluster},cnpg.io/instanceRole=primary"),
            Some(CNPG_CONTAINER.to_string()),
        )
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Pod { namespace, labels, .. } => write!(f, "pods -n {namespace} -l {labels}"),
            Selector::Claim { namespace, claim } => write!(f, "pvc {namespace}/{claim}"),
        }
    }
}

/// A resolved selector: a pod, or a node plus the volume's backing path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Pod(Target),
    Volume { target: Target, node: String, path: String },
}

impl Location {
    pub fn target(&self) -> &Target {
        match self {
            Location::Pod(target) => target,
            Location::Volume { target, .. } => target,
        }
    }
}

pub struct Locator<'a> {
    api: &'a dyn ClusterApi,
    strict: bool,
}

impl<'a> Locator<'a> {
    /// With `strict`, a pod selector matching more than one pod is an error
    /// instead of resolving to the first match.
    pub fn new(api: &'a dyn ClusterApi, strict: bool) -> Self {
        Self { api, strict }
    }

    pub async fn locate(&self, selector: &Selector) -> Result<Location> {
        match selector {
            Selector::Pod {
                namespace,
                labels,
                container,
            } => {
                let pods = self.api.list_pods(namespace, labels).await?;
                let pod = self.pick(selector, pods)?;
                Ok(Location::Pod(Target::pod(namespace.as_str(), pod, container.clone())))
            }
            Selector::Claim { namespace, claim } => {
                let binding = self.volume(namespace, claim).await?;
                Ok(Location::Volume {
                    target: Target::node(binding.node.as_str()),
                    node: binding.node,
                    path: binding.path,
                })
            }
        }
    }

    /// Resolve a pod selector straight to its target.
    pub async fn pod(&self, selector: &Selector) -> Result<Target> {
        Ok(self.locate(selector).await?.target().clone())
    }

    /// Resolve a claim to its node and backing path.
    pub async fn volume(&self, namespace: &str, claim: &str) -> Result<VolumeBinding> {
        self.api
            .volume_binding(namespace, claim)
            .await?
            .ok_or_else(|| DrError::ResourceNotFound(Selector::claim(namespace, claim).to_string()))
    }

    fn pick(&self, selector: &Selector, mut pods: Vec<String>) -> Result<String> {
        match pods.len() {
            0 => Err(DrError::ResourceNotFound(selector.to_string())),
            1 => Ok(pods.remove(0)),
            n if self.strict => Err(DrError::AmbiguousSelector {
                selector: selector.to_string(),
                matches: n,
            }),
            n => {
                tracing::warn!(
                    %selector,
                    matches = n,
                    chosen = %pods[0],
                    "Selector matched several pods, using the first"
                );
                Ok(pods.remove(0))
            }
        }
    }
}
