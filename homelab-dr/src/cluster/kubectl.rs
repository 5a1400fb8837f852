//! [`ClusterApi`] backed by the `kubectl` binary and its JSON output.

use crate::cluster::{ClusterApi, VolumeBinding};
use crate::transfer::process;
use crate::utils::{DrError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubectlSettings {
    /// kubectl binary name or path
    #[serde(default = "default_binary")]
    pub binary: String,

    /// kubeconfig context; the current context is used when unset
    #[serde(default)]
    pub context: Option<String>,
}

fn default_binary() -> String {
    "kubectl".to_string()
}

impl Default for KubectlSettings {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            context: None,
        }
    }
}

impl KubectlSettings {
    /// Base `kubectl` invocation with the context applied.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        if let Some(context) = &self.context {
            cmd.args(["--context", context.as_str()]);
        }
        cmd
    }

    /// Fail early when the binary cannot be found on `PATH`.
    pub fn ensure_available(&self) -> Result<()> {
        which::which(&self.binary)
            .map(|_| ())
            .map_err(|e| DrError::ToolUnavailable(format!("{}: {e}", self.binary)))
    }
}

pub struct Kubectl {
    settings: KubectlSettings,
}

impl Kubectl {
    pub fn new(settings: KubectlSettings) -> Self {
        Self { settings }
    }

    async fn get_json(&self, args: &[&str]) -> Result<Vec<u8>> {
        let mut cmd = self.settings.command();
        cmd.arg("get").args(args).args(["-o", "json"]);
        process::capture(cmd, "kubectl").await
    }
}

#[async_trait]
impl ClusterApi for Kubectl {
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<String>> {
        let out = self
            .get_json(&[
                "pods",
                "-n",
                namespace,
                "-l",
                selector,
                "--field-selector=status.phase=Running",
            ])
            .await?;
        parse_pod_names(&out)
    }

    async fn volume_binding(&self, namespace: &str, claim: &str) -> Result<Option<VolumeBinding>> {
        let pvc = match self.get_json(&["pvc", "-n", namespace, claim]).await {
            Ok(out) => out,
            Err(DrError::TransferFailure { message, .. }) if message.contains("NotFound") => {
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let Some(volume_name) = parse_claim_volume(&pvc)? else {
            return Ok(None);
        };

        let pv = self.get_json(&["pv", volume_name.as_str()]).await?;
        parse_volume_binding(&pv)
    }
}

#[derive(Deserialize)]
struct List<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Deserialize)]
struct Object<S> {
    metadata: Metadata,
    #[serde(default)]
    spec: Option<S>,
}

#[derive(Deserialize)]
struct Metadata {
    name: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ClaimSpec {
    #[serde(default)]
    volume_name: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct VolumeSpec {
    #[serde(default)]
    local: Option<PathSource>,
    #[serde(default)]
    host_path: Option<PathSource>,
    #[serde(default)]
    node_affinity: Option<NodeAffinity>,
}

#[derive(Deserialize)]
struct PathSource {
    path: String,
}

#[derive(Deserialize)]
struct NodeAffinity {
    #[serde(default)]
    required: Option<NodeSelector>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeSelector {
    #[serde(default)]
    node_selector_terms: Vec<NodeSelectorTerm>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeSelectorTerm {
    #[serde(default)]
    match_expressions: Vec<MatchExpression>,
}

#[derive(Deserialize)]
struct MatchExpression {
    key: String,
    #[serde(default)]
    values: Vec<String>,
}

const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

fn parse_pod_names(json: &[u8]) -> Result<Vec<String>> {
    let list: List<Object<serde_json::Value>> = serde_json::from_slice(json)?;
    Ok(list.items.into_iter().map(|p| p.metadata.name).collect())
}

fn parse_claim_volume(json: &[u8]) -> Result<Option<String>> {
    let claim: Object<ClaimSpec> = serde_json::from_slice(json)?;
    Ok(claim
        .spec
        .and_then(|s| s.volume_name)
        .filter(|name| !name.is_empty()))
}

/// Node and backing path of a local-path or hostPath volume.
fn parse_volume_binding(json: &[u8]) -> Result<Option<VolumeBinding>> {
    let pv: Object<VolumeSpec> = serde_json::from_slice(json)?;
    let Some(spec) = pv.spec else {
        return Ok(None);
    };

    let Some(path) = spec.local.or(spec.host_path).map(|s| s.path) else {
        return Ok(None);
    };

    let node = spec
        .node_affinity
        .and_then(|a| a.required)
        .into_iter()
        .flat_map(|r| r.node_selector_terms)
        .flat_map(|t| t.match_expressions)
        .find(|e| e.key == HOSTNAME_LABEL)
        .and_then(|e| e.values.into_iter().next());

    Ok(node.map(|node| VolumeBinding { node, path }))
}
