use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Container, Node, Pod, PodSpec as K8sPodSpec, SecurityContext};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use std::collections::BTreeMap;

use crate::error::Result;
use crate::prepull::PodSpec;

/// What the prepuller needs to know about a node.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub unschedulable: bool,
    pub no_schedule_taint: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    pub fn from_str(phase: &str) -> PodPhase {
        match phase {
            "Pending" => PodPhase::Pending,
            "Running" => PodPhase::Running,
            "Succeeded" => PodPhase::Succeeded,
            "Failed" => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PodPhase::Succeeded | PodPhase::Failed)
    }
}

/// The slice of the cluster API the core needs: node inventory and the pod
/// lifecycle, nothing else. Tests drive the prepuller through an in-memory
/// implementation.
#[async_trait]
pub trait ClusterApi: Send + Sync + 'static {
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>>;

    /// Create the pod and return its name.
    async fn create_pod(&self, namespace: &str, spec: &PodSpec) -> Result<String>;

    async fn pod_phase(&self, namespace: &str, name: &str) -> Result<PodPhase>;

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;

    /// All pods in the namespace, with their phases.
    async fn list_pods(&self, namespace: &str) -> Result<Vec<(String, PodPhase)>>;
}

/// Production implementation over a real apiserver connection.
pub struct KubeCluster {
    client: kube::Client,
}

impl KubeCluster {
    /// Connect using in-cluster credentials when running inside a pod,
    /// falling back to the local kubeconfig.
    pub async fn connect() -> Result<Self> {
        let client = kube::Client::try_default().await?;
        Ok(Self { client })
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let list = nodes.list(&ListParams::default()).await?;
        Ok(list.items.into_iter().map(node_info).collect())
    }

    async fn create_pod(&self, namespace: &str, spec: &PodSpec) -> Result<String> {
        let pod = build_pod(spec);
        let created = self.pods(namespace).create(&PostParams::default(), &pod).await?;
        Ok(created.metadata.name.unwrap_or_else(|| spec.name.clone()))
    }

    async fn pod_phase(&self, namespace: &str, name: &str) -> Result<PodPhase> {
        let pod = self.pods(namespace).get(name).await?;
        let phase = pod
            .status
            .and_then(|s| s.phase)
            .map(|p| PodPhase::from_str(&p))
            .unwrap_or(PodPhase::Unknown);
        Ok(phase)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        self.pods(namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<(String, PodPhase)>> {
        let list = self.pods(namespace).list(&ListParams::default()).await?;
        Ok(list
            .items
            .into_iter()
            .map(|pod| {
                let name = pod.metadata.name.unwrap_or_default();
                let phase = pod
                    .status
                    .and_then(|s| s.phase)
                    .map(|p| PodPhase::from_str(&p))
                    .unwrap_or(PodPhase::Unknown);
                (name, phase)
            })
            .collect())
    }
}

fn node_info(node: Node) -> NodeInfo {
    let name = node.metadata.name.unwrap_or_default();
    let labels = node.metadata.labels.unwrap_or_default();
    let spec = node.spec.unwrap_or_default();
    let no_schedule_taint = spec
        .taints
        .unwrap_or_default()
        .iter()
        .any(|t| t.effect == "NoSchedule");
    NodeInfo {
        name,
        labels,
        unschedulable: spec.unschedulable.unwrap_or(false),
        no_schedule_taint,
    }
}

/// Translate a prepull spec into the pod the apiserver accepts: a single
/// container pinned to one node, never restarted, pull policy `Always` so
/// the kubelet actually hits the registry.
fn build_pod(spec: &PodSpec) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(spec.name.clone()),
            ..Default::default()
        },
        spec: Some(K8sPodSpec {
            containers: vec![Container {
                name: spec.container_name.clone(),
                image: Some(spec.image.clone()),
                image_pull_policy: Some("Always".to_string()),
                command: Some(spec.command.clone()),
                security_context: spec.uid.map(|uid| SecurityContext {
                    run_as_user: Some(uid),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            node_name: Some(spec.node.clone()),
            restart_policy: Some("Never".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}
