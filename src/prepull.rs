use futures::future;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crate::cluster::{ClusterApi, NodeInfo, PodPhase};
use crate::config::{NodePolicy, PrepullConfig};
use crate::error::{ImageCycleError, Result};
use crate::scanner::Scanner;

/// Everything needed to run one throwaway pull pod on one node. Generated,
/// never persisted; the pod name re-derives identically from image + node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodSpec {
    pub name: String,
    pub container_name: String,
    pub image: String,
    pub node: String,
    pub command: Vec<String>,
    pub uid: Option<i64>,
}

/// Container-safe name fragment from an image reference: the last two
/// path components, with the separators DNS-1123 forbids folded to `-`.
pub fn podname_from_image(image: &str) -> String {
    let components: Vec<&str> = image.split('/').collect();
    let tail = if components.len() >= 2 {
        components[components.len() - 2..].join("-")
    } else {
        components.join("-")
    };
    tail.replace([':', '_', '.'], "-").to_lowercase()
}

/// Deterministic pod name for one (image, node) pair. Re-deriving yields
/// the same name, so repeated runs are idempotent and cleanup can match
/// exactly the pods this matrix created.
pub fn derive_pod_name(image: &str, node: &str) -> String {
    let node_suffix = node.rsplit('-').next().unwrap_or(node);
    format!("pp-{}-{}", podname_from_image(image), node_suffix)
}

/// Fully qualify a shorthand image name: bare `name` becomes
/// `library/name:latest`.
pub fn qualify_image(image: &str) -> String {
    let mut image = image.to_string();
    if !image.contains(':') {
        image.push_str(":latest");
    }
    if !image.contains('/') {
        image = format!("library/{}", image);
    }
    image
}

/// Runs short-lived pods across every schedulable node so each node's
/// container runtime caches the selected images before users ask for them.
pub struct Prepuller<C: ClusterApi> {
    cluster: Arc<C>,
    config: PrepullConfig,
    images: Vec<String>,
    nodes: Vec<String>,
    pod_specs: HashMap<String, Vec<PodSpec>>,
}

impl<C: ClusterApi> Prepuller<C> {
    pub fn new(cluster: Arc<C>, config: PrepullConfig) -> Self {
        Self {
            cluster,
            config,
            images: Vec::new(),
            nodes: Vec::new(),
            pod_specs: HashMap::new(),
        }
    }

    pub fn images(&self) -> &[String] {
        &self.images
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn pod_specs(&self) -> &HashMap<String, Vec<PodSpec>> {
        &self.pod_specs
    }

    /// Merge explicit image references into the working set, qualifying
    /// shorthand names and deduplicating.
    pub fn add_images<I, S>(&mut self, images: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut merged: BTreeSet<String> = self.images.drain(..).collect();
        for image in images {
            merged.insert(qualify_image(image.as_ref()));
        }
        self.images = merged.into_iter().collect();
    }

    /// Pull the scanner's current selection into the working set.
    pub fn update_images_from_scan(&mut self, scanner: &Scanner) {
        let images = scanner.prepull_images();
        tracing::debug!(count = images.len(), "Adding images from scan");
        self.add_images(images);
    }

    /// Query the cluster for schedulable nodes, dropping anything
    /// unschedulable, tainted `NoSchedule`, or rejected by the label
    /// policy.
    pub async fn build_node_list(&mut self) -> Result<()> {
        let mut nodes = Vec::new();
        for node in self.cluster.list_nodes().await? {
            if node.unschedulable || node.no_schedule_taint {
                tracing::debug!(node = %node.name, "Skipping unschedulable node");
                continue;
            }
            if reject_by_label(&self.config.node_policy, &node) {
                tracing::debug!(node = %node.name, "Node rejected by label policy");
                continue;
            }
            nodes.push(node.name);
        }
        tracing::debug!(?nodes, "Schedulable node list");
        self.nodes = nodes;
        Ok(())
    }

    /// One spec per (node, image) pair.
    pub fn build_pod_specs(&mut self) {
        let mut specs: HashMap<String, Vec<PodSpec>> = HashMap::new();
        for node in &self.nodes {
            let list = specs.entry(node.clone()).or_default();
            for image in &self.images {
                list.push(PodSpec {
                    name: derive_pod_name(image, node),
                    container_name: podname_from_image(image),
                    image: image.clone(),
                    node: node.clone(),
                    command: self.config.command.clone(),
                    uid: self.config.uid,
                });
            }
        }
        tracing::debug!(
            nodes = specs.len(),
            pods = specs.values().map(|v| v.len()).sum::<usize>(),
            "Built pod spec matrix"
        );
        self.pod_specs = specs;
    }

    /// Names of every pod the current matrix would create.
    pub fn pod_names(&self) -> HashSet<String> {
        self.pod_specs
            .values()
            .flatten()
            .map(|s| s.name.clone())
            .collect()
    }

    /// Run the whole prepull, honoring the configured wall clock. The
    /// deadline is checked cooperatively inside every node worker; on
    /// expiry all matrix pods are force-cleaned regardless of phase.
    pub async fn run(&self) -> Result<()> {
        let deadline = self
            .config
            .run_timeout_secs
            .map(|secs| tokio::time::Instant::now() + Duration::from_secs(secs));
        let timed_out = self.run_pods_until(deadline).await?;
        if timed_out {
            tracing::error!("Prepull run exceeded wall clock; cleaning up");
            if let Err(e) = self.destroy_pods(false).await {
                tracing::warn!("Cleanup after timeout failed: {}", e);
            }
            return Err(ImageCycleError::PrepullRunTimeout);
        }
        Ok(())
    }

    /// Fan out with no deadline.
    pub async fn run_pods(&self) -> Result<()> {
        self.run_pods_until(None).await.map(|_| ())
    }

    /// Fan out one worker per node and join them all. Each worker runs its
    /// node's images strictly one at a time so a single node's image-pull
    /// I/O is never saturated; nodes proceed independently. Returns
    /// whether any worker hit the deadline.
    async fn run_pods_until(&self, deadline: Option<tokio::time::Instant>) -> Result<bool> {
        let mut handles = Vec::new();
        for (node, specs) in &self.pod_specs {
            let worker = NodeWorker {
                cluster: self.cluster.clone(),
                namespace: self.config.namespace.clone(),
                node: node.clone(),
                specs: specs.clone(),
                poll_delay: Duration::from_secs(self.config.poll_delay_secs),
                max_poll_tries: self.config.max_poll_tries,
                deadline,
            };
            handles.push(tokio::spawn(worker.run()));
        }

        let results = future::join_all(handles).await;
        let mut pulled = 0usize;
        let mut failed = 0usize;
        let mut timed_out = false;
        for result in results {
            match result {
                Ok(outcome) => {
                    pulled += outcome.pulled;
                    failed += outcome.failed;
                    timed_out |= outcome.timed_out;
                }
                Err(e) => {
                    tracing::error!("Node worker panicked: {}", e);
                    failed += 1;
                }
            }
        }
        tracing::info!(pulled, failed, "Prepull complete");
        Ok(timed_out)
    }

    /// Routine housekeeping: delete matrix pods that already ran to
    /// completion.
    pub async fn clean_completed_pods(&self) -> Result<()> {
        self.destroy_pods(true).await
    }

    /// Delete pods matching the current matrix. Selective mode only
    /// touches terminal pods; non-selective (abort/timeout) deletes every
    /// match regardless of phase.
    pub async fn destroy_pods(&self, selective: bool) -> Result<()> {
        tracing::debug!(selective, "Looking for pods to delete");
        let names = self.pod_names();
        let pods = self.cluster.list_pods(&self.config.namespace).await?;
        for (name, phase) in pods {
            if !names.contains(&name) {
                continue;
            }
            if selective && !phase.is_terminal() {
                tracing::debug!(pod = %name, ?phase, "Pod not finished; not cleaning");
                continue;
            }
            if let Err(e) = self.cluster.delete_pod(&self.config.namespace, &name).await {
                tracing::warn!(pod = %name, "Could not delete pod: {}", e);
            }
        }
        Ok(())
    }
}

/// Whether the label policy rejects a node. Restriction is opt-in: with no
/// restriction flags, every node passes.
fn reject_by_label(policy: &NodePolicy, node: &NodeInfo) -> bool {
    if !policy.restrict_lab_nodes {
        return false;
    }
    if node.labels.is_empty() {
        tracing::debug!(node = %node.name, "Node carries no labels; allowing");
        return false;
    }
    if node.labels.get(&policy.lab_label).map(String::as_str) == Some("ok") {
        return false;
    }
    if !policy.allow_dask_spawn {
        return true;
    }
    if !policy.restrict_dask_nodes {
        return false;
    }
    node.labels.get(&policy.dask_label).map(String::as_str) != Some("ok")
}

#[derive(Default)]
struct WorkerOutcome {
    pulled: usize,
    failed: usize,
    timed_out: bool,
}

/// State one node worker owns. Nothing here is shared with other workers;
/// the matrix was fully computed before fan-out.
struct NodeWorker<C: ClusterApi> {
    cluster: Arc<C>,
    namespace: String,
    node: String,
    specs: Vec<PodSpec>,
    poll_delay: Duration,
    max_poll_tries: u32,
    deadline: Option<tokio::time::Instant>,
}

impl<C: ClusterApi> NodeWorker<C> {
    fn past_deadline(&self) -> bool {
        self.deadline
            .map(|d| tokio::time::Instant::now() >= d)
            .unwrap_or(false)
    }

    /// Run this node's pods sequentially. Per-pod failures are logged and
    /// the worker moves on; warming the remaining caches beats aborting.
    /// Hitting the run deadline stops the worker; the driver force-cleans
    /// whatever is left.
    async fn run(self) -> WorkerOutcome {
        tracing::debug!(node = %self.node, pods = self.specs.len(), "Running pods for node");
        let mut outcome = WorkerOutcome::default();
        for spec in &self.specs {
            if self.past_deadline() {
                tracing::warn!(node = %self.node, "Run deadline reached; stopping worker");
                outcome.timed_out = true;
                break;
            }
            match self.run_single_pod(spec).await {
                Ok(()) => outcome.pulled += 1,
                Err(ImageCycleError::PrepullRunTimeout) => {
                    outcome.timed_out = true;
                    break;
                }
                Err(e) => {
                    tracing::error!(pod = %spec.name, node = %self.node, "Pod failed: {}", e);
                    outcome.failed += 1;
                }
            }
        }
        outcome
    }

    async fn run_single_pod(&self, spec: &PodSpec) -> Result<()> {
        tracing::debug!(pod = %spec.name, node = %self.node, image = %spec.image, "Starting pod");
        let name = self.cluster.create_pod(&self.namespace, spec).await?;
        match self.wait_for_pod(&name).await {
            Ok(()) => Ok(()),
            Err(e @ ImageCycleError::PrepullTimeout { .. }) => {
                // The stuck pod must go before the next image starts, or
                // this node would have two pods in flight.
                if let Err(del) = self.cluster.delete_pod(&self.namespace, &name).await {
                    tracing::warn!(pod = %name, "Could not delete timed-out pod: {}", del);
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Poll until the pod reaches a terminal phase, then delete it
    /// regardless of outcome. `Failed` is logged, not escalated. The run
    /// deadline is checked between polls; expiry leaves the pod for the
    /// driver's force-clean.
    async fn wait_for_pod(&self, name: &str) -> Result<()> {
        let mut tries = 1u32;
        loop {
            let phase = self.cluster.pod_phase(&self.namespace, name).await?;
            if phase.is_terminal() {
                if phase == PodPhase::Failed {
                    tracing::error!(pod = %name, "Pod failed");
                }
                if let Err(e) = self.cluster.delete_pod(&self.namespace, name).await {
                    tracing::warn!(pod = %name, "Could not delete finished pod: {}", e);
                }
                return Ok(());
            }
            if self.past_deadline() {
                return Err(ImageCycleError::PrepullRunTimeout);
            }
            if tries >= self.max_poll_tries {
                return Err(ImageCycleError::PrepullTimeout {
                    pod: name.to_string(),
                });
            }
            tracing::trace!(
                pod = %name,
                ?phase,
                tries,
                max = self.max_poll_tries,
                "Waiting for pod"
            );
            tokio::time::sleep(self.poll_delay).await;
            tries += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pod_names_are_deterministic() {
        let a = derive_pod_name("owner/lab:w_2023_05", "cluster-node-3");
        let b = derive_pod_name("owner/lab:w_2023_05", "cluster-node-3");
        assert_eq!(a, b);
        assert_eq!(a, "pp-owner-lab-w-2023-05-3");
    }

    #[test]
    fn pod_names_distinguish_images_and_nodes() {
        let names: HashSet<String> = [
            derive_pod_name("owner/lab:r170", "node-1"),
            derive_pod_name("owner/lab:r170", "node-2"),
            derive_pod_name("owner/lab:w202305", "node-1"),
            derive_pod_name("owner/lab:w202305", "node-2"),
        ]
        .into_iter()
        .collect();
        assert_eq!(names.len(), 4);
    }

    #[test]
    fn qualifies_shorthand_images() {
        assert_eq!(qualify_image("lab"), "library/lab:latest");
        assert_eq!(qualify_image("owner/lab"), "owner/lab:latest");
        assert_eq!(qualify_image("owner/lab:r170"), "owner/lab:r170");
    }
}
