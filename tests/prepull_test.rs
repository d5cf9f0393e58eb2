//! Prepuller tests over an in-memory cluster implementation.
//!
//! The fake tracks every create/poll/delete and how many pods are in
//! flight per node, so the tests can verify the one-pod-per-node ordering
//! guarantee as well as the failure-isolation rules.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use imagecycle::cluster::{ClusterApi, NodeInfo, PodPhase};
use imagecycle::config::{NodePolicy, PrepullConfig};
use imagecycle::error::{ImageCycleError, Result};
use imagecycle::prepull::{PodSpec, Prepuller};

/// Scripted behavior for pods of one image: how many polls until the
/// terminal phase is reported.
#[derive(Clone, Copy)]
struct PodScript {
    polls_until_terminal: u32,
    terminal: PodPhase,
}

impl Default for PodScript {
    fn default() -> Self {
        PodScript {
            polls_until_terminal: 1,
            terminal: PodPhase::Succeeded,
        }
    }
}

#[derive(Default)]
struct FakeState {
    /// Pod name -> (node, polls seen, script).
    pods: HashMap<String, (String, u32, PodScript)>,
    created: Vec<String>,
    deleted: Vec<String>,
    in_flight: HashMap<String, usize>,
    max_in_flight: HashMap<String, usize>,
}

struct FakeCluster {
    nodes: Vec<NodeInfo>,
    /// Keyed by image reference; unlisted images succeed on first poll.
    scripts: HashMap<String, PodScript>,
    state: Mutex<FakeState>,
}

impl FakeCluster {
    fn new(nodes: Vec<NodeInfo>) -> Self {
        FakeCluster {
            nodes,
            scripts: HashMap::new(),
            state: Mutex::new(FakeState::default()),
        }
    }

    fn script(mut self, image: &str, polls_until_terminal: u32, terminal: PodPhase) -> Self {
        self.scripts.insert(
            image.to_string(),
            PodScript {
                polls_until_terminal,
                terminal,
            },
        );
        self
    }

    /// Seed an existing pod, as if left behind by an earlier run.
    fn seed_pod(&self, name: &str, node: &str, phase: PodPhase) {
        let script = PodScript {
            polls_until_terminal: 0,
            terminal: phase,
        };
        let mut state = self.state.lock().unwrap();
        state
            .pods
            .insert(name.to_string(), (node.to_string(), 0, script));
    }
}

fn node(name: &str) -> NodeInfo {
    NodeInfo {
        name: name.to_string(),
        labels: BTreeMap::new(),
        unschedulable: false,
        no_schedule_taint: false,
    }
}

fn labeled_node(name: &str, labels: &[(&str, &str)]) -> NodeInfo {
    NodeInfo {
        labels: labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        ..node(name)
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
        Ok(self.nodes.clone())
    }

    async fn create_pod(&self, _namespace: &str, spec: &PodSpec) -> Result<String> {
        let script = self.scripts.get(&spec.image).copied().unwrap_or_default();
        let mut state = self.state.lock().unwrap();
        state
            .pods
            .insert(spec.name.clone(), (spec.node.clone(), 0, script));
        state.created.push(spec.name.clone());
        let count = state.in_flight.entry(spec.node.clone()).or_insert(0);
        *count += 1;
        let count = *count;
        let max = state.max_in_flight.entry(spec.node.clone()).or_insert(0);
        *max = (*max).max(count);
        Ok(spec.name.clone())
    }

    async fn pod_phase(&self, _namespace: &str, name: &str) -> Result<PodPhase> {
        let mut state = self.state.lock().unwrap();
        let (_, polls, script) = state
            .pods
            .get_mut(name)
            .ok_or_else(|| ImageCycleError::Registry(format!("no such pod {}", name)))?;
        *polls += 1;
        if *polls >= script.polls_until_terminal {
            Ok(script.terminal)
        } else {
            Ok(PodPhase::Pending)
        }
    }

    async fn delete_pod(&self, _namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some((node, _, _)) = state.pods.remove(name) {
            if let Some(count) = state.in_flight.get_mut(&node) {
                *count = count.saturating_sub(1);
            }
        }
        state.deleted.push(name.to_string());
        Ok(())
    }

    async fn list_pods(&self, _namespace: &str) -> Result<Vec<(String, PodPhase)>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .pods
            .iter()
            .map(|(name, (_, polls, script))| {
                let phase = if *polls >= script.polls_until_terminal {
                    script.terminal
                } else {
                    PodPhase::Pending
                };
                (name.clone(), phase)
            })
            .collect())
    }
}

fn fast_config() -> PrepullConfig {
    PrepullConfig {
        poll_delay_secs: 0,
        max_poll_tries: 5,
        ..Default::default()
    }
}

#[tokio::test]
async fn node_list_excludes_unschedulable_and_tainted_nodes() {
    let mut tainted = node("node-tainted");
    tainted.no_schedule_taint = true;
    let mut cordoned = node("node-cordoned");
    cordoned.unschedulable = true;

    let cluster = Arc::new(FakeCluster::new(vec![node("node-1"), tainted, cordoned]));
    let mut prepuller = Prepuller::new(cluster, fast_config());
    prepuller.build_node_list().await.unwrap();
    assert_eq!(prepuller.nodes(), ["node-1"]);
}

#[tokio::test]
async fn node_list_honors_label_policy() {
    let nodes = vec![
        labeled_node("node-lab", &[("jupyterlab", "ok")]),
        labeled_node("node-dask", &[("dask", "ok")]),
        labeled_node("node-neither", &[("role", "db")]),
        node("node-unlabeled"),
    ];

    // Lab restriction only: the lab node and unlabeled nodes pass.
    let policy = NodePolicy {
        restrict_lab_nodes: true,
        ..Default::default()
    };
    let config = PrepullConfig {
        node_policy: policy,
        ..fast_config()
    };
    let cluster = Arc::new(FakeCluster::new(nodes.clone()));
    let mut prepuller = Prepuller::new(cluster, config);
    prepuller.build_node_list().await.unwrap();
    assert_eq!(prepuller.nodes(), ["node-lab", "node-unlabeled"]);

    // Dask spawn allowed and restricted: dask-labeled nodes also pass.
    let policy = NodePolicy {
        restrict_lab_nodes: true,
        allow_dask_spawn: true,
        restrict_dask_nodes: true,
        ..Default::default()
    };
    let config = PrepullConfig {
        node_policy: policy,
        ..fast_config()
    };
    let cluster = Arc::new(FakeCluster::new(nodes));
    let mut prepuller = Prepuller::new(cluster, config);
    prepuller.build_node_list().await.unwrap();
    assert_eq!(
        prepuller.nodes(),
        ["node-lab", "node-dask", "node-unlabeled"]
    );
}

#[tokio::test]
async fn pod_spec_matrix_is_complete_unique_and_idempotent() {
    let cluster = Arc::new(FakeCluster::new(vec![node("node-1"), node("node-2")]));
    let mut prepuller = Prepuller::new(cluster, fast_config());
    prepuller.add_images(["owner/lab:r170", "owner/lab:w202305", "owner/lab:d20230501"]);
    prepuller.build_node_list().await.unwrap();
    prepuller.build_pod_specs();

    let names = prepuller.pod_names();
    assert_eq!(names.len(), 6);

    let first: HashMap<String, Vec<PodSpec>> = prepuller.pod_specs().clone();
    prepuller.build_pod_specs();
    assert_eq!(&first, prepuller.pod_specs());
}

#[tokio::test]
async fn run_pods_is_sequential_per_node_and_parallel_across_nodes() {
    let cluster = Arc::new(
        FakeCluster::new(vec![node("node-1"), node("node-2")])
            .script("owner/lab:w202305", 3, PodPhase::Succeeded),
    );
    let mut prepuller = Prepuller::new(cluster.clone(), fast_config());
    prepuller.add_images(["owner/lab:r170", "owner/lab:w202305", "owner/lab:d20230501"]);
    prepuller.build_node_list().await.unwrap();
    prepuller.build_pod_specs();
    prepuller.run_pods().await.unwrap();

    let state = cluster.state.lock().unwrap();
    // Every pod ran and was deleted afterwards.
    assert_eq!(state.created.len(), 6);
    assert_eq!(state.deleted.len(), 6);
    assert!(state.pods.is_empty());
    // Never more than one pod in flight on any node.
    for (node, max) in &state.max_in_flight {
        assert_eq!(*max, 1, "node {} had {} pods in flight", node, max);
    }
}

#[tokio::test]
async fn failed_pod_does_not_stop_the_node_worker() {
    let cluster = Arc::new(
        FakeCluster::new(vec![node("node-1")])
            .script("owner/lab:d20230501", 1, PodPhase::Failed),
    );
    let mut prepuller = Prepuller::new(cluster.clone(), fast_config());
    prepuller.add_images(["owner/lab:d20230501", "owner/lab:r170", "owner/lab:w202305"]);
    prepuller.build_node_list().await.unwrap();
    prepuller.build_pod_specs();
    prepuller.run_pods().await.unwrap();

    let state = cluster.state.lock().unwrap();
    // The failed pod was still cleaned up and the rest were attempted.
    assert_eq!(state.created.len(), 3);
    assert_eq!(state.deleted.len(), 3);
}

#[tokio::test]
async fn stuck_pod_times_out_alone() {
    // "stuck" never leaves Pending; the budget is 5 polls.
    let cluster = Arc::new(
        FakeCluster::new(vec![node("node-1"), node("node-2")])
            .script("owner/lab:stuck", u32::MAX, PodPhase::Succeeded),
    );
    let mut prepuller = Prepuller::new(cluster.clone(), fast_config());
    prepuller.add_images(["owner/lab:r170", "owner/lab:stuck", "owner/lab:w202305"]);
    prepuller.build_node_list().await.unwrap();
    prepuller.build_pod_specs();
    prepuller.run_pods().await.unwrap();

    let state = cluster.state.lock().unwrap();
    // All six pods were attempted: the stuck pod on each node timed out
    // without blocking that node's remaining images or the other node.
    assert_eq!(state.created.len(), 6);
    // Timed-out pods are deleted before the worker moves on.
    assert_eq!(state.deleted.len(), 6);
    assert!(state.pods.is_empty());
    for max in state.max_in_flight.values() {
        assert_eq!(*max, 1);
    }
}

#[tokio::test]
async fn destroy_pods_selective_only_touches_finished_pods() {
    let cluster = Arc::new(FakeCluster::new(vec![node("node-1")]));
    let mut prepuller = Prepuller::new(cluster.clone(), fast_config());
    prepuller.add_images(["owner/lab:r170", "owner/lab:w202305"]);
    prepuller.build_node_list().await.unwrap();
    prepuller.build_pod_specs();

    let names: Vec<String> = {
        let mut v: Vec<String> = prepuller.pod_names().into_iter().collect();
        v.sort();
        v
    };
    // One matrix pod finished, one is still pending, plus a stranger.
    cluster.seed_pod(&names[0], "node-1", PodPhase::Succeeded);
    let pending = PodScript {
        polls_until_terminal: u32::MAX,
        terminal: PodPhase::Succeeded,
    };
    {
        let mut state = cluster.state.lock().unwrap();
        state
            .pods
            .insert(names[1].clone(), ("node-1".to_string(), 0, pending));
        state.pods.insert(
            "somebody-elses-pod".to_string(),
            ("node-1".to_string(), 0, pending),
        );
    }

    prepuller.clean_completed_pods().await.unwrap();
    {
        let state = cluster.state.lock().unwrap();
        assert_eq!(state.deleted, vec![names[0].clone()]);
        assert!(state.pods.contains_key(&names[1]));
        assert!(state.pods.contains_key("somebody-elses-pod"));
    }

    // Non-selective cleanup removes the pending matrix pod too, but never
    // the unrelated pod.
    prepuller.destroy_pods(false).await.unwrap();
    let state = cluster.state.lock().unwrap();
    assert!(!state.pods.contains_key(&names[1]));
    assert!(state.pods.contains_key("somebody-elses-pod"));
}

#[tokio::test]
async fn run_honors_the_wall_clock_and_force_cleans() {
    // Both images stick forever; the run budget is one second.
    let cluster = Arc::new(
        FakeCluster::new(vec![node("node-1")])
            .script("owner/lab:stuck-a", u32::MAX, PodPhase::Succeeded)
            .script("owner/lab:stuck-b", u32::MAX, PodPhase::Succeeded),
    );
    let config = PrepullConfig {
        poll_delay_secs: 1,
        max_poll_tries: 100_000,
        run_timeout_secs: Some(1),
        ..Default::default()
    };
    let mut prepuller = Prepuller::new(cluster.clone(), config);
    prepuller.add_images(["owner/lab:stuck-a", "owner/lab:stuck-b"]);
    prepuller.build_node_list().await.unwrap();
    prepuller.build_pod_specs();

    match prepuller.run().await {
        Err(ImageCycleError::PrepullRunTimeout) => {}
        other => panic!("expected PrepullRunTimeout, got {:?}", other),
    }
    let state = cluster.state.lock().unwrap();
    // The worker stopped at the deadline: the second image never started,
    // and the in-flight pod was force-cleaned despite not being terminal.
    assert_eq!(state.created.len(), 1);
    assert!(state.pods.is_empty());
}
