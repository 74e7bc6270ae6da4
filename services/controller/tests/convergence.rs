//! Convergence of the three tiers and delivery decisions, driven through the
//! reconcilers against the in-memory store and a recording transport.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ipruler_controller::{
    agent::{AgentEndpoint, AgentTransport, DeliveryError},
    controllers::{
        self, AgentPodReconciler, ClusterConfigReconciler, Context, ControllerSettings,
        FullConfigReconciler, NodeConfigReconciler, NodeReconciler,
    },
    locator::ActiveBaselineLocator,
    resources::{
        ClusterConfig, ClusterConfigSpec, Condition, ConditionStatus, FullConfig, Node,
        NodeConfig, NodeConfigSpec, NodeStatus, ObjectKey, ObjectMeta, Pod, PodPhase, PodSpec,
        PodStatus, Resource, CLEANUP_FINALIZER, TRIGGER_ANNOTATION,
    },
    runtime::Reconciler,
    store::{apply, Cluster, ResourceStore, StoreError, WatchEvent},
};
use ipruler_model::{ConfigModel, RouteModel, RuleModel, VlanModel};
use ipruler_reconcile::Action;
use tokio::sync::{broadcast, watch};

#[derive(Default)]
struct RecordingTransport {
    refuse: HashSet<String>,
    pushes: Mutex<Vec<(String, String)>>,
    cleanups: Mutex<Vec<String>>,
}

impl RecordingTransport {
    fn refusing(pods: &[&str]) -> Self {
        Self {
            refuse: pods.iter().map(|p| p.to_string()).collect(),
            ..Default::default()
        }
    }

    fn pushes(&self) -> Vec<(String, String)> {
        self.pushes.lock().unwrap().clone()
    }

    fn cleanups(&self) -> Vec<String> {
        self.cleanups.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentTransport for RecordingTransport {
    async fn push_config(
        &self,
        agent: &AgentEndpoint,
        payload: &str,
    ) -> Result<String, DeliveryError> {
        if self.refuse.contains(&agent.pod.name) {
            return Err(DeliveryError::Rejected {
                agent: agent.to_string(),
                status: 503,
                body: "busy".to_string(),
            });
        }
        self.pushes
            .lock()
            .unwrap()
            .push((agent.pod.name.clone(), payload.to_string()));
        Ok("applied".to_string())
    }

    async fn cleanup(&self, agent: &AgentEndpoint) -> Result<String, DeliveryError> {
        self.cleanups.lock().unwrap().push(agent.pod.name.clone());
        Ok("cleaned".to_string())
    }
}

/// Fails the first `remaining` updates with a version conflict.
struct ConflictingStore {
    inner: Arc<dyn ResourceStore<FullConfig>>,
    remaining: AtomicU32,
}

#[async_trait]
impl ResourceStore<FullConfig> for ConflictingStore {
    async fn get(&self, key: &ObjectKey) -> Result<FullConfig, StoreError> {
        self.inner.get(key).await
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<FullConfig>, StoreError> {
        self.inner.list(namespace).await
    }

    async fn create(&self, obj: FullConfig) -> Result<FullConfig, StoreError> {
        self.inner.create(obj).await
    }

    async fn update(&self, obj: FullConfig) -> Result<FullConfig, StoreError> {
        let injected = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Conflict {
                kind: FullConfig::KIND,
                key: obj.key(),
                expected: obj.metadata.resource_version,
                actual: obj.metadata.resource_version + 1,
            });
        }
        self.inner.update(obj).await
    }

    async fn update_status(&self, obj: FullConfig) -> Result<FullConfig, StoreError> {
        self.inner.update_status(obj).await
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        self.inner.delete(key).await
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent<FullConfig>> {
        self.inner.watch()
    }
}

fn settings() -> ControllerSettings {
    ControllerSettings {
        empty_requeue: Duration::from_millis(50),
        ..Default::default()
    }
}

fn context(
    cluster: Cluster,
    settings: ControllerSettings,
    transport: Arc<RecordingTransport>,
) -> Arc<Context> {
    Arc::new(Context::new(
        cluster,
        ActiveBaselineLocator::new(),
        settings,
        transport,
    ))
}

fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn rule(from: &str, table: u32) -> RuleModel {
    RuleModel::new(from, table)
}

fn default_route(via: &str) -> RouteModel {
    RouteModel {
        to: "0.0.0.0/0".to_string(),
        via: via.to_string(),
        table: 100,
        ..Default::default()
    }
}

async fn put_baseline(cluster: &Cluster, config: ConfigModel) -> ClusterConfig {
    let baseline = ClusterConfig {
        metadata: ObjectMeta::named("default", "baseline"),
        spec: ClusterConfigSpec { config },
    };
    apply(cluster.cluster_configs.as_ref(), baseline).await.unwrap()
}

async fn put_node_config(
    cluster: &Cluster,
    name: &str,
    selector: &[(&str, &str)],
    config: ConfigModel,
) -> NodeConfig {
    let node_config = NodeConfig {
        metadata: ObjectMeta::named("default", name),
        spec: NodeConfigSpec {
            node_selector: labels(selector),
            config,
        },
    };
    apply(cluster.node_configs.as_ref(), node_config)
        .await
        .unwrap()
}

async fn put_node(cluster: &Cluster, name: &str, node_labels: &[(&str, &str)], ready: bool) {
    let mut metadata = ObjectMeta::named("", name);
    metadata.labels = labels(node_labels);
    let status = if ready {
        ConditionStatus::True
    } else {
        ConditionStatus::False
    };
    let node = Node {
        metadata,
        status: NodeStatus {
            conditions: vec![Condition::new("Ready", status)],
        },
    };
    apply(cluster.nodes.as_ref(), node).await.unwrap();
}

async fn put_agent(cluster: &Cluster, name: &str, node: &str, ip: &str) {
    let mut metadata = ObjectMeta::named("kube-system", name);
    metadata.labels = labels(&[("app", "ipruler-agent")]);
    let pod = Pod {
        metadata,
        spec: PodSpec {
            node_name: node.to_string(),
        },
        status: PodStatus {
            phase: PodPhase::Running,
            pod_ip: ip.to_string(),
            conditions: vec![
                Condition::new("Ready", ConditionStatus::True),
                Condition::new("ContainersReady", ConditionStatus::True),
            ],
        },
    };
    apply(cluster.pods.as_ref(), pod).await.unwrap();
}

/// Run `reconciler` on `key` until it stops asking to be requeued.
async fn settle<R: Reconciler>(reconciler: &R, key: &ObjectKey) -> Action {
    for _ in 0..20 {
        match reconciler.reconcile(key).await.unwrap() {
            Action::Requeue => continue,
            other => return other,
        }
    }
    panic!("{} did not settle for {key}", reconciler.name());
}

/// Converge the configuration tiers: overlays first, then the baseline.
async fn converge(ctx: &Arc<Context>) {
    let node_configs = NodeConfigReconciler::new(ctx.clone());
    let cluster_configs = ClusterConfigReconciler::new(ctx.clone());
    for _ in 0..2 {
        for key in node_configs.resync().await.unwrap() {
            settle(&node_configs, &key).await;
        }
        for key in cluster_configs.resync().await.unwrap() {
            settle(&cluster_configs, &key).await;
        }
    }
}

async fn full_config(cluster: &Cluster, name: &str) -> FullConfig {
    cluster
        .full_configs
        .get(&ObjectKey::new("default", name))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_merge_drops_duplicates_across_tiers() {
    let cluster = Cluster::in_memory();
    let ctx = context(cluster.clone(), settings(), Arc::default());

    put_baseline(
        &cluster,
        ConfigModel {
            rules: vec![rule("10.0.0.0/8", 100)],
            ..Default::default()
        },
    )
    .await;
    put_node_config(
        &cluster,
        "edge",
        &[("role", "edge")],
        ConfigModel {
            rules: vec![rule("10.0.0.0/8", 100)],
            routes: vec![default_route("10.0.0.1"), default_route("10.0.0.1")],
            ..Default::default()
        },
    )
    .await;

    converge(&ctx).await;

    let full = full_config(&cluster, "edge").await;
    assert_eq!(full.spec.merged_config.rules, vec![rule("10.0.0.0/8", 100)]);
    assert_eq!(full.spec.merged_config.routes, vec![default_route("10.0.0.1")]);
    assert!(full.is_consistent());
    assert!(full.status.has_node_config);
    assert!(full.status.has_cluster_config);
    assert_eq!(full.spec.node_selector, labels(&[("role", "edge")]));
}

#[tokio::test]
async fn test_baseline_update_keeps_node_config_flag() {
    let cluster = Cluster::in_memory();
    let ctx = context(cluster.clone(), settings(), Arc::default());

    put_baseline(&cluster, ConfigModel::default()).await;
    put_node_config(
        &cluster,
        "edge",
        &[("role", "edge")],
        ConfigModel {
            rules: vec![rule("192.168.0.0/16", 200)],
            ..Default::default()
        },
    )
    .await;
    converge(&ctx).await;
    assert!(full_config(&cluster, "edge").await.status.has_node_config);

    let vlan = VlanModel {
        name: "vlan10".to_string(),
        link: "eth0".to_string(),
        id: 10,
        ..Default::default()
    };
    put_baseline(
        &cluster,
        ConfigModel {
            vlans: vec![vlan.clone()],
            ..Default::default()
        },
    )
    .await;
    converge(&ctx).await;

    let full = full_config(&cluster, "edge").await;
    assert_eq!(full.spec.merged_config.vlans, vec![vlan]);
    assert_eq!(full.spec.merged_config.rules, vec![rule("192.168.0.0/16", 200)]);
    assert!(full.status.has_node_config);
    assert!(full.status.has_cluster_config);
}

#[tokio::test]
async fn test_selector_change_reaches_full_config() {
    let cluster = Cluster::in_memory();
    let ctx = context(cluster.clone(), settings(), Arc::default());

    put_baseline(&cluster, ConfigModel::default()).await;
    put_node_config(&cluster, "edge", &[("role", "edge")], ConfigModel::default()).await;
    converge(&ctx).await;

    put_node_config(
        &cluster,
        "edge",
        &[("role", "edge"), ("zone", "a")],
        ConfigModel::default(),
    )
    .await;
    converge(&ctx).await;

    let full = full_config(&cluster, "edge").await;
    assert_eq!(
        full.spec.node_selector,
        labels(&[("role", "edge"), ("zone", "a")])
    );
}

#[tokio::test]
async fn test_baseline_without_full_configs_requeues_later() {
    let cluster = Cluster::in_memory();
    let ctx = context(cluster.clone(), settings(), Arc::default());
    let baseline = put_baseline(&cluster, ConfigModel::default()).await;

    let action = ClusterConfigReconciler::new(ctx.clone())
        .reconcile(&baseline.key())
        .await
        .unwrap();

    assert_eq!(action, Action::RequeueAfter(Duration::from_millis(50)));
    assert_eq!(ctx.locator.current(), Some(baseline.key()));
}

#[tokio::test]
async fn test_conflict_abandons_pass_and_next_pass_converges() {
    let memory = Cluster::in_memory();
    let cluster = Cluster {
        full_configs: Arc::new(ConflictingStore {
            inner: memory.full_configs.clone(),
            remaining: AtomicU32::new(1),
        }),
        ..memory
    };
    let ctx = context(cluster.clone(), settings(), Arc::default());

    put_node_config(&cluster, "edge", &[("role", "edge")], ConfigModel::default()).await;
    settle(&NodeConfigReconciler::new(ctx.clone()), &ObjectKey::new("default", "edge")).await;
    let baseline = put_baseline(
        &cluster,
        ConfigModel {
            rules: vec![rule("10.0.0.0/8", 100)],
            ..Default::default()
        },
    )
    .await;

    let reconciler = ClusterConfigReconciler::new(ctx.clone());
    let first = reconciler.reconcile(&baseline.key()).await.unwrap();
    assert_eq!(first, Action::Done);
    assert!(full_config(&cluster, "edge")
        .await
        .spec
        .cluster_config
        .is_empty());

    settle(&reconciler, &baseline.key()).await;
    let full = full_config(&cluster, "edge").await;
    assert_eq!(full.spec.cluster_config.rules, vec![rule("10.0.0.0/8", 100)]);
    assert!(full.status.has_cluster_config);
}

#[tokio::test]
async fn test_overlapping_groups_deliver_once_per_node() {
    let cluster = Cluster::in_memory();
    let transport = Arc::new(RecordingTransport::default());
    let ctx = context(cluster.clone(), settings(), transport.clone());

    put_baseline(&cluster, ConfigModel::default()).await;
    for (name, table) in [("edge-a", 100), ("edge-b", 200)] {
        put_node_config(
            &cluster,
            name,
            &[("role", "edge")],
            ConfigModel {
                rules: vec![rule("10.0.0.0/8", table)],
                ..Default::default()
            },
        )
        .await;
    }
    put_node(&cluster, "node-1", &[("role", "edge")], true).await;
    put_agent(&cluster, "agent-1", "node-1", "10.0.0.5").await;
    converge(&ctx).await;

    let delivery = FullConfigReconciler::new(ctx.clone());
    let a = delivery.deliver(&full_config(&cluster, "edge-a").await).await.unwrap();
    let b = delivery.deliver(&full_config(&cluster, "edge-b").await).await.unwrap();

    assert_eq!(a.delivered, 1);
    assert_eq!(b.delivered, 0);
    let pushes = transport.pushes();
    assert_eq!(pushes.len(), 1);
    assert_eq!(pushes[0].0, "agent-1");
    let expected = full_config(&cluster, "edge-a")
        .await
        .spec
        .merged_config
        .to_yaml()
        .unwrap();
    assert_eq!(pushes[0].1, expected);
}

#[tokio::test]
async fn test_more_specific_selector_wins() {
    let cluster = Cluster::in_memory();
    let transport = Arc::new(RecordingTransport::default());
    let ctx = context(cluster.clone(), settings(), transport.clone());

    put_baseline(&cluster, ConfigModel::default()).await;
    put_node_config(&cluster, "a-broad", &[("role", "edge")], ConfigModel::default()).await;
    put_node_config(
        &cluster,
        "z-narrow",
        &[("role", "edge"), ("zone", "a")],
        ConfigModel::default(),
    )
    .await;
    put_node(&cluster, "node-1", &[("role", "edge"), ("zone", "a")], true).await;
    put_agent(&cluster, "agent-1", "node-1", "10.0.0.5").await;
    converge(&ctx).await;

    let delivery = FullConfigReconciler::new(ctx.clone());
    let broad = delivery.deliver(&full_config(&cluster, "a-broad").await).await.unwrap();
    let narrow = delivery.deliver(&full_config(&cluster, "z-narrow").await).await.unwrap();

    assert_eq!(broad.delivered, 0);
    assert_eq!(narrow.delivered, 1);
}

#[tokio::test]
async fn test_refused_agent_does_not_block_others() {
    let cluster = Cluster::in_memory();
    let transport = Arc::new(RecordingTransport::refusing(&["agent-1"]));
    let ctx = context(cluster.clone(), settings(), transport.clone());

    put_baseline(&cluster, ConfigModel::default()).await;
    put_node_config(&cluster, "edge", &[("role", "edge")], ConfigModel::default()).await;
    put_node(&cluster, "node-1", &[("role", "edge")], true).await;
    put_node(&cluster, "node-2", &[("role", "edge")], true).await;
    put_agent(&cluster, "agent-1", "node-1", "10.0.0.5").await;
    put_agent(&cluster, "agent-2", "node-2", "10.0.0.6").await;
    put_agent(&cluster, "agent-3", "node-unknown", "10.0.0.7").await;
    converge(&ctx).await;

    let full = full_config(&cluster, "edge").await;
    let report = FullConfigReconciler::new(ctx.clone())
        .deliver(&full)
        .await
        .unwrap();

    assert_eq!(report.delivered, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.skipped, 1);
    let pushed: Vec<String> = transport.pushes().into_iter().map(|(pod, _)| pod).collect();
    assert_eq!(pushed, vec!["agent-2".to_string()]);
}

#[tokio::test]
async fn test_ipv6_agent_receives_push() {
    let cluster = Cluster::in_memory();
    let transport = Arc::new(RecordingTransport::default());
    let ctx = context(cluster.clone(), settings(), transport.clone());

    put_baseline(&cluster, ConfigModel::default()).await;
    put_node_config(&cluster, "edge", &[], ConfigModel::default()).await;
    put_node(&cluster, "node-1", &[], true).await;
    put_agent(&cluster, "agent-1", "node-1", "fd00::5").await;
    converge(&ctx).await;

    let report = FullConfigReconciler::new(ctx.clone())
        .deliver(&full_config(&cluster, "edge").await)
        .await
        .unwrap();
    assert_eq!(report.delivered, 1);
}

#[tokio::test]
async fn test_node_event_stamps_trigger() {
    let cluster = Cluster::in_memory();
    let ctx = context(cluster.clone(), settings(), Arc::default());

    put_baseline(&cluster, ConfigModel::default()).await;
    put_node_config(&cluster, "edge", &[("role", "edge")], ConfigModel::default()).await;
    converge(&ctx).await;
    put_node(&cluster, "node-1", &[("role", "edge")], false).await;
    put_node(&cluster, "node-2", &[("role", "edge")], true).await;

    let reconciler = NodeReconciler::new(ctx.clone());
    reconciler
        .reconcile(&ObjectKey::cluster_scoped("node-1"))
        .await
        .unwrap();
    assert!(full_config(&cluster, "edge").await.trigger_token().is_none());

    reconciler
        .reconcile(&ObjectKey::cluster_scoped("node-2"))
        .await
        .unwrap();
    let first: u64 = full_config(&cluster, "edge")
        .await
        .metadata
        .annotations[TRIGGER_ANNOTATION]
        .parse()
        .unwrap();

    reconciler
        .reconcile(&ObjectKey::cluster_scoped("node-2"))
        .await
        .unwrap();
    let second: u64 = full_config(&cluster, "edge")
        .await
        .trigger_token()
        .unwrap()
        .parse()
        .unwrap();
    assert!(second > first);
}

#[tokio::test]
async fn test_agent_pod_ready_stamps_trigger() {
    let cluster = Cluster::in_memory();
    let ctx = context(cluster.clone(), settings(), Arc::default());

    put_baseline(&cluster, ConfigModel::default()).await;
    put_node_config(&cluster, "edge", &[("role", "edge")], ConfigModel::default()).await;
    converge(&ctx).await;
    put_agent(&cluster, "agent-1", "node-1", "10.0.0.5").await;

    let reconciler = AgentPodReconciler::new(ctx.clone());
    let agent = ObjectKey::new("kube-system", "agent-1");

    // Node not known yet.
    reconciler.reconcile(&agent).await.unwrap();
    assert!(full_config(&cluster, "edge").await.trigger_token().is_none());

    put_node(&cluster, "node-1", &[("role", "edge")], true).await;
    reconciler.reconcile(&agent).await.unwrap();
    assert!(full_config(&cluster, "edge").await.trigger_token().is_some());
}

#[tokio::test]
async fn test_cleanup_on_delete_sends_cleanup_and_releases_finalizer() {
    let cluster = Cluster::in_memory();
    let transport = Arc::new(RecordingTransport::default());
    let ctx = context(
        cluster.clone(),
        ControllerSettings {
            cleanup_on_delete: true,
            ..settings()
        },
        transport.clone(),
    );

    put_baseline(&cluster, ConfigModel::default()).await;
    put_node_config(&cluster, "edge", &[("role", "edge")], ConfigModel::default()).await;
    put_node(&cluster, "node-1", &[("role", "edge")], true).await;
    put_agent(&cluster, "agent-1", "node-1", "10.0.0.5").await;
    converge(&ctx).await;

    let key = ObjectKey::new("default", "edge");
    let delivery = FullConfigReconciler::new(ctx.clone());
    delivery.reconcile(&key).await.unwrap();
    assert!(full_config(&cluster, "edge")
        .await
        .metadata
        .has_finalizer(CLEANUP_FINALIZER));
    assert_eq!(transport.pushes().len(), 1);

    cluster.full_configs.delete(&key).await.unwrap();
    assert!(full_config(&cluster, "edge").await.metadata.is_deleting());

    delivery.reconcile(&key).await.unwrap();
    assert_eq!(transport.cleanups(), vec!["agent-1".to_string()]);
    assert!(cluster.full_configs.get_opt(&key).await.unwrap().is_none());
}

#[tokio::test]
async fn test_cleanup_hands_node_to_successor() {
    let cluster = Cluster::in_memory();
    let ctx = context(
        cluster.clone(),
        ControllerSettings {
            cleanup_on_delete: true,
            ..settings()
        },
        Arc::default(),
    );

    put_baseline(&cluster, ConfigModel::default()).await;
    put_node_config(&cluster, "edge-a", &[("role", "edge")], ConfigModel::default()).await;
    put_node_config(&cluster, "edge-b", &[("role", "edge")], ConfigModel::default()).await;
    put_node(&cluster, "node-1", &[("role", "edge")], true).await;
    put_agent(&cluster, "agent-1", "node-1", "10.0.0.5").await;
    converge(&ctx).await;

    let delivery = FullConfigReconciler::new(ctx.clone());
    let a = ObjectKey::new("default", "edge-a");
    delivery.reconcile(&a).await.unwrap();
    cluster.full_configs.delete(&a).await.unwrap();
    delivery.reconcile(&a).await.unwrap();

    assert!(full_config(&cluster, "edge-b").await.trigger_token().is_some());
}

#[tokio::test]
async fn test_cleanup_disabled_removes_record_immediately() {
    let cluster = Cluster::in_memory();
    let ctx = context(cluster.clone(), settings(), Arc::default());

    put_node_config(&cluster, "edge", &[], ConfigModel::default()).await;
    converge(&ctx).await;
    let key = ObjectKey::new("default", "edge");
    FullConfigReconciler::new(ctx.clone())
        .reconcile(&key)
        .await
        .unwrap();

    assert!(!full_config(&cluster, "edge")
        .await
        .metadata
        .has_finalizer(CLEANUP_FINALIZER));
    cluster.full_configs.delete(&key).await.unwrap();
    assert!(cluster.full_configs.get_opt(&key).await.unwrap().is_none());
}

#[tokio::test]
async fn test_controllers_converge_and_deliver() {
    let cluster = Cluster::in_memory();
    let transport = Arc::new(RecordingTransport::default());
    let ctx = context(cluster.clone(), settings(), transport.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = controllers::spawn_all(ctx.clone(), shutdown_rx);

    put_node(&cluster, "node-1", &[("role", "edge")], true).await;
    put_agent(&cluster, "agent-1", "node-1", "10.0.0.5").await;
    put_baseline(
        &cluster,
        ConfigModel {
            rules: vec![rule("10.0.0.0/8", 100)],
            ..Default::default()
        },
    )
    .await;
    put_node_config(
        &cluster,
        "edge",
        &[("role", "edge")],
        ConfigModel {
            routes: vec![default_route("10.0.0.1")],
            ..Default::default()
        },
    )
    .await;

    let converged = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let full = cluster
                .full_configs
                .get_opt(&ObjectKey::new("default", "edge"))
                .await
                .unwrap();
            let delivered = transport.pushes().iter().any(|(_, payload)| {
                payload.contains("10.0.0.0/8") && payload.contains("10.0.0.1")
            });
            if let Some(full) = full {
                if full.status.has_cluster_config && full.status.has_node_config && delivered {
                    return full;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("controllers did not converge");

    assert!(converged.is_consistent());

    shutdown_tx.send(true).unwrap();
    for worker in workers {
        tokio::time::timeout(Duration::from_secs(2), worker)
            .await
            .expect("worker did not stop")
            .unwrap();
    }
}

struct Running {
    cluster: Cluster,
    transport: Arc<RecordingTransport>,
    shutdown: watch::Sender<bool>,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

impl Running {
    async fn stop(self) {
        self.shutdown.send(true).unwrap();
        for worker in self.workers {
            tokio::time::timeout(Duration::from_secs(2), worker)
                .await
                .expect("worker did not stop")
                .unwrap();
        }
    }

    /// Wait for a push to agent-1, after the first `seen` pushes, carrying `needle`.
    async fn wait_for_push(&self, seen: usize, needle: &str) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let pushes = self.transport.pushes();
                let found = pushes
                    .iter()
                    .skip(seen)
                    .any(|(pod, payload)| pod == "agent-1" && payload.contains(needle));
                if found {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no push carrying {needle}"));
    }
}

fn edge_config() -> ConfigModel {
    ConfigModel {
        rules: vec![rule("192.168.0.0/16", 200)],
        ..Default::default()
    }
}

/// Groups `all` (every node) and `edge` (role=edge) with node-1 won by `edge`.
async fn start_with_two_groups() -> Running {
    let cluster = Cluster::in_memory();
    let transport = Arc::new(RecordingTransport::default());
    let ctx = context(cluster.clone(), settings(), transport.clone());
    let (shutdown, shutdown_rx) = watch::channel(false);
    let workers = controllers::spawn_all(ctx, shutdown_rx);

    put_baseline(&cluster, ConfigModel::default()).await;
    put_node_config(
        &cluster,
        "all",
        &[],
        ConfigModel {
            rules: vec![rule("172.16.0.0/12", 100)],
            ..Default::default()
        },
    )
    .await;
    put_node_config(&cluster, "edge", &[("role", "edge")], edge_config()).await;
    put_node(&cluster, "node-1", &[("role", "edge")], true).await;
    put_agent(&cluster, "agent-1", "node-1", "10.0.0.5").await;

    let running = Running {
        cluster,
        transport,
        shutdown,
        workers,
    };
    running.wait_for_push(0, "192.168.0.0/16").await;

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let all = running
                .cluster
                .full_configs
                .get_opt(&ObjectKey::new("default", "all"))
                .await
                .unwrap();
            if let Some(all) = all {
                if all.status.has_cluster_config && all.status.has_node_config {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("group all did not converge");

    // Let passes already in flight finish.
    tokio::time::sleep(Duration::from_millis(200)).await;
    running
}

#[tokio::test]
async fn test_deleted_winner_hands_node_to_remaining_group() {
    let running = start_with_two_groups().await;
    let seen = running.transport.pushes().len();

    let edge = ObjectKey::new("default", "edge");
    running.cluster.node_configs.delete(&edge).await.unwrap();
    running.cluster.full_configs.delete(&edge).await.unwrap();

    running.wait_for_push(seen, "172.16.0.0/12").await;
    running.stop().await;
}

#[tokio::test]
async fn test_narrowed_winner_hands_node_to_remaining_group() {
    let running = start_with_two_groups().await;
    let seen = running.transport.pushes().len();

    put_node_config(&running.cluster, "edge", &[("role", "core")], edge_config()).await;

    running.wait_for_push(seen, "172.16.0.0/12").await;
    running.stop().await;
}
