//! End-to-end tests for netsync-core.
//!
//! Two (or more) clients share an in-memory server and each own a local
//! replica, a graph and a NetworkSyncher, as separate application instances
//! would.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use netsync_core::store::WriteKind;
use netsync_core::{
    DocumentStore, Element, Fields, Graph, InMemoryServer, InMemoryStore, JsonSyncher, MemoryProvider,
    NetworkSyncher, Position, Secret, StoreContext, SyncConfig,
};
use serde_json::{Value, json};
use tokio::time::timeout;

fn fields(value: Value) -> Fields {
    value.as_object().cloned().unwrap()
}

/// One application instance.
struct TestClient {
    ctx: StoreContext,
    provider: Arc<MemoryProvider>,
    network: NetworkSyncher,
}

impl TestClient {
    fn new(server: &Arc<InMemoryServer>, config: SyncConfig) -> Self {
        let provider = Arc::new(MemoryProvider::new(Arc::clone(server)));
        let ctx = StoreContext::new(config, provider.clone());
        let network = NetworkSyncher::new(
            Graph::new(),
            ctx.open("net1").expect("open collection"),
            "net1",
            Secret::new("s3cret"),
            ctx.config(),
        );
        Self { ctx, provider, network }
    }

    fn manual(server: &Arc<InMemoryServer>) -> Self {
        let mut config = SyncConfig::default();
        config.replication.continuous = false;
        Self::new(server, config)
    }

    fn continuous(server: &Arc<InMemoryServer>) -> Self {
        let mut config = SyncConfig::default();
        config.replication.poll_interval_ms = 10;
        config.position_debounce_ms = 20;
        Self::new(server, config)
    }

    fn graph(&self) -> &Arc<Graph> {
        self.network.graph()
    }

    fn local(&self) -> Arc<InMemoryStore> {
        self.provider.local_store("net1")
    }

    async fn sync(&self) {
        self.ctx
            .open("net1")
            .unwrap()
            .sync_now()
            .await
            .expect("replication pass");
    }

    fn json_syncher(&self, doc_id: &str) -> JsonSyncher {
        JsonSyncher::new(self.ctx.open("net1").unwrap(), doc_id, Secret::new("s3cret"), self.ctx.config())
    }
}

/// Poll `check` until it holds or five seconds pass.
async fn eventually(what: &str, check: impl Fn() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

#[tokio::test]
async fn test_example_scenario() {
    let server = Arc::new(InMemoryServer::new());
    let a = TestClient::manual(&server);
    a.network.enable().await.unwrap();

    a.graph()
        .add(Element::node("n1", fields(json!({"label": "A"})), Position { x: 10.0, y: 20.0 }))
        .unwrap();
    a.network.flush().await;

    // n1's document is created before net1 lists it
    let puts: Vec<String> = a
        .local()
        .writes()
        .into_iter()
        .filter(|w| w.kind == WriteKind::Put)
        .map(|w| w.id)
        .collect();
    assert_eq!(puts, vec!["net1", "n1", "net1"]);
    a.sync().await;

    let b = TestClient::manual(&server);
    b.network.enable().await.unwrap();
    let element = b.graph().element("n1").expect("n1 inserted on b");
    assert_eq!(element.data["label"], "A");
    assert_eq!(element.position, Some(Position { x: 10.0, y: 20.0 }));
    assert_eq!(
        b.network.document().get().unwrap().element_ids(),
        vec!["n1".to_string()]
    );
}

#[tokio::test]
async fn test_continuous_replication_converges() {
    let server = Arc::new(InMemoryServer::new());
    let a = TestClient::continuous(&server);
    let b = TestClient::continuous(&server);
    a.network.enable().await.unwrap();

    a.graph()
        .add(Element::node("n1", fields(json!({"label": "A"})), Position { x: 0.0, y: 0.0 }))
        .unwrap();
    a.network.flush().await;

    // b may find net1 on the server or create it; either way it converges
    let remote = server.collection("net1");
    timeout(Duration::from_secs(5), async {
        while remote.get("net1").await.is_err() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("net1 should reach the server");
    b.network.enable().await.unwrap();
    eventually("n1 on b", || b.graph().contains("n1")).await;

    b.graph().set_data("n1", fields(json!({"label": "B"}))).unwrap();
    b.graph().set_position("n1", Position { x: 5.0, y: 5.0 }).unwrap();
    eventually("label B on a", || {
        a.graph()
            .element("n1")
            .is_some_and(|e| e.data["label"] == "B" && e.position == Some(Position { x: 5.0, y: 5.0 }))
    })
    .await;

    b.graph().remove("n1").unwrap();
    eventually("n1 removed on a", || !a.graph().contains("n1")).await;

    a.ctx.close();
    b.ctx.close();
}

#[tokio::test]
async fn test_create_then_load_elsewhere() {
    let server = Arc::new(InMemoryServer::new());
    let a = TestClient::manual(&server);
    let b = TestClient::manual(&server);

    let initial = fields(json!({"data": {"label": "A"}, "position": {"x": 1.0, "y": 2.0}}));
    a.json_syncher("doc").create(initial.clone()).await.unwrap();
    a.sync().await;

    let loaded = b.json_syncher("doc").load().await.unwrap();
    assert_eq!(loaded.fields, initial);
}

#[tokio::test]
async fn test_updates_are_visible_immediately() {
    let server = Arc::new(InMemoryServer::new());
    let a = TestClient::manual(&server);
    let doc = a.json_syncher("doc");
    doc.create(Fields::new()).await.unwrap();

    let mut pending = Vec::new();
    for i in 0..5 {
        let mut patch = Fields::new();
        patch.insert(format!("k{i}"), json!(i));
        pending.push(doc.update(patch));
        for j in 0..=i {
            assert_eq!(doc.get_field(&format!("k{j}")), Some(json!(j)));
        }
    }
    for write in pending {
        write.await.unwrap();
    }
    assert_eq!(a.local().writes_for("doc", WriteKind::Put), 6);
}

#[tokio::test]
async fn test_remote_changes_cause_no_writes() {
    let server = Arc::new(InMemoryServer::new());
    let a = TestClient::manual(&server);
    let b = TestClient::manual(&server);
    a.network.enable().await.unwrap();
    a.graph()
        .add(Element::node("n1", fields(json!({"label": "A"})), Position { x: 0.0, y: 0.0 }))
        .unwrap();
    a.network.flush().await;
    a.sync().await;
    b.network.enable().await.unwrap();

    for label in ["B", "C", "D"] {
        a.graph().set_data("n1", fields(json!({ "label": label }))).unwrap();
        a.network.flush().await;
        a.sync().await;
        b.sync().await;
        b.network.flush().await;
    }
    a.graph().set_network_data(fields(json!({"name": "renamed"})));
    a.network.flush().await;
    a.sync().await;
    b.sync().await;
    b.network.flush().await;

    assert_eq!(b.graph().element("n1").unwrap().data["label"], "D");
    assert_eq!(b.graph().network_data()["name"], "renamed");
    let b_puts = b
        .local()
        .writes()
        .iter()
        .filter(|w| w.kind == WriteKind::Put)
        .count();
    assert_eq!(b_puts, 0);
    // a wrote exactly its own edits: net1 create, n1 create, list append, 3 labels, data
    assert_eq!(a.local().writes_for("n1", WriteKind::Put), 4);
    assert_eq!(a.local().writes_for("net1", WriteKind::Put), 3);
}

#[tokio::test]
async fn test_enable_twice_is_a_noop() {
    let server = Arc::new(InMemoryServer::new());
    let a = TestClient::manual(&server);
    a.network.enable().await.unwrap();
    a.network.enable().await.unwrap();

    let failures = Arc::new(Mutex::new(Vec::new()));
    let failures_clone = Arc::clone(&failures);
    let _sub = a
        .network
        .on_sync_error(move |f| failures_clone.lock().unwrap().push(f));

    a.graph()
        .add(Element::node("n1", Fields::new(), Position { x: 0.0, y: 0.0 }))
        .unwrap();
    a.network.flush().await;
    let child = a.network.children().remove("n1").unwrap();
    child.enable().await.unwrap();

    a.graph().set_data("n1", fields(json!({"label": "once"}))).unwrap();
    a.network.flush().await;

    assert_eq!(a.local().writes_for("n1", WriteKind::Put), 2);
    assert_eq!(a.local().writes_for("net1", WriteKind::Put), 2);
    assert!(failures.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_drag_writes_final_position_once() {
    let server = Arc::new(InMemoryServer::new());
    let a = TestClient::manual(&server);
    a.network.enable().await.unwrap();
    a.graph()
        .add(Element::node("n1", Fields::new(), Position { x: 0.0, y: 0.0 }))
        .unwrap();
    a.network.flush().await;

    for step in 1..=50 {
        a.graph()
            .set_position("n1", Position { x: step as f64, y: step as f64 })
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(500)).await;

    // create + one coalesced position
    assert_eq!(a.local().writes_for("n1", WriteKind::Put), 2);
    assert_eq!(
        a.network.children()["n1"].document().get_field("position"),
        Some(json!({"x": 50.0, "y": 50.0}))
    );
}
