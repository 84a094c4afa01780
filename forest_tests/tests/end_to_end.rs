//! Whole-backbone scenarios: replay convergence and the full
//! source → river → tree → wind → nim → humus → decomposer → soil flow.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use decomposer::{Decomposer, DecomposerConfig};
use forest_tests::TestBackbone;
use forest_types::{Action, Leaf, RiverData};
use grove::sources::{SignatureVerifier, WebhookConfig, WebhookSource};
use grove::{GroveError, Nim, NimContext, Tree};
use serde_json::{json, Value};
use soil::{MemorySoil, Soil, SoilConfig};

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if check().await {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Replaying the full change log into an empty soil produces the same state
/// a single forward run left behind.
#[tokio::test]
async fn replay_converges_to_forward_state() {
    test_helpers::maybe_start_logging();
    let backbone = TestBackbone::new();

    // A history with creates, updates, deletes and a re-create.
    let humus = &backbone.humus;
    humus
        .append("seed", "users/u1", Action::Create, Some(json!({"n": "A"})))
        .await
        .unwrap();
    humus
        .append("seed", "users/u2", Action::Create, Some(json!({"n": "B"})))
        .await
        .unwrap();
    humus
        .append("seed", "users/u1", Action::Update, Some(json!({"n": "A2"})))
        .await
        .unwrap();
    humus
        .append("seed", "users/u2", Action::Delete, None)
        .await
        .unwrap();
    humus
        .append("seed", "users/u2", Action::Create, Some(json!({"n": "B2"})))
        .await
        .unwrap();
    humus
        .append("seed", "orders/o1", Action::Update, Some(json!({"total": 9})))
        .await
        .unwrap();

    // Forward run.
    let forward = Decomposer::new(
        humus.clone(),
        Arc::clone(&backbone.soil) as _,
        DecomposerConfig::default(),
    );
    forward.start().await.unwrap();
    eventually("forward projection to catch up", || async {
        forward.lag().await.unwrap() == 0
    })
    .await;
    forward.stop().await;

    let forward_state = backbone.soil_snapshot().await;
    assert_eq!(
        forward_state,
        vec![
            ("orders/o1".to_string(), json!({"total": 9})),
            ("users/u1".to_string(), json!({"n": "A2"})),
            ("users/u2".to_string(), json!({"n": "B2"})),
        ]
    );

    // Replay from slot 0 into a fresh soil under an independent consumer.
    let replay_soil = Arc::new(MemorySoil::new(SoilConfig::default()));
    let replayer = Decomposer::new(
        humus.clone(),
        Arc::clone(&replay_soil) as _,
        DecomposerConfig {
            consumer_name: "replayer".to_string(),
            ..Default::default()
        },
    );
    replayer.start().await.unwrap();
    eventually("replay projection to catch up", || async {
        replayer.lag().await.unwrap() == 0
    })
    .await;
    replayer.stop().await;

    let mut replay_state = Vec::new();
    for key in replay_soil.keys().await.unwrap() {
        let (value, _) = replay_soil.dig(&key).await.unwrap();
        replay_state.push((key, value));
    }
    assert_eq!(replay_state, forward_state);
}

/// Re-running the default consumer over an already-projected log leaves the
/// soil unchanged (idempotent replay onto existing state).
#[tokio::test]
async fn replay_onto_existing_state_is_idempotent() {
    let backbone = TestBackbone::new();

    backbone
        .humus
        .append("seed", "users/u1", Action::Create, Some(json!({"n": "A"})))
        .await
        .unwrap();
    backbone
        .humus
        .append("seed", "users/u1", Action::Update, Some(json!({"n": "A2"})))
        .await
        .unwrap();

    let first = Decomposer::new(
        backbone.humus.clone(),
        Arc::clone(&backbone.soil) as _,
        DecomposerConfig::default(),
    );
    first.start().await.unwrap();
    eventually("first projection", || async {
        first.lag().await.unwrap() == 0
    })
    .await;
    first.stop().await;

    let before = backbone.soil_snapshot().await;

    // Same log, same soil, fresh consumer name: everything replays.
    let second = Decomposer::new(
        backbone.humus.clone(),
        Arc::clone(&backbone.soil) as _,
        DecomposerConfig {
            consumer_name: "second-pass".to_string(),
            ..Default::default()
        },
    );
    second.start().await.unwrap();
    eventually("second projection", || async {
        second.lag().await.unwrap() == 0
    })
    .await;
    second.stop().await;

    assert_eq!(backbone.soil_snapshot().await, before);
}

/// Parses webhook deliveries of `{"user": ..., "name": ...}` into
/// `signup.received` leaves.
#[derive(Debug)]
struct SignupTree;

#[async_trait]
impl Tree for SignupTree {
    fn name(&self) -> &str {
        "signup-tree"
    }

    fn patterns(&self) -> Vec<String> {
        vec!["river.hooks.>".to_string()]
    }

    async fn parse(
        &self,
        data: RiverData,
    ) -> Result<Option<Leaf>, Box<dyn std::error::Error + Send + Sync>> {
        let value: Value = serde_json::from_slice(&data.data)?;
        if value.get("user").is_none() {
            return Ok(None);
        }
        Ok(Some(Leaf::new(
            "signup.received",
            value,
            "",
            data.timestamp,
        )))
    }
}

/// Records each signup into the change log.
#[derive(Debug)]
struct SignupNim;

#[async_trait]
impl Nim for SignupNim {
    fn name(&self) -> &str {
        "signup-nim"
    }

    fn subjects(&self) -> Vec<String> {
        vec!["signup.received".to_string()]
    }

    async fn handle(
        &self,
        leaf: Leaf,
        ctx: &NimContext,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let user = leaf
            .data
            .get("user")
            .and_then(|u| u.as_str())
            .ok_or("signup leaf without user")?;
        ctx.append(
            self.name(),
            &format!("users/{user}"),
            Action::Create,
            Some(leaf.data.clone()),
        )
        .await?;
        Ok(())
    }
}

/// External POST → source → river → tree → wind → nim → humus → decomposer
/// → soil, through a running forest.
#[tokio::test]
async fn webhook_to_soil_pipeline() {
    test_helpers::maybe_start_logging();
    let backbone = TestBackbone::new();
    let forest = backbone.forest(DecomposerConfig::default());

    let webhook = Arc::new(WebhookSource::new(
        "signup-hook",
        WebhookConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
            path: "/hooks/signup".to_string(),
            verifier: SignatureVerifier::None,
        },
    ));
    forest
        .plant_source(Arc::clone(&webhook) as _, "hooks.signup")
        .await
        .unwrap();
    forest.plant_tree(Arc::new(SignupTree)).await.unwrap();
    forest.plant_nim(Arc::new(SignupNim)).await.unwrap();

    forest.start().await.unwrap();
    assert!(forest.is_running());
    let addr = webhook.local_addr().unwrap();

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{addr}/hooks/signup"))
        .body(serde_json::to_vec(&json!({"user": "u1", "name": "Ada"})).unwrap())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);

    // The signup materializes in the soil.
    eventually("signup to reach the soil", || async {
        backbone.soil.dig("users/u1").await.is_ok()
    })
    .await;
    let (value, revision) = backbone.soil.dig("users/u1").await.unwrap();
    assert_eq!(value, json!({"user": "u1", "name": "Ada"}));
    assert!(revision.get() >= 1);

    // A second, identical delivery replays cleanly: create-on-existing is
    // benign and the value stays put.
    let response = client
        .post(format!("http://{addr}/hooks/signup"))
        .body(serde_json::to_vec(&json!({"user": "u1", "name": "Ada"})).unwrap())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);

    eventually("second delivery to be projected", || async {
        forest.decomposer().lag().await.unwrap() == 0
    })
    .await;
    let (value_after, revision_after) = backbone.soil.dig("users/u1").await.unwrap();
    assert_eq!(value_after, value);
    assert_eq!(revision_after, revision);

    forest.stop().await;
    forest.stop().await;
    assert!(!forest.is_running());
}

/// Planting a duplicate name is rejected; planting into a running forest
/// starts the component immediately.
#[tokio::test]
async fn forest_registry_rules() {
    let backbone = TestBackbone::new();
    let forest = backbone.forest(DecomposerConfig::default());

    forest.plant_nim(Arc::new(SignupNim)).await.unwrap();
    assert_matches::assert_matches!(
        forest.plant_nim(Arc::new(SignupNim)).await,
        Err(GroveError::DuplicateName(name)) if name == "signup-nim"
    );

    forest.start().await.unwrap();
    assert_matches::assert_matches!(forest.start().await, Err(GroveError::AlreadyRunning));

    // Planted while running: picks up work right away.
    forest.plant_tree(Arc::new(SignupTree)).await.unwrap();
    assert_eq!(forest.tree_names(), vec!["signup-tree".to_string()]);

    backbone
        .river
        .flow("hooks.signup", serde_json::to_vec(&json!({"user": "u9"})).unwrap())
        .await
        .unwrap();

    eventually("late-planted tree to feed the nim", || async {
        backbone.soil.dig("users/u9").await.is_ok()
    })
    .await;

    forest.uproot_tree("signup-tree").await;
    assert!(forest.tree_names().is_empty());

    forest.stop().await;
}
