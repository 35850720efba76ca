//! HTTP API integration tests
//!
//! Serves the router on an ephemeral port and talks to it with reqwest.

use std::collections::BTreeSet;
use std::sync::Arc;

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use serde_json::{json, Value};
use tokio::sync::watch;

use kiwi_node::admission::{unix_now, Admission};
use kiwi_node::api::{create_router, ApiState};
use kiwi_node::message::{Identity, Message, MessageBody};
use kiwi_node::moderation::{ModerationCache, ModerationLists};
use kiwi_node::query::QueryEngine;
use kiwi_node::registry::{RegistrySnapshot, SnapshotCache, StaticRegistry};
use kiwi_node::store::{spawn_writer, LeafStore};
use kiwi_node::sync::SyncStatus;
use kiwi_node::validation::{FreshnessPolicy, Validator};

struct TestServer {
    base: String,
    client: reqwest::Client,
    store: Arc<LeafStore>,
}

impl TestServer {
    async fn post(&self, path: &str, body: Value) -> (u16, Value) {
        let response = self
            .client
            .post(format!("{}{}", self.base, path))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap())
    }

    async fn post_raw(&self, path: &str, body: &'static str) -> (u16, Value) {
        let response = self
            .client
            .post(format!("{}{}", self.base, path))
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap())
    }

    async fn get(&self, path: &str) -> (u16, Value) {
        let response = self
            .client
            .get(format!("{}{}", self.base, path))
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap())
    }
}

async fn serve(snapshot: RegistrySnapshot, moderation: ModerationLists) -> TestServer {
    let store = Arc::new(LeafStore::in_memory());
    let (writer, _task) = spawn_writer(store.clone(), 16);
    let cache = Arc::new(SnapshotCache::with_snapshot(
        Arc::new(StaticRegistry::new(snapshot.clone())),
        snapshot,
    ));
    let admission = Admission::new(Validator::new(FreshnessPolicy::default()), cache.clone(), writer);

    let state = Arc::new(ApiState {
        node_id: "test-node".to_string(),
        peer_id: None,
        admission,
        query: QueryEngine::new(store.clone(), 100),
        store: store.clone(),
        registry: cache,
        moderation: Arc::new(ModerationCache::fixed(moderation)),
        sync_status: watch::channel(SyncStatus::default()).1,
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, create_router(state)).await.unwrap();
    });

    TestServer {
        base: format!("http://{}", addr),
        client: reqwest::Client::new(),
        store,
    }
}

fn identity(key: &SigningKey) -> Identity {
    Identity::from_signing_key(key)
}

fn submission(key: &SigningKey, href: &str, timestamp: u64) -> Message {
    Message::sign(
        key,
        MessageBody::Submission {
            href: href.to_string(),
            title: "A link".to_string(),
        },
        timestamp,
    )
}

fn upvote(key: &SigningKey, href: &str, timestamp: u64) -> Message {
    Message::sign(
        key,
        MessageBody::Upvote {
            href: href.to_string(),
        },
        timestamp,
    )
}

fn as_json(message: &Message) -> Value {
    serde_json::to_value(message).unwrap()
}

#[tokio::test]
async fn test_health() {
    let server = serve(RegistrySnapshot::default(), ModerationLists::default()).await;
    let body = server
        .client
        .get(format!("{}/health", server.base))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "OK");
}

#[tokio::test]
async fn test_submit_then_duplicate() {
    let key = SigningKey::generate(&mut OsRng);
    let server = serve(
        RegistrySnapshot::new([identity(&key)], []),
        ModerationLists::default(),
    )
    .await;
    let message = as_json(&submission(&key, "https://example.com/post", unix_now()));

    let (status, body) = server.post("/api/v1/messages", message.clone()).await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "success");
    assert_eq!(body["details"], "Message included");
    assert_eq!(body["data"]["seq"], 1);

    let (status, body) = server.post("/api/v1/messages", message).await;
    assert_eq!(status, 200);
    assert_eq!(body["details"], "Message already present");
    assert_eq!(server.store.len(), 1);
}

#[tokio::test]
async fn test_rejections_map_to_status_codes() {
    let allowed = SigningKey::generate(&mut OsRng);
    let stranger = SigningKey::generate(&mut OsRng);
    let server = serve(
        RegistrySnapshot::new([identity(&allowed)], []),
        ModerationLists::default(),
    )
    .await;

    // Not on the allowlist.
    let (status, body) = server
        .post(
            "/api/v1/messages",
            as_json(&submission(&stranger, "https://example.com", unix_now())),
        )
        .await;
    assert_eq!(status, 403);
    assert_eq!(body["status"], "error");
    assert_eq!(body["code"], 403);
    assert_eq!(body["data"]["reason"], "Unauthorized");

    // Body changed after signing.
    let mut tampered = as_json(&submission(&allowed, "https://example.com", unix_now()));
    tampered["title"] = json!("Something else");
    let (status, body) = server.post("/api/v1/messages", tampered).await;
    assert_eq!(status, 400);
    assert_eq!(body["data"]["reason"], "InvalidSignature");

    // Missing field.
    let mut incomplete = as_json(&submission(&allowed, "https://example.com", unix_now()));
    incomplete.as_object_mut().unwrap().remove("href");
    let (status, body) = server.post("/api/v1/messages", incomplete).await;
    assert_eq!(status, 400);
    assert_eq!(body["data"]["reason"], "SchemaInvalid");

    // Not JSON at all.
    let (status, body) = server.post_raw("/api/v1/messages", "{not json").await;
    assert_eq!(status, 400);
    assert_eq!(body["data"]["reason"], "SchemaInvalid");

    assert!(server.store.is_empty());
}

#[tokio::test]
async fn test_list_pages_through_cursor() {
    let key = SigningKey::generate(&mut OsRng);
    let server = serve(
        RegistrySnapshot::new([identity(&key)], []),
        ModerationLists::default(),
    )
    .await;
    for i in 0..5 {
        let (status, _) = server
            .post(
                "/api/v1/messages",
                as_json(&submission(&key, &format!("https://example.com/{}", i), i + 1)),
            )
            .await;
        assert_eq!(status, 200);
    }

    let mut seen = Vec::new();
    let mut from = Value::Null;
    loop {
        let (status, body) = server
            .post("/api/v1/list", json!({ "amount": 2, "from": from }))
            .await;
        assert_eq!(status, 200);
        let data = &body["data"];
        for leaf in data["leaves"].as_array().unwrap() {
            seen.push(leaf["seq"].as_u64().unwrap());
        }
        from = data["nextCursor"].clone();
        if from.is_null() {
            break;
        }
    }
    assert_eq!(seen, vec![1, 2, 3, 4, 5]);

    // Filters compose with paging.
    let (_, body) = server
        .post(
            "/api/v1/list",
            json!({ "amount": 10, "types": ["submission"], "startDatetime": 4 }),
        )
        .await;
    assert_eq!(body["data"]["leaves"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_list_pagination_errors() {
    let server = serve(RegistrySnapshot::default(), ModerationLists::default()).await;

    let (status, body) = server.post("/api/v1/list", json!({})).await;
    assert_eq!(status, 400);
    assert_eq!(body["data"]["reason"], "PaginationInvalid");

    let (status, _) = server.post("/api/v1/list", json!({ "amount": 0 })).await;
    assert_eq!(status, 400);

    let (status, body) = server
        .post("/api/v1/list", json!({ "amount": 5, "from": "zz" }))
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["data"]["reason"], "PaginationInvalid");
}

#[tokio::test]
async fn test_karma_credits_first_submitter() {
    let a = SigningKey::generate(&mut OsRng);
    let b = SigningKey::generate(&mut OsRng);
    let c = SigningKey::generate(&mut OsRng);
    let server = serve(
        RegistrySnapshot::new([identity(&a), identity(&b), identity(&c)], []),
        ModerationLists::default(),
    )
    .await;

    for message in [
        submission(&a, "http://EXAMPLE.com/a/", 1),
        submission(&b, "https://example.com/a", 2),
    ] {
        let (status, _) = server.post("/api/v1/messages", as_json(&message)).await;
        assert_eq!(status, 200);
    }

    let (status, body) = server.get("/api/v1/karma").await;
    assert_eq!(status, 200);
    let board = body["data"].as_array().unwrap();
    assert_eq!(board.len(), 3);
    assert_eq!(board[0]["identity"], identity(&a).to_string());
    assert_eq!(board[0]["karma"], 2);

    // Zero scores follow, ordered by identity.
    let mut zeros: Vec<String> = vec![identity(&b).to_string(), identity(&c).to_string()];
    zeros.sort();
    assert_eq!(board[1]["identity"], zeros[0]);
    assert_eq!(board[1]["karma"], 0);
    assert_eq!(board[2]["identity"], zeros[1]);
    assert_eq!(board[2]["karma"], 0);
}

#[tokio::test]
async fn test_posts_hide_moderated_and_credit_owner() {
    let owner = SigningKey::generate(&mut OsRng);
    let delegate = SigningKey::generate(&mut OsRng);
    let snapshot = RegistrySnapshot::new(
        [identity(&owner)],
        [(identity(&delegate), identity(&owner))],
    );
    let moderation = ModerationLists::new(["https://spam.example/".to_string()], BTreeSet::new());
    let server = serve(snapshot, moderation).await;

    for message in [
        submission(&delegate, "https://good.example", 1),
        submission(&owner, "https://spam.example", 2),
        upvote(&owner, "https://good.example", 3),
    ] {
        let (status, _) = server.post("/api/v1/messages", as_json(&message)).await;
        assert_eq!(status, 200);
    }

    let (status, body) = server.post("/api/v1/posts", json!({ "amount": 10 })).await;
    assert_eq!(status, 200);
    let posts = body["data"]["leaves"].as_array().unwrap();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0]["message"]["href"], "https://good.example");
    assert_eq!(posts[0]["author"], identity(&owner).to_string());

    let (_, body) = server.get("/api/v1/karma").await;
    assert_eq!(body["data"][0]["karma"], 2);
}

#[tokio::test]
async fn test_allowlist_and_status() {
    let key = SigningKey::generate(&mut OsRng);
    let server = serve(
        RegistrySnapshot::new([identity(&key)], []),
        ModerationLists::default(),
    )
    .await;
    server
        .post(
            "/api/v1/messages",
            as_json(&upvote(&key, "https://example.com", unix_now())),
        )
        .await;

    let (status, body) = server.get("/api/v1/allowlist").await;
    assert_eq!(status, 200);
    assert_eq!(body["data"], json!([identity(&key).to_string()]));

    let (status, body) = server.get("/api/v1/status").await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["nodeId"], "test-node");
    assert_eq!(body["data"]["leafCount"], 1);
    assert_eq!(body["data"]["registryLoaded"], true);
    assert_eq!(body["data"]["root"], server.store.root().to_string());
}
