use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};
use ulid::Ulid;

use roster::clock::ManualClock;
use roster::collab::{MemberEntry, MemoryIdentity, SandboxPayments, TracingActivityLog};
use roster::engine::{Collaborators, Engine, EngineConfig};
use roster::model::MembershipTier;
use roster::notify::NotifyHub;
use roster::wire::{self, ServerContext};

// 2026-01-05 00:00 UTC
const MONDAY: i64 = 1_767_571_200_000;
const ADMIN: &str = "admin-secret";

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server(members: &[(&str, MembershipTier)]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("roster_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();

    let identity = MemoryIdentity::new();
    for (token, tier) in members {
        identity.insert(MemberEntry {
            token: token.to_string(),
            member_id: Ulid::new(),
            tier: *tier,
            active: true,
        });
    }
    let hub = Arc::new(NotifyHub::new());
    let engine = Engine::new(
        EngineConfig::new(dir.join("roster.wal")),
        Collaborators {
            identity: Arc::new(identity),
            notifier: hub.clone(),
            activity: Arc::new(TracingActivityLog),
            payments: Arc::new(SandboxPayments::new()),
            clock: Arc::new(ManualClock::new(MONDAY)),
        },
    )
    .unwrap();
    let ctx = Arc::new(ServerContext {
        engine: Arc::new(engine),
        hub: Some(hub),
        admin_token: ADMIN.to_string(),
    });

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let ctx = ctx.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, ctx).await;
            });
        }
    });

    addr
}

struct Client {
    framed: Framed<TcpStream, LinesCodec>,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let socket = TcpStream::connect(addr).await.unwrap();
        Self {
            framed: Framed::new(socket, LinesCodec::new()),
        }
    }

    async fn send_raw(&mut self, line: &str) {
        self.framed.send(line).await.unwrap();
    }

    async fn next_line(&mut self) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(5), self.framed.next())
            .await
            .expect("timed out waiting for a line")
            .expect("connection closed")
            .unwrap();
        serde_json::from_str(&line).unwrap()
    }

    /// Send one request and return its reply, skipping pushed notifications.
    async fn call(&mut self, token: &str, mut request: Value) -> Value {
        request["token"] = json!(token);
        self.send_raw(&request.to_string()).await;
        loop {
            let line = self.next_line().await;
            if line.get("notification").is_none() {
                return line;
            }
        }
    }

    /// Wait for a pushed notification of `kind`, skipping anything else.
    async fn notification(&mut self, kind: &str) -> Value {
        loop {
            let line = self.next_line().await;
            if line["notification"]["kind"] == kind {
                return line["notification"].clone();
            }
        }
    }
}

fn ok(reply: Value) -> Value {
    assert_eq!(reply["ok"], true, "unexpected reply {reply}");
    reply["result"].clone()
}

fn error_code(reply: &Value) -> &str {
    assert_eq!(reply["ok"], false, "unexpected reply {reply}");
    reply["error"]["code"].as_str().unwrap_or_default()
}

async fn schedule_class(client: &mut Client, capacity: u32) -> String {
    let occ = ok(client
        .call(
            ADMIN,
            json!({
                "op": "schedule_occurrence",
                "template_id": Ulid::new().to_string(),
                "date": "2026-01-08",
                "start": "18:00:00",
                "end": "19:00:00",
                "room": "Studio 1",
                "capacity": capacity,
                "intensity": "moderate",
            }),
        )
        .await);
    occ["id"].as_str().unwrap().to_string()
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn admin_operations_require_the_admin_token() {
    let addr = start_test_server(&[("alice", MembershipTier::A)]).await;
    let mut client = Client::connect(addr).await;

    let request = json!({
        "op": "register_trainer",
        "name": "Ola",
        "hourly_rate": 6000,
        "active": true,
        "accepting_new_clients": true,
    });
    let denied = client.call("alice", request.clone()).await;
    assert_eq!(error_code(&denied), "Unauthenticated");
    assert_eq!(denied["error"]["class"], "policy");

    let trainer = ok(client.call(ADMIN, request).await);
    assert_eq!(trainer["hourly_rate"], 6000);
    assert_eq!(trainer["accepting_new_clients"], true);
}

#[tokio::test]
async fn member_books_and_reads_back_a_reservation() {
    let addr = start_test_server(&[("alice", MembershipTier::A), ("bob", MembershipTier::B)]).await;
    let mut client = Client::connect(addr).await;
    let occurrence_id = schedule_class(&mut client, 10).await;

    let unknown = client
        .call("nobody", json!({ "op": "book_class", "occurrence_id": occurrence_id, "category": "drop_in" }))
        .await;
    assert_eq!(error_code(&unknown), "Unauthenticated");

    let booking = ok(client
        .call("alice", json!({ "op": "book_class", "occurrence_id": occurrence_id, "category": "drop_in" }))
        .await);
    assert_eq!(booking["status"], "confirmed");
    assert_eq!(booking["price"], 1500);
    let reservation_id = booking["reservation_id"].as_str().unwrap().to_string();

    let mine = ok(client.call("alice", json!({ "op": "my_reservations" })).await);
    assert_eq!(mine.as_array().map(Vec::len), Some(1));
    assert_eq!(mine[0]["id"], reservation_id.as_str());

    // Another member cannot see it.
    let hidden = client
        .call("bob", json!({ "op": "reservation", "id": reservation_id }))
        .await;
    assert_eq!(error_code(&hidden), "NotFound");

    let again = client
        .call("alice", json!({ "op": "book_class", "occurrence_id": occurrence_id, "category": "standard" }))
        .await;
    assert_eq!(error_code(&again), "AlreadyReserved");
    assert_eq!(again["error"]["retryable"], false);
}

#[tokio::test]
async fn subscriber_is_told_about_waitlist_promotion() {
    let addr = start_test_server(&[("alice", MembershipTier::C), ("bob", MembershipTier::C)]).await;
    let mut alice = Client::connect(addr).await;
    let mut bob = Client::connect(addr).await;
    let occurrence_id = schedule_class(&mut alice, 1).await;

    let subscribed = ok(bob.call("bob", json!({ "op": "subscribe" })).await);
    assert!(subscribed["member_id"].is_string());

    let seat = ok(alice
        .call("alice", json!({ "op": "book_class", "occurrence_id": occurrence_id, "category": "standard" }))
        .await);
    let waiting = ok(bob
        .call("bob", json!({ "op": "book_class", "occurrence_id": occurrence_id, "category": "standard" }))
        .await);
    assert_eq!(waiting["status"], "waitlisted");

    let position = ok(bob.call("bob", json!({ "op": "waitlist", "occurrence_id": occurrence_id })).await);
    assert_eq!(position, json!({ "length": 1, "position": 1 }));

    let cancelled = ok(alice
        .call(
            "alice",
            json!({ "op": "cancel_class_reservation", "reservation_id": seat["reservation_id"] }),
        )
        .await);
    assert_eq!(cancelled["promoted_reservation_id"], waiting["reservation_id"]);

    let pushed = bob.notification("waitlist_promoted").await;
    assert_eq!(pushed["payload"]["reservation_id"], waiting["reservation_id"]);
    assert_eq!(pushed["payload"]["occurrence_id"], occurrence_id.as_str());
}

#[tokio::test]
async fn malformed_lines_get_an_error_and_the_connection_survives() {
    let addr = start_test_server(&[("alice", MembershipTier::A)]).await;
    let mut client = Client::connect(addr).await;

    client.send_raw("this is not json").await;
    let reply = client.next_line().await;
    assert_eq!(error_code(&reply), "InvalidInput");
    assert_eq!(reply["error"]["class"], "validation");

    client.send_raw(r#"{"token":"alice","op":"drop_everything"}"#).await;
    assert_eq!(error_code(&client.next_line().await), "InvalidInput");

    let short = client
        .call(
            "alice",
            json!({
                "op": "book_trainer_appointment",
                "trainer_id": Ulid::new().to_string(),
                "date": "2026-01-07",
                "start": "10:00:00",
                "end": "10:15:00",
                "category": "individual",
                "location": "Gym floor",
            }),
        )
        .await;
    assert_eq!(error_code(&short), "InvalidInput");

    let upcoming = ok(client
        .call("alice", json!({ "op": "upcoming_occurrences", "from": MONDAY, "to": MONDAY + 86_400_000 }))
        .await);
    assert_eq!(upcoming, json!([]));
}

#[tokio::test]
async fn trainer_booking_round_trip() {
    let addr = start_test_server(&[("alice", MembershipTier::A)]).await;
    let mut client = Client::connect(addr).await;

    let trainer = ok(client
        .call(
            ADMIN,
            json!({
                "op": "register_trainer",
                "name": "Ola",
                "hourly_rate": 6000,
                "active": true,
                "accepting_new_clients": true,
            }),
        )
        .await);
    let trainer_id = trainer["id"].clone();

    let booking = ok(client
        .call(
            "alice",
            json!({
                "op": "book_trainer_appointment",
                "trainer_id": trainer_id,
                "date": "2026-01-07",
                "start": "10:00:00",
                "end": "11:00:00",
                "category": "individual",
                "location": "Gym floor",
                "focus": "deadlift form",
            }),
        )
        .await);
    assert_eq!(booking["price"], 6000);

    let slots = ok(client.call("alice", json!({ "op": "trainer_slots", "trainer_id": trainer_id })).await);
    assert_eq!(slots[0]["status"], "booked");

    // 58 hours ahead: full refund.
    let cancelled = ok(client
        .call(
            "alice",
            json!({ "op": "cancel_trainer_appointment", "appointment_id": booking["appointment_id"] }),
        )
        .await);
    assert_eq!(cancelled["refund_tier"], "full");
    assert_eq!(cancelled["refund_amount"], 6000);
    assert!(cancelled["refund_status"]["issued"]["receipt"].is_string());

    let pending = ok(client.call(ADMIN, json!({ "op": "pending_refunds" })).await);
    assert_eq!(pending, json!([]));
    let retried = tokio_test::assert_ok!(
        serde_json::from_value::<Value>(ok(client.call(ADMIN, json!({ "op": "retry_pending_refunds" })).await))
    );
    assert_eq!(retried["issued"], 0);
}
