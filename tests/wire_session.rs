use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};
use ulid::Ulid;

use gymdesk::engine::Engine;
use gymdesk::model::*;
use gymdesk::notify::NotifyHub;
use gymdesk::wire;

const PASSWORD: &str = "gymdesk";

// ── Test infrastructure ──────────────────────────────────────

struct Club {
    admin: Ulid,
    member: Ulid,
    member_login: Ulid,
    other_member: Ulid,
    court: Ulid,
}

async fn start_test_server() -> (SocketAddr, Arc<Engine>, Club) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("gymdesk_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(Engine::new(dir.join("gymdesk.wal"), Arc::new(NotifyHub::new())).unwrap());
    let club = seed(&engine).await;

    let engine2 = engine.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = engine2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, PASSWORD.to_string()).await;
            });
        }
    });

    (addr, engine, club)
}

async fn seed(engine: &Engine) -> Club {
    let admin = engine
        .register_user(User {
            id: Ulid::new(),
            national_id: "1-9".into(),
            name: "Root".into(),
            role: Role::SuperAdmin,
            member_id: None,
        })
        .await
        .unwrap();
    let plan = engine
        .create_plan(Plan {
            id: Ulid::new(),
            name: "Full".into(),
            description: None,
            price: 30_000,
            duration_days: 30,
            may_reserve_courts: true,
            may_reserve_classes: true,
        })
        .await
        .unwrap();

    let mut members = Vec::new();
    for (rut, first) in [("11111111-1", "Ana"), ("22222222-2", "Bruno")] {
        let m = engine
            .register_member(
                Ulid::new(),
                MemberProfile {
                    national_id: rut.into(),
                    first_name: first.into(),
                    last_name: "Rojas".into(),
                    second_last_name: None,
                    email: format!("{}@example.com", first.to_lowercase()),
                    phone: None,
                    birth_date: None,
                    fitness: Default::default(),
                },
            )
            .await
            .unwrap();
        let start = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        engine.assign_plan(m.id, plan.id, start, 30_000).await.unwrap();
        members.push(m.id);
    }

    let login = engine
        .register_user(User {
            id: Ulid::new(),
            national_id: "11111111-1".into(),
            name: "Ana Rojas".into(),
            role: Role::Member,
            member_id: Some(members[0]),
        })
        .await
        .unwrap();
    let court = engine
        .create_court(Ulid::new(), "Court 1".into(), CourtKind::Futsal)
        .await
        .unwrap();

    Club {
        admin: admin.id,
        member: members[0],
        member_login: login.id,
        other_member: members[1],
        court: court.id,
    }
}

struct Client {
    framed: Framed<TcpStream, LinesCodec>,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self {
            framed: Framed::new(stream, LinesCodec::new()),
        }
    }

    async fn login(addr: SocketAddr, user_id: Ulid) -> Self {
        let mut client = Self::connect(addr).await;
        let reply = client
            .call(json!({"op": "login", "user_id": user_id, "password": PASSWORD}))
            .await;
        assert_eq!(reply["ok"], true, "login failed: {reply}");
        client
    }

    async fn send(&mut self, request: Value) {
        self.framed.send(request.to_string()).await.unwrap();
    }

    async fn next(&mut self) -> Option<Value> {
        let line = tokio::time::timeout(Duration::from_secs(5), self.framed.next())
            .await
            .expect("timed out waiting for a line")?
            .unwrap();
        Some(serde_json::from_str(&line).unwrap())
    }

    async fn call(&mut self, request: Value) -> Value {
        self.send(request).await;
        self.next().await.expect("connection closed")
    }
}

fn booking_request(member: Option<Ulid>, court: Ulid, start: &str, end: &str) -> Value {
    let mut request = json!({
        "op": "save_booking",
        "court_id": court,
        "date": "2024-06-10",
        "range": {"start": start, "end": end},
    });
    if let Some(member) = member {
        request["member_id"] = json!(member);
    }
    request
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn requests_before_login_are_refused() {
    let (addr, _engine, _club) = start_test_server().await;
    let mut client = Client::connect(addr).await;

    let reply = client.call(json!({"op": "list_courts"})).await;
    assert_eq!(reply["ok"], false);
    assert_eq!(reply["error"]["kind"], "not_logged_in");
}

#[tokio::test]
async fn bad_password_closes_the_connection() {
    let (addr, _engine, club) = start_test_server().await;
    let mut client = Client::connect(addr).await;

    let reply = client
        .call(json!({"op": "login", "user_id": club.admin, "password": "nope"}))
        .await;
    assert_eq!(reply["error"]["kind"], "bad_credentials");
    assert!(client.next().await.is_none());
}

#[tokio::test]
async fn malformed_line_keeps_the_session() {
    let (addr, _engine, club) = start_test_server().await;
    let mut client = Client::login(addr, club.admin).await;

    client.framed.send("{not json".to_string()).await.unwrap();
    let reply = client.next().await.unwrap();
    assert_eq!(reply["error"]["kind"], "protocol");

    let reply = client.call(json!({"op": "list_courts"})).await;
    assert_eq!(reply["ok"], true);
    assert_eq!(reply["data"][0]["name"], "Court 1");
}

#[tokio::test]
async fn member_books_for_themselves() {
    let (addr, engine, club) = start_test_server().await;
    let mut client = Client::login(addr, club.member_login).await;

    let reply = client
        .call(booking_request(None, club.court, "14:00:00", "15:00:00"))
        .await;
    assert_eq!(reply["ok"], true, "{reply}");
    assert_eq!(reply["data"]["member_id"], json!(club.member));
    assert_eq!(reply["data"]["status"], "confirmed");

    let date = NaiveDate::from_ymd_opt(2024, 6, 10).unwrap();
    assert_eq!(engine.bookings_of(club.court, date).await.unwrap().len(), 1);

    let reply = client
        .call(booking_request(
            Some(club.other_member),
            club.court,
            "16:00:00",
            "17:00:00",
        ))
        .await;
    assert_eq!(reply["error"]["kind"], "forbidden");
}

#[tokio::test]
async fn overlapping_booking_reports_a_conflict() {
    let (addr, _engine, club) = start_test_server().await;
    let mut admin = Client::login(addr, club.admin).await;

    let first = admin
        .call(booking_request(Some(club.member), club.court, "14:00:00", "15:00:00"))
        .await;
    assert_eq!(first["ok"], true, "{first}");

    let second = admin
        .call(booking_request(
            Some(club.other_member),
            club.court,
            "14:30:00",
            "15:30:00",
        ))
        .await;
    assert_eq!(second["ok"], false);
    assert_eq!(second["error"]["kind"], "schedule_conflict");

    let touching = admin
        .call(booking_request(
            Some(club.other_member),
            club.court,
            "15:00:00",
            "16:00:00",
        ))
        .await;
    assert_eq!(touching["ok"], true, "{touching}");
}

#[tokio::test]
async fn members_cannot_manage_structure() {
    let (addr, _engine, club) = start_test_server().await;
    let mut client = Client::login(addr, club.member_login).await;

    let reply = client
        .call(json!({"op": "create_court", "name": "Court 2", "kind": "tennis"}))
        .await;
    assert_eq!(reply["error"]["kind"], "forbidden");

    let reply = client
        .call(json!({"op": "get_member", "id": club.other_member}))
        .await;
    assert_eq!(reply["error"]["kind"], "forbidden");

    let reply = client.call(json!({"op": "get_member", "id": club.member})).await;
    assert_eq!(reply["ok"], true);
    assert_eq!(reply["data"]["profile"]["first_name"], "Ana");
}

#[tokio::test]
async fn watchers_receive_committed_bookings() {
    let (addr, _engine, club) = start_test_server().await;
    let mut watcher = Client::login(addr, club.admin).await;
    let reply = watcher
        .call(json!({"op": "watch", "resource_id": club.court}))
        .await;
    assert_eq!(reply["ok"], true);

    let mut booker = Client::login(addr, club.member_login).await;
    let reply = booker
        .call(booking_request(None, club.court, "09:00:00", "10:00:00"))
        .await;
    assert_eq!(reply["ok"], true, "{reply}");

    let pushed = watcher.next().await.unwrap();
    assert_eq!(pushed["event"]["BookingSaved"]["booking"]["court_id"], json!(club.court));

    let reply = watcher
        .call(json!({"op": "unwatch", "resource_id": club.court}))
        .await;
    assert_eq!(reply["ok"], true);
}

#[tokio::test]
async fn admin_schedules_a_class_and_member_enrolls() {
    let (addr, _engine, club) = start_test_server().await;
    let mut admin = Client::login(addr, club.admin).await;

    let reply = admin
        .call(json!({
            "op": "register_user",
            "national_id": "33333333-3",
            "name": "Carla",
            "role": "instructor",
        }))
        .await;
    assert_eq!(reply["ok"], true, "{reply}");
    let instructor = reply["data"]["id"].clone();

    let reply = admin
        .call(json!({
            "op": "create_class",
            "details": {
                "name": "Yoga",
                "instructor_id": instructor,
                "date": "2024-06-12",
                "range": {"start": "09:00:00", "end": "10:00:00"},
                "capacity": 1,
            },
        }))
        .await;
    assert_eq!(reply["ok"], true, "{reply}");
    let class_id = reply["data"]["id"].clone();

    let mut member = Client::login(addr, club.member_login).await;
    let reply = member.call(json!({"op": "enroll", "class_id": class_id})).await;
    assert_eq!(reply["ok"], true, "{reply}");
    assert_eq!(reply["data"]["status"], "enrolled");

    let reply = admin
        .call(json!({"op": "enroll", "member_id": club.other_member, "class_id": class_id}))
        .await;
    assert_eq!(reply["error"]["kind"], "capacity_exceeded");

    let reply = admin.call(json!({"op": "class_roster", "id": class_id})).await;
    assert_eq!(reply["data"]["enrolled"], 1);
    assert_eq!(reply["data"]["students"][0]["member_name"], "Ana Rojas");
}

#[tokio::test]
async fn members_watch_only_their_own_record() {
    let (addr, _engine, club) = start_test_server().await;
    let mut ana = Client::login(addr, club.member_login).await;

    let reply = ana
        .call(json!({"op": "watch", "resource_id": club.other_member}))
        .await;
    assert_eq!(reply["error"]["kind"], "forbidden", "{reply}");
    let reply = ana.call(json!({"op": "watch", "resource_id": club.admin})).await;
    assert_eq!(reply["error"]["kind"], "forbidden", "{reply}");
    let reply = ana
        .call(json!({"op": "watch", "resource_id": Ulid::new()}))
        .await;
    assert_eq!(reply["error"]["kind"], "not_found", "{reply}");

    let reply = ana.call(json!({"op": "watch", "resource_id": club.member})).await;
    assert_eq!(reply["ok"], true, "{reply}");

    let mut admin = Client::login(addr, club.admin).await;
    let reply = admin
        .call(json!({"op": "set_member_active", "id": club.member, "active": false}))
        .await;
    assert_eq!(reply["ok"], true, "{reply}");

    let pushed = ana.next().await.unwrap();
    assert_eq!(pushed["event"]["MemberStatusChanged"]["id"], json!(club.member));
}

#[tokio::test]
async fn instructor_generates_a_routine_for_their_student() {
    let (addr, _engine, club) = start_test_server().await;
    let mut admin = Client::login(addr, club.admin).await;

    let reply = admin
        .call(json!({
            "op": "register_user",
            "national_id": "44444444-4",
            "name": "Carla",
            "role": "instructor",
        }))
        .await;
    let carla: Ulid = serde_json::from_value(reply["data"]["id"].clone()).unwrap();
    let reply = admin
        .call(json!({
            "op": "update_member",
            "id": club.member,
            "profile": {
                "national_id": "11111111-1",
                "first_name": "Ana",
                "last_name": "Rojas",
                "email": "ana@example.com",
                "fitness": {
                    "weight_grams": 70000,
                    "height_cm": 175,
                    "goal": "lose_weight",
                    "instructor_id": carla,
                },
            },
        }))
        .await;
    assert_eq!(reply["ok"], true, "{reply}");

    let mut coach = Client::login(addr, carla).await;
    let reply = coach
        .call(json!({
            "op": "create_routine_template",
            "title": "Base",
            "goal": "lose_weight",
            "bmi_min": 1850,
            "bmi_max": 2499,
            "content": "3x12 squats",
        }))
        .await;
    assert_eq!(reply["ok"], true, "{reply}");

    let reply = coach.call(json!({"op": "students"})).await;
    assert_eq!(reply["data"][0]["member_id"], json!(club.member));
    assert_eq!(reply["data"][0]["bmi"], 2286);

    let reply = coach
        .call(json!({"op": "generate_routine", "member_id": club.member}))
        .await;
    assert_eq!(reply["ok"], true, "{reply}");
    assert!(reply["data"]["title"].as_str().unwrap().starts_with("Base - "));

    let reply = coach
        .call(json!({"op": "generate_routine", "member_id": club.other_member}))
        .await;
    assert_eq!(reply["error"]["kind"], "invalid_input", "{reply}");

    let mut ana = Client::login(addr, club.member_login).await;
    let reply = ana
        .call(json!({"op": "member_routines", "member_id": club.member}))
        .await;
    assert_eq!(reply["data"].as_array().unwrap().len(), 1, "{reply}");
    let reply = ana
        .call(json!({"op": "member_payments", "member_id": club.other_member}))
        .await;
    assert_eq!(reply["error"]["kind"], "forbidden", "{reply}");
    let reply = ana.call(json!({"op": "list_payments"})).await;
    assert_eq!(reply["error"]["kind"], "forbidden", "{reply}");
}
