use std::net::SocketAddr;
use std::sync::Arc;

use chrono::NaiveDate;
use tokio::net::TcpListener;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

use slotd::clock::FixedClock;
use slotd::engine::{Engine, SlotPolicy};
use slotd::wire::{self, SlotdFactory};

// ── Test infrastructure ──────────────────────────────────────

/// Monday 2026-10-19 08:00 UTC.
fn now() -> i64 {
    at("2026-10-19", 8, 0)
}

fn at(day: &str, hour: u32, minute: u32) -> i64 {
    NaiveDate::parse_from_str(day, "%Y-%m-%d")
        .unwrap()
        .and_hms_opt(hour, minute, 0)
        .unwrap()
        .and_utc()
        .timestamp_millis()
}

async fn start_test_server() -> (SocketAddr, Arc<Engine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("slotd_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(
        Engine::with_clock(
            dir.join("slotd.wal"),
            Arc::new(FixedClock::new(now())),
            SlotPolicy::default(),
        )
        .unwrap(),
    );
    let factory = Arc::new(SlotdFactory::new(engine.clone(), "slotd".to_string()));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let factory = factory.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, factory, None).await;
            });
        }
    });

    (addr, engine)
}

async fn connect(addr: SocketAddr) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("slotd")
        .user("slotd")
        .password("slotd");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn rows(client: &Client, sql: &str) -> Vec<tokio_postgres::SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

async fn sqlstate(client: &Client, sql: &str) -> SqlState {
    let err = client.simple_query(sql).await.unwrap_err();
    err.code().cloned().unwrap_or_else(|| panic!("no SQLSTATE for {sql}: {err}"))
}

async fn weekday_schedule(client: &Client, pid: &str) {
    client
        .simple_query(&format!(
            "INSERT INTO availability (professional_id, days, start_time, end_time, buffer_minutes) \
             VALUES ('{pid}', '1,2,3,4,5', '09:00', '17:00', 0)"
        ))
        .await
        .unwrap();
}

fn book_sql(id: Ulid, pid: &str, start: i64, end: i64) -> String {
    format!(
        r#"INSERT INTO bookings (id, professional_id, client_id, service, start, "end") VALUES ('{id}', '{pid}', 'client-1', 'consultation', {start}, {end})"#
    )
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn slots_over_simple_protocol() {
    let (addr, _) = start_test_server().await;
    let client = connect(addr).await;
    weekday_schedule(&client, "dr-lee").await;

    let slots = rows(
        &client,
        "SELECT * FROM slots WHERE professional_id = 'dr-lee' AND date = '2026-10-26' AND duration = 60",
    )
    .await;
    assert_eq!(slots.len(), 8);
    let first_start = at("2026-10-26", 9, 0).to_string();
    assert_eq!(slots[0].get("start"), Some(first_start.as_str()));
    assert_eq!(slots[0].get("professional_id"), Some("dr-lee"));

    // Saturday.
    let weekend = rows(
        &client,
        "SELECT * FROM slots WHERE professional_id = 'dr-lee' AND date = '2026-10-24' AND duration = 60",
    )
    .await;
    assert!(weekend.is_empty());
}

#[tokio::test]
async fn slots_over_extended_protocol() {
    let (addr, _) = start_test_server().await;
    let client = connect(addr).await;
    weekday_schedule(&client, "dr-lee").await;

    let slots = client
        .query(
            "SELECT * FROM slots WHERE professional_id = $1 AND date = $2 AND duration = $3",
            &[&"dr-lee", &"2026-10-26", &"120"],
        )
        .await
        .unwrap();
    assert_eq!(slots.len(), 4);
    let start: i64 = slots[1].get("start");
    let end: i64 = slots[1].get("end");
    assert_eq!(start, at("2026-10-26", 11, 0));
    assert_eq!(end, at("2026-10-26", 13, 0));
}

#[tokio::test]
async fn slots_for_unknown_professional_is_not_found() {
    let (addr, _) = start_test_server().await;
    let client = connect(addr).await;

    let code = sqlstate(
        &client,
        "SELECT * FROM slots WHERE professional_id = 'nobody' AND date = '2026-10-26' AND duration = 60",
    )
    .await;
    assert_eq!(code.code(), "P0002");
}

#[tokio::test]
async fn booking_lifecycle() {
    let (addr, engine) = start_test_server().await;
    let client = connect(addr).await;
    weekday_schedule(&client, "dr-lee").await;

    let id = Ulid::new();
    let start = at("2026-10-26", 10, 0);
    let end = at("2026-10-26", 11, 0);
    client.simple_query(&book_sql(id, "dr-lee", start, end)).await.unwrap();

    let found = rows(&client, &format!("SELECT * FROM bookings WHERE id = '{id}'")).await;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].get("status"), Some("pending"));
    assert_eq!(found[0].get("client_id"), Some("client-1"));

    client
        .simple_query(&format!("UPDATE bookings SET status = 'confirmed' WHERE id = '{id}'"))
        .await
        .unwrap();
    assert_eq!(
        engine.get_booking(id).await.unwrap().status.to_string(),
        "confirmed"
    );

    // The booked hour is gone from the slot list.
    let slots = rows(
        &client,
        "SELECT * FROM slots WHERE professional_id = 'dr-lee' AND date = '2026-10-26' AND duration = 60",
    )
    .await;
    assert_eq!(slots.len(), 7);
    let booked_start = start.to_string();
    assert!(slots.iter().all(|r| r.get("start") != Some(booked_start.as_str())));

    client
        .simple_query(&format!("UPDATE bookings SET status = 'cancelled' WHERE id = '{id}'"))
        .await
        .unwrap();
    let slots = rows(
        &client,
        "SELECT * FROM slots WHERE professional_id = 'dr-lee' AND date = '2026-10-26' AND duration = 60",
    )
    .await;
    assert_eq!(slots.len(), 8);
}

#[tokio::test]
async fn overlapping_booking_conflicts() {
    let (addr, _) = start_test_server().await;
    let client = connect(addr).await;
    weekday_schedule(&client, "dr-lee").await;

    let start = at("2026-10-26", 10, 0);
    client
        .simple_query(&book_sql(Ulid::new(), "dr-lee", start, start + 3_600_000))
        .await
        .unwrap();

    let err = client
        .simple_query(&book_sql(Ulid::new(), "dr-lee", start + 1_800_000, start + 5_400_000))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::EXCLUSION_VIOLATION));
    let message = err.as_db_error().map(|e| e.message().to_string()).unwrap_or_default();
    assert!(message.contains("Slot already booked"), "{message}");

    // Adjacent is fine.
    client
        .simple_query(&book_sql(Ulid::new(), "dr-lee", start + 3_600_000, start + 7_200_000))
        .await
        .unwrap();
}

#[tokio::test]
async fn blocked_time_rejects_bookings() {
    let (addr, _) = start_test_server().await;
    let client = connect(addr).await;
    weekday_schedule(&client, "dr-lee").await;

    let block = Ulid::new();
    client
        .simple_query(&format!(
            r#"INSERT INTO blocked_time (id, professional_id, start, "end", reason) VALUES ('{block}', 'dr-lee', '2026-10-26T12:00:00Z', '2026-10-26T13:00:00Z', 'lunch')"#
        ))
        .await
        .unwrap();

    let listed = rows(&client, "SELECT * FROM blocked_time WHERE professional_id = 'dr-lee'").await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].get("reason"), Some("lunch"));

    let start = at("2026-10-26", 12, 30);
    let err = client
        .simple_query(&book_sql(Ulid::new(), "dr-lee", start, start + 3_600_000))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::EXCLUSION_VIOLATION));
    let message = err.as_db_error().map(|e| e.message().to_string()).unwrap_or_default();
    assert!(message.contains("Slot is blocked"), "{message}");

    client
        .simple_query(&format!("DELETE FROM blocked_time WHERE id = '{block}'"))
        .await
        .unwrap();
    client
        .simple_query(&book_sql(Ulid::new(), "dr-lee", start, start + 3_600_000))
        .await
        .unwrap();
}

#[tokio::test]
async fn invalid_requests_map_to_sqlstates() {
    let (addr, _) = start_test_server().await;
    let client = connect(addr).await;
    weekday_schedule(&client, "dr-lee").await;

    // start == end
    let start = at("2026-10-26", 10, 0);
    let code = sqlstate(&client, &book_sql(Ulid::new(), "dr-lee", start, start)).await;
    assert_eq!(code, SqlState::INVALID_PARAMETER_VALUE);

    // Non-positive duration.
    let code = sqlstate(
        &client,
        "SELECT * FROM slots WHERE professional_id = 'dr-lee' AND date = '2026-10-26' AND duration = 0",
    )
    .await;
    assert_eq!(code, SqlState::INVALID_PARAMETER_VALUE);

    // Unknown booking.
    let code = sqlstate(
        &client,
        &format!("UPDATE bookings SET status = 'confirmed' WHERE id = '{}'", Ulid::new()),
    )
    .await;
    assert_eq!(code.code(), "P0002");

    // Malformed date literal.
    let code = sqlstate(
        &client,
        "SELECT * FROM slots WHERE professional_id = 'dr-lee' AND date = 'next monday' AND duration = 60",
    )
    .await;
    assert_eq!(code, SqlState::INVALID_TEXT_REPRESENTATION);

    let code = sqlstate(&client, "SELEKT nonsense").await;
    assert_eq!(code, SqlState::SYNTAX_ERROR);
}

#[tokio::test]
async fn duplicate_booking_id_is_unique_violation() {
    let (addr, _) = start_test_server().await;
    let client = connect(addr).await;
    weekday_schedule(&client, "dr-lee").await;

    let id = Ulid::new();
    let start = at("2026-10-26", 9, 0);
    client.simple_query(&book_sql(id, "dr-lee", start, start + 3_600_000)).await.unwrap();
    let code = sqlstate(
        &client,
        &book_sql(id, "dr-lee", start + 7_200_000, start + 10_800_000),
    )
    .await;
    assert_eq!(code, SqlState::UNIQUE_VIOLATION);
}

#[tokio::test]
async fn availability_round_trip_and_exceptions() {
    let (addr, _) = start_test_server().await;
    let client = connect(addr).await;
    weekday_schedule(&client, "dr-lee").await;

    client
        .simple_query(
            "INSERT INTO exceptions (professional_id, date, reason) VALUES ('dr-lee', '2026-10-26', 'conference')",
        )
        .await
        .unwrap();

    let schedule = rows(&client, "SELECT * FROM availability WHERE professional_id = 'dr-lee'").await;
    assert_eq!(schedule.len(), 1);
    assert_eq!(schedule[0].get("days"), Some("[1,2,3,4,5]"));
    assert_eq!(schedule[0].get("start_time"), Some("09:00"));
    let exceptions = schedule[0].get("exceptions").unwrap_or_default();
    assert!(exceptions.contains("2026-10-26"), "{exceptions}");

    let slots = rows(
        &client,
        "SELECT * FROM slots WHERE professional_id = 'dr-lee' AND date = '2026-10-26' AND duration = 60",
    )
    .await;
    assert!(slots.is_empty());

    client
        .simple_query("DELETE FROM exceptions WHERE professional_id = 'dr-lee' AND date = '2026-10-26'")
        .await
        .unwrap();
    client
        .simple_query("DELETE FROM availability WHERE professional_id = 'dr-lee'")
        .await
        .unwrap();
    let gone = rows(&client, "SELECT * FROM availability WHERE professional_id = 'dr-lee'").await;
    assert!(gone.is_empty());
}

#[tokio::test]
async fn concurrent_clients_never_double_book() {
    let (addr, engine) = start_test_server().await;
    let setup = connect(addr).await;
    weekday_schedule(&setup, "dr-lee").await;

    let start = at("2026-10-26", 14, 0);
    let mut handles = Vec::new();
    for _ in 0..16 {
        handles.push(tokio::spawn(async move {
            let client = connect(addr).await;
            client
                .simple_query(&book_sql(Ulid::new(), "dr-lee", start, start + 3_600_000))
                .await
                .is_ok()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(engine.list_bookings("dr-lee").await.len(), 1);
}
