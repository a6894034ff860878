use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use roombook::department::DepartmentManager;
use roombook::engine::EngineConfig;
use roombook::token::TokenSigner;
use roombook::wire;

const PASSWORD: &str = "roombook";
const ADMIN: &str = "root";
// Monday 2024-03-04 10:00 America/New_York.
const MON_10: i64 = 1_709_564_400_000;
const HOUR: i64 = 3_600_000;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("roombook_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let departments = Arc::new(DepartmentManager::new(
        dir,
        1000,
        EngineConfig::default(),
        TokenSigner::new("integration-secret"),
        HashSet::from([ADMIN.to_string()]),
    ));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let departments = departments.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, departments, PASSWORD.to_string(), None)
                    .await;
            });
        }
    });

    addr
}

async fn connect(addr: SocketAddr, account: &str, department: &str) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(department)
        .user(account)
        .password(PASSWORD);

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

fn rows(messages: Vec<SimpleQueryMessage>) -> Vec<SimpleQueryRow> {
    messages
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

fn sqlstate(err: &tokio_postgres::Error) -> String {
    err.as_db_error()
        .map(|db| db.code().code().to_string())
        .unwrap_or_default()
}

/// Admin session that sets up one room and a roster for `department`.
async fn seed(addr: SocketAddr, department: &str) -> Ulid {
    let admin = connect(addr, ADMIN, department).await;
    let rid = Ulid::new();
    admin
        .batch_execute(&format!(
            "INSERT INTO resources (id, room, title) VALUES ('{rid}', '100 Dodge', 'Space A')"
        ))
        .await
        .unwrap();
    for (account, role) in [("u1", "member"), ("u2", "member"), ("s1", "staff")] {
        admin
            .batch_execute(&format!(
                "INSERT INTO users (account, role) VALUES ('{account}', '{role}')"
            ))
            .await
            .unwrap();
    }
    rid
}

async fn book(client: &Client, rid: Ulid, start: i64, end: i64) -> Result<SimpleQueryRow, tokio_postgres::Error> {
    let messages = client
        .simple_query(&format!(
            r#"INSERT INTO reservations (resource_id, start, "end") VALUES ('{rid}', {start}, {end})"#
        ))
        .await?;
    Ok(rows(messages).into_iter().next().unwrap())
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn create_returns_row_with_token() {
    let addr = start_test_server().await;
    let rid = seed(addr, "ECON").await;
    let u1 = connect(addr, "u1", "ECON").await;

    let row = book(&u1, rid, MON_10, MON_10 + HOUR).await.unwrap();
    assert_eq!(row.get("owner"), Some("u1"));
    assert_eq!(row.get("resource_name"), Some("100 Dodge Space A"));
    assert_eq!(row.get("active"), Some("t"));
    assert_eq!(row.get("start_local"), Some("2024-03-04T10:00:00-05:00"));
    assert!(row.get("token").unwrap().contains('.'));

    let mine = rows(u1.simple_query("SELECT * FROM reservations").await.unwrap());
    assert_eq!(mine.len(), 1);
}

#[tokio::test]
async fn overlap_rejected_with_exclusion_state() {
    let addr = start_test_server().await;
    let rid = seed(addr, "ECON").await;
    let u1 = connect(addr, "u1", "ECON").await;
    let u2 = connect(addr, "u2", "ECON").await;

    book(&u1, rid, MON_10, MON_10 + HOUR).await.unwrap();
    let err = book(&u2, rid, MON_10 + HOUR / 2, MON_10 + 2 * HOUR)
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "23P01");

    // Touching endpoints are fine.
    book(&u2, rid, MON_10 + HOUR, MON_10 + 2 * HOUR).await.unwrap();
}

#[tokio::test]
async fn weekly_quota_enforced() {
    let addr = start_test_server().await;
    let rid = seed(addr, "ECON").await;
    let u1 = connect(addr, "u1", "ECON").await;

    for day in 0..5 {
        let start = MON_10 + day * 24 * HOUR;
        book(&u1, rid, start, start + HOUR).await.unwrap();
    }
    let err = book(&u1, rid, MON_10 + 2 * HOUR, MON_10 + 3 * HOUR)
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "53400");
}

#[tokio::test]
async fn delete_by_token_and_tampered_token() {
    let addr = start_test_server().await;
    let rid = seed(addr, "ECON").await;
    let u1 = connect(addr, "u1", "ECON").await;

    let row = book(&u1, rid, MON_10, MON_10 + HOUR).await.unwrap();
    let token = row.get("token").unwrap().to_string();

    let (payload, mac) = token.split_once('.').unwrap();
    let flipped = if mac.starts_with('A') { 'B' } else { 'A' };
    let tampered = format!("{payload}.{flipped}{}", &mac[1..]);
    let err = u1
        .batch_execute(&format!("DELETE FROM reservations WHERE token = '{tampered}'"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "22023");

    // Extended protocol with a bound parameter.
    let deleted = u1
        .execute("DELETE FROM reservations WHERE token = $1", &[&token])
        .await
        .unwrap();
    assert_eq!(deleted, 1);

    let mine = rows(u1.simple_query("SELECT * FROM reservations").await.unwrap());
    assert_eq!(mine[0].get("active"), Some("f"));

    // The freed slot is bookable again.
    let u2 = connect(addr, "u2", "ECON").await;
    book(&u2, rid, MON_10, MON_10 + HOUR).await.unwrap();
}

#[tokio::test]
async fn modify_own_reservation_only() {
    let addr = start_test_server().await;
    let rid = seed(addr, "ECON").await;
    let u1 = connect(addr, "u1", "ECON").await;
    let u2 = connect(addr, "u2", "ECON").await;

    let row = book(&u1, rid, MON_10, MON_10 + HOUR).await.unwrap();
    let id = row.get("id").unwrap().to_string();
    let update = format!(
        r#"UPDATE reservations SET start = '2024-03-04T14:00:00-05:00', "end" = '2024-03-04T15:00:00-05:00' WHERE id = '{id}'"#
    );

    let err = u2.batch_execute(&update).await.unwrap_err();
    assert_eq!(sqlstate(&err), "42501");

    u1.batch_execute(&update).await.unwrap();
    let mine = rows(u1.simple_query("SELECT * FROM reservations").await.unwrap());
    assert_eq!(mine[0].get("start_local"), Some("2024-03-04T14:00:00-05:00"));
    assert!(mine[0].get("changed_at").is_some());
}

#[tokio::test]
async fn calendar_shows_reservations_and_blocks() {
    let addr = start_test_server().await;
    let rid = seed(addr, "ECON").await;
    let staff = connect(addr, "s1", "ECON").await;
    let u1 = connect(addr, "u1", "ECON").await;

    let block = Ulid::new();
    staff
        .batch_execute(&format!(
            r#"INSERT INTO blocks (id, resource_id, start, "end", note) VALUES ('{block}', '{rid}', {}, {}, 'painting')"#,
            MON_10 + 2 * HOUR,
            MON_10 + 4 * HOUR
        ))
        .await
        .unwrap();
    book(&u1, rid, MON_10, MON_10 + HOUR).await.unwrap();

    let err = book(&u1, rid, MON_10 + 3 * HOUR, MON_10 + 5 * HOUR)
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "23P01");

    let items = rows(
        u1.simple_query(&format!(
            r#"SELECT * FROM calendar WHERE start >= {} AND "end" <= {}"#,
            MON_10 - 10 * HOUR,
            MON_10 + 14 * HOUR
        ))
        .await
        .unwrap(),
    );
    let kinds: Vec<_> = items.iter().map(|r| r.get("kind").unwrap()).collect();
    assert_eq!(kinds, vec!["reservation", "block"]);
    assert_eq!(items[1].get("title"), Some("painting"));
}

#[tokio::test]
async fn directory_requires_department_admin() {
    let addr = start_test_server().await;
    seed(addr, "ECON").await;
    let u1 = connect(addr, "u1", "ECON").await;

    let err = u1
        .batch_execute(&format!(
            "INSERT INTO resources (id, room, title) VALUES ('{}', '200 Dodge', 'Lab')",
            Ulid::new()
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "42501");
    let err = u1.simple_query("SELECT * FROM users").await.unwrap_err();
    assert_eq!(sqlstate(&err), "42501");

    let staff = connect(addr, "s1", "ECON").await;
    let roster = rows(staff.simple_query("SELECT * FROM users").await.unwrap());
    assert_eq!(roster.len(), 3);
}

#[tokio::test]
async fn departments_are_isolated() {
    let addr = start_test_server().await;
    let econ_room = seed(addr, "ECON").await;
    seed(addr, "HIST").await;

    let u1_hist = connect(addr, "u1", "HIST").await;
    let err = book(&u1_hist, econ_room, MON_10, MON_10 + HOUR)
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "22000");

    let outsider = connect(addr, "zz9", "ECON").await;
    let err = book(&outsider, econ_room, MON_10, MON_10 + HOUR)
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "42501");
}

#[tokio::test]
async fn oversight_for_administrators() {
    let addr = start_test_server().await;
    let econ_room = seed(addr, "ECON").await;
    let hist_room = seed(addr, "HIST").await;

    book(&connect(addr, "u1", "ECON").await, econ_room, MON_10, MON_10 + HOUR)
        .await
        .unwrap();
    book(&connect(addr, "u1", "HIST").await, hist_room, MON_10, MON_10 + HOUR)
        .await
        .unwrap();

    let query = format!(
        r#"SELECT * FROM all_reservations WHERE start >= {} AND "end" <= {}"#,
        MON_10 - HOUR,
        MON_10 + 2 * HOUR
    );
    let admin = connect(addr, ADMIN, "ECON").await;
    let items = rows(admin.simple_query(&query).await.unwrap());
    let mut departments: Vec<_> = items.iter().map(|r| r.get("department").unwrap()).collect();
    departments.sort();
    assert_eq!(departments, vec!["ECON", "HIST"]);

    let staff = connect(addr, "s1", "ECON").await;
    let err = staff.simple_query(&query).await.unwrap_err();
    assert_eq!(sqlstate(&err), "42501");
}

#[tokio::test]
async fn malformed_sql_is_a_syntax_error() {
    let addr = start_test_server().await;
    let u1 = connect(addr, "u1", "ECON").await;
    let err = u1.simple_query("SELEKT nonsense").await.unwrap_err();
    assert_eq!(sqlstate(&err), "42601");
}

#[tokio::test]
async fn wrong_password_rejected() {
    let addr = start_test_server().await;
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("ECON")
        .user("u1")
        .password("wrong");
    assert!(config.connect(NoTls).await.is_err());
}
