//! Connection state machine tests against a scripted in-memory server.
//!
//! Each scripted chunk is one server turn. Reads hand out at most `max` bytes
//! of the current chunk, and an exhausted script reads as end of stream.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use asupersync::runtime::RuntimeBuilder;
use asupersync::{Cx, Outcome};

use mywire::auth::secure_auth;
use mywire::protocol::capabilities::*;
use mywire::protocol::server_status::{SERVER_SESSION_STATE_CHANGED, SERVER_STATUS_AUTOCOMMIT};
use mywire::protocol::session_track;
use mywire::protocol::writer::frame_payload;
use mywire::protocol::PacketWriter;
use mywire::{Config, Connection, ConnectionState, Connector, Error, Transport, Value};
use mywire_core::error::{ConnectionErrorKind, QueryErrorKind, ValidationErrorKind};

const SERVER_CAPS: u32 = CLIENT_LONG_PASSWORD
    | CLIENT_CONNECT_WITH_DB
    | CLIENT_PROTOCOL_41
    | CLIENT_TRANSACTIONS
    | CLIENT_SECURE_CONNECTION
    | CLIENT_MULTI_STATEMENTS
    | CLIENT_MULTI_RESULTS
    | CLIENT_PS_MULTI_RESULTS
    | CLIENT_PLUGIN_AUTH
    | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
    | CLIENT_SESSION_TRACK;

const TYPE_LONGLONG: u8 = 0x08;
const TYPE_DOUBLE: u8 = 0x05;
const TYPE_VAR_STRING: u8 = 0xFD;

// === Scripted transport ===

#[derive(Clone, Default)]
struct ScriptedConnector {
    script: Vec<Vec<u8>>,
    written: Arc<Mutex<Vec<Vec<u8>>>>,
    connects: Arc<AtomicUsize>,
}

impl ScriptedConnector {
    fn new(script: Vec<Vec<u8>>) -> Self {
        Self {
            script,
            ..Self::default()
        }
    }

    /// Split every turn into single bytes.
    fn bytewise(script: Vec<Vec<u8>>) -> Self {
        Self::new(
            script
                .into_iter()
                .flat_map(|turn| turn.into_iter().map(|b| vec![b]))
                .collect(),
        )
    }

    fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().unwrap().clone()
    }

    fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

struct ScriptedTransport {
    chunks: VecDeque<Vec<u8>>,
    written: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Connector for ScriptedConnector {
    type Transport = ScriptedTransport;

    async fn connect(&self, _addr: &str) -> io::Result<ScriptedTransport> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptedTransport {
            chunks: self.script.iter().cloned().collect(),
            written: Arc::clone(&self.written),
        })
    }
}

impl Transport for ScriptedTransport {
    async fn read(&mut self, max: usize) -> io::Result<Vec<u8>> {
        let Some(mut chunk) = self.chunks.pop_front() else {
            return Ok(Vec::new());
        };
        if chunk.len() > max {
            let rest = chunk.split_off(max);
            self.chunks.push_front(rest);
        }
        Ok(chunk)
    }

    async fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.written.lock().unwrap().push(data.to_vec());
        Ok(data.len())
    }
}

/// A connector whose connect attempt is refused.
struct RefusingConnector;

impl Connector for RefusingConnector {
    type Transport = ScriptedTransport;

    async fn connect(&self, _addr: &str) -> io::Result<ScriptedTransport> {
        Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
    }
}

// === Server packets ===

fn packet(seq: u8, payload: &[u8]) -> Vec<u8> {
    frame_payload(payload, seq).0
}

/// Concatenate packets into one server turn, numbering them from `first_seq`.
fn turn(first_seq: u8, payloads: &[Vec<u8>]) -> Vec<u8> {
    payloads
        .iter()
        .enumerate()
        .flat_map(|(i, p)| packet(first_seq.wrapping_add(i as u8), p))
        .collect()
}

fn scramble() -> Vec<u8> {
    (1..=20).collect()
}

fn greeting() -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(10);
    w.write_null_string("8.0.36-scripted");
    w.write_u32_le(7);
    w.write_bytes(&scramble()[..8]);
    w.write_u8(0);
    w.write_u16_le((SERVER_CAPS & 0xFFFF) as u16);
    w.write_u8(45);
    w.write_u16_le(SERVER_STATUS_AUTOCOMMIT);
    w.write_u16_le((SERVER_CAPS >> 16) as u16);
    w.write_u8(21);
    w.write_zeros(10);
    w.write_bytes(&scramble()[8..]);
    w.write_u8(0);
    w.write_null_string("mysql_native_password");
    w.into_bytes()
}

fn ok(affected_rows: u64, last_insert_id: u64) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(0x00);
    w.write_lenenc_int(affected_rows);
    w.write_lenenc_int(last_insert_id);
    w.write_u16_le(SERVER_STATUS_AUTOCOMMIT);
    w.write_u16_le(0);
    w.into_bytes()
}

fn err(code: u16, state: &str, message: &str) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(0xFF);
    w.write_u16_le(code);
    w.write_u8(b'#');
    w.write_bytes(state.as_bytes());
    w.write_bytes(message.as_bytes());
    w.into_bytes()
}

fn eof(warnings: u16) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(0xFE);
    w.write_u16_le(warnings);
    w.write_u16_le(SERVER_STATUS_AUTOCOMMIT);
    w.into_bytes()
}

fn column(name: &str, column_type: u8) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_lenenc_string("def");
    w.write_lenenc_string("shop");
    w.write_lenenc_string("books");
    w.write_lenenc_string("books");
    w.write_lenenc_string(name);
    w.write_lenenc_string(name);
    w.write_lenenc_int(0x0c);
    w.write_u16_le(45);
    w.write_u32_le(255);
    w.write_u8(column_type);
    w.write_u16_le(0);
    w.write_u8(0);
    w.write_zeros(2);
    w.into_bytes()
}

fn row(values: &[Option<&str>]) -> Vec<u8> {
    let mut w = PacketWriter::new();
    for value in values {
        match value {
            Some(v) => w.write_lenenc_string(v),
            None => w.write_u8(0xFB),
        }
    }
    w.into_bytes()
}

fn column_count(n: u64) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_lenenc_int(n);
    w.into_bytes()
}

/// Greeting followed by a successful auth reply.
fn handshake_turns() -> Vec<Vec<u8>> {
    vec![packet(0, &greeting()), packet(2, &ok(0, 0))]
}

fn books_result_turn() -> Vec<u8> {
    turn(
        1,
        &[
            column_count(3),
            column("id", TYPE_LONGLONG),
            column("title", TYPE_VAR_STRING),
            column("price", TYPE_DOUBLE),
            eof(0),
            row(&[Some("1"), Some("Dune"), Some("9.5")]),
            row(&[Some("2"), None, None]),
            eof(1),
        ],
    )
}

fn config() -> Config {
    Config::new()
        .host("db.test")
        .user("app")
        .password("secret")
        .database("shop")
}

fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

fn expect_err<T>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        Outcome::Ok(_) => panic!("expected error, got ok"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

fn run<F: std::future::Future<Output = ()>>(f: impl FnOnce(Cx) -> F) {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    rt.block_on(f(cx));
}

// === Tests ===

#[test]
fn handshake_response_is_sent_with_sequence_one() {
    let connector = ScriptedConnector::new(handshake_turns());
    let probe = connector.clone();

    run(|cx| async move {
        let mut conn = Connection::with_connector(config(), connector);
        unwrap_outcome(conn.connect(&cx).await);

        assert_eq!(conn.state(), ConnectionState::Ready);
        assert_eq!(conn.info().server_version, "8.0.36-scripted");
        assert_eq!(conn.connection_id(), 7);
        assert_eq!(conn.info().charset, Some(45));
        assert_eq!(conn.auth_plugin(), Some("mysql_native_password"));
        assert_eq!(conn.server_capabilities(), SERVER_CAPS);
        assert_eq!(conn.capabilities() & CLIENT_PLUGIN_AUTH, 0);
        assert_ne!(conn.capabilities() & CLIENT_CONNECT_WITH_DB, 0);

        // A second connect does not reopen anything
        unwrap_outcome(conn.connect(&cx).await);
    });

    assert_eq!(probe.connect_count(), 1);
    let written = probe.written();
    assert_eq!(written.len(), 1);

    let response = &written[0];
    let len = usize::from(response[0])
        | usize::from(response[1]) << 8
        | usize::from(response[2]) << 16;
    assert_eq!(len, response.len() - 4);
    assert_eq!(response[3], 1);

    // caps(4) + max packet(4) + charset(1) + filler(23), then "app\0"
    let body = &response[4..];
    assert_eq!(body[8], 45);
    assert_eq!(&body[32..36], b"app\0");
    assert_eq!(body[36], 20);
    assert_eq!(&body[37..57], &secure_auth("secret", &scramble()));
    assert_eq!(&body[57..], b"shop\0");
}

#[test]
fn query_decodes_typed_rows() {
    let mut script = handshake_turns();
    script.push(books_result_turn());
    let connector = ScriptedConnector::new(script);
    let probe = connector.clone();

    run(|cx| async move {
        let mut conn = Connection::with_connector(config(), connector);
        let rows = unwrap_outcome(conn.query(&cx, "SELECT id, title, price FROM books").await);

        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows.column_names().collect::<Vec<_>>(),
            vec!["id", "title", "price"]
        );
        let first = rows.get(0).unwrap();
        assert_eq!(first.get("id"), Some(&Value::Integer(1)));
        assert_eq!(first.get("title"), Some(&Value::Text("Dune".into())));
        assert_eq!(first.get("price"), Some(&Value::Float(9.5)));
        let second = rows.get(1).unwrap();
        assert_eq!(second.get("title"), Some(&Value::Null));
        assert_eq!(second.get("price"), Some(&Value::Null));

        assert_eq!(conn.info().warnings, 1);
        assert!(conn.is_ready());
    });

    let written = probe.written();
    let query = &written[1];
    assert_eq!(query[3], 0, "commands restart the sequence");
    assert_eq!(query[4], 0x03);
    assert_eq!(&query[5..], b"SELECT id, title, price FROM books");
}

#[test]
fn query_survives_byte_at_a_time_delivery() {
    let mut script = handshake_turns();
    script.push(books_result_turn());
    let connector = ScriptedConnector::bytewise(script);

    run(|cx| async move {
        let mut conn = Connection::with_connector(config(), connector);
        let rows = unwrap_outcome(conn.query(&cx, "select * from books").await);
        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows.to_json().unwrap(),
            r#"[{"id":1,"title":"Dune","price":9.5},{"id":2,"title":null,"price":null}]"#
        );
    });
}

#[test]
fn query_without_result_set_returns_empty() {
    let mut script = handshake_turns();
    script.push(packet(1, &ok(0, 0)));
    let connector = ScriptedConnector::new(script);

    run(|cx| async move {
        let mut conn = Connection::with_connector(config(), connector);
        let rows = unwrap_outcome(conn.query(&cx, "SELECT 1 INTO @x").await);
        assert!(rows.is_empty());
        assert!(rows.columns().is_empty());
    });
}

#[test]
fn exec_records_ok_packet_counters() {
    let mut script = handshake_turns();
    script.push(packet(1, &ok(3, 42)));
    let connector = ScriptedConnector::new(script);

    run(|cx| async move {
        let mut conn = Connection::with_connector(config(), connector);
        unwrap_outcome(
            conn.exec(&cx, "INSERT INTO books (title) VALUES ('a'), ('b'), ('c')")
                .await,
        );
        assert_eq!(conn.affected_rows(), 3);
        assert_eq!(conn.last_insert_id(), 42);
    });
}

#[test]
fn ok_packet_session_state_is_tracked() {
    let mut sysvar = PacketWriter::new();
    sysvar.write_lenenc_string("autocommit");
    sysvar.write_lenenc_string("OFF");
    let mut schema = PacketWriter::new();
    schema.write_lenenc_string("archive");

    let mut block = PacketWriter::new();
    block.write_u8(session_track::SYSTEM_VARIABLES);
    block.write_lenenc_bytes(sysvar.as_bytes());
    block.write_u8(session_track::SCHEMA);
    block.write_lenenc_bytes(schema.as_bytes());

    let mut ok = PacketWriter::new();
    ok.write_u8(0x00);
    ok.write_lenenc_int(0);
    ok.write_lenenc_int(0);
    ok.write_u16_le(SERVER_SESSION_STATE_CHANGED);
    ok.write_u16_le(0);
    ok.write_lenenc_string("");
    ok.write_lenenc_bytes(block.as_bytes());

    let mut script = handshake_turns();
    script.push(packet(1, ok.as_bytes()));
    let connector = ScriptedConnector::new(script);

    run(|cx| async move {
        let mut conn = Connection::with_connector(config(), connector);
        unwrap_outcome(conn.exec(&cx, "USE archive").await);

        let session = &conn.info().session_state;
        assert_eq!(session.system_variables["autocommit"], "OFF");
        assert_eq!(session.schema.as_deref(), Some("archive"));
    });
}

#[test]
fn ping_expects_ok() {
    let mut script = handshake_turns();
    script.push(packet(1, &ok(0, 0)));
    let connector = ScriptedConnector::new(script);
    let probe = connector.clone();

    run(|cx| async move {
        let mut conn = Connection::with_connector(config(), connector);
        unwrap_outcome(conn.ping(&cx).await);
    });

    assert_eq!(probe.written()[1], vec![1, 0, 0, 0, 0x0e]);
}

#[test]
fn misused_commands_fail_before_connecting() {
    let connector = ScriptedConnector::new(handshake_turns());
    let probe = connector.clone();

    run(|cx| async move {
        let mut conn = Connection::with_connector(config(), connector);

        match expect_err(conn.query(&cx, "UPDATE books SET title = 'x'").await) {
            Error::Validation(v) => assert_eq!(v.kind, ValidationErrorKind::NotSelect),
            e => panic!("expected validation error, got {e}"),
        }
        match expect_err(conn.exec(&cx, "SELECT 1").await) {
            Error::Validation(v) => assert_eq!(v.kind, ValidationErrorKind::UnexpectedSelect),
            e => panic!("expected validation error, got {e}"),
        }
        assert_eq!(conn.state(), ConnectionState::Unconnected);
    });

    assert_eq!(probe.connect_count(), 0);
    assert!(probe.written().is_empty());
}

#[test]
fn server_error_keeps_connection_ready() {
    let mut script = handshake_turns();
    script.push(packet(
        1,
        &err(1146, "42S02", "Table 'shop.missing' doesn't exist"),
    ));
    script.push(packet(1, &ok(0, 0)));
    let connector = ScriptedConnector::new(script);

    run(|cx| async move {
        let mut conn = Connection::with_connector(config(), connector);

        match expect_err(conn.query(&cx, "SELECT * FROM missing").await) {
            Error::Query(q) => {
                assert_eq!(q.code, 1146);
                assert_eq!(q.kind, QueryErrorKind::NotFound);
                assert_eq!(q.sqlstate.as_deref(), Some("42S02"));
                assert_eq!(q.message, "Table 'shop.missing' doesn't exist");
                assert_eq!(q.sql.as_deref(), Some("SELECT * FROM missing"));
            }
            e => panic!("expected query error, got {e}"),
        }

        assert_eq!(conn.state(), ConnectionState::Ready);
        unwrap_outcome(conn.ping(&cx).await);
    });
}

#[test]
fn protocol_error_closes_connection() {
    let mut script = handshake_turns();
    script.push(packet(1, &[0x7A, 1, 2, 3]));
    let connector = ScriptedConnector::new(script);

    run(|cx| async move {
        let mut conn = Connection::with_connector(config(), connector);

        let e = expect_err(conn.exec(&cx, "DELETE FROM books").await);
        assert!(matches!(e, Error::Protocol(_)), "got {e}");
        assert!(e.to_string().contains("0x7a"));
        assert_eq!(conn.state(), ConnectionState::Closed);

        match expect_err(conn.ping(&cx).await) {
            Error::Connection(c) => assert_eq!(c.kind, ConnectionErrorKind::Closed),
            e => panic!("expected closed connection, got {e}"),
        }
    });
}

#[test]
fn oversized_column_count_is_a_protocol_error() {
    let mut script = handshake_turns();
    script.push(packet(1, &[0xFE, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]));
    let connector = ScriptedConnector::new(script);

    run(|cx| async move {
        let mut conn = Connection::with_connector(config(), connector);

        let e = expect_err(conn.query(&cx, "SELECT * FROM books").await);
        assert!(matches!(e, Error::Protocol(_)), "got {e}");
        assert!(e.to_string().contains("Invalid column count"), "got {e}");
        assert_eq!(conn.state(), ConnectionState::Closed);
    });
}

#[test]
fn server_hangup_is_fatal() {
    let connector = ScriptedConnector::new(handshake_turns());

    run(|cx| async move {
        let mut conn = Connection::with_connector(config(), connector);

        match expect_err(conn.ping(&cx).await) {
            Error::Connection(c) => assert_eq!(c.kind, ConnectionErrorKind::Disconnected),
            e => panic!("expected disconnect, got {e}"),
        }
        assert_eq!(conn.state(), ConnectionState::Closed);
    });
}

#[test]
fn close_sends_quit_once() {
    let connector = ScriptedConnector::new(handshake_turns());
    let probe = connector.clone();

    run(|cx| async move {
        let mut conn = Connection::with_connector(config(), connector);
        unwrap_outcome(conn.connect(&cx).await);
        unwrap_outcome(conn.close(&cx).await);
        assert_eq!(conn.state(), ConnectionState::Closed);

        unwrap_outcome(conn.close(&cx).await);
        assert!(matches!(
            expect_err(conn.query(&cx, "SELECT 1").await),
            Error::Connection(_)
        ));
    });

    let written = probe.written();
    assert_eq!(written.len(), 2);
    assert_eq!(written[1], vec![1, 0, 0, 0, 0x01]);
}

#[test]
fn close_before_connect_is_a_no_op() {
    let connector = ScriptedConnector::new(handshake_turns());
    let probe = connector.clone();

    run(|cx| async move {
        let mut conn = Connection::with_connector(config(), connector);
        unwrap_outcome(conn.close(&cx).await);
        assert_eq!(conn.state(), ConnectionState::Unconnected);
    });

    assert_eq!(probe.connect_count(), 0);
}

#[test]
fn handshake_error_closes_connection() {
    let script = vec![
        packet(0, &greeting()),
        packet(2, &err(1045, "28000", "Access denied for user 'app'")),
    ];
    let connector = ScriptedConnector::new(script);

    run(|cx| async move {
        let mut conn = Connection::with_connector(config(), connector);

        match expect_err(conn.query(&cx, "SELECT 1").await) {
            Error::Query(q) => {
                assert_eq!(q.code, 1045);
                assert_eq!(q.kind, QueryErrorKind::Permission);
            }
            e => panic!("expected access denied, got {e}"),
        }
        assert_eq!(conn.state(), ConnectionState::Closed);
    });
}

#[test]
fn auth_switch_request_is_an_auth_error() {
    let mut switch = PacketWriter::new();
    switch.write_u8(0xFE);
    switch.write_null_string("caching_sha2_password");
    switch.write_bytes(&scramble());
    switch.write_u8(0);

    let script = vec![packet(0, &greeting()), packet(2, switch.as_bytes())];
    let connector = ScriptedConnector::new(script);

    run(|cx| async move {
        let mut conn = Connection::with_connector(config(), connector);

        match expect_err(conn.connect(&cx).await) {
            Error::Auth(a) => assert_eq!(a.plugin.as_deref(), Some("caching_sha2_password")),
            e => panic!("expected auth error, got {e}"),
        }
        assert_eq!(conn.state(), ConnectionState::Closed);
    });
}

#[test]
fn refused_connect_reports_refused() {
    run(|cx| async move {
        let mut conn = Connection::with_connector(config(), RefusingConnector);

        match expect_err(conn.ping(&cx).await) {
            Error::Connection(c) => {
                assert_eq!(c.kind, ConnectionErrorKind::Refused);
                assert!(c.message.contains("db.test:3306"));
            }
            e => panic!("expected refused connection, got {e}"),
        }
        assert_eq!(conn.state(), ConnectionState::Closed);
    });
}
