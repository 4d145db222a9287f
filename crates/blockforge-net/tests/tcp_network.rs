//! End-to-end tests for the TCP line transport using blocking std clients.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use blockforge_net::{LineHandshake, MAX_LINE_LEN, MAX_NAME_LEN, NetError, TcpNetwork, TcpSession};
use blockforge_session::{NetworkBackend, Session, SessionConfig, SessionRegistry};

fn bind() -> Arc<TcpNetwork> {
    Arc::new(TcpNetwork::bind("127.0.0.1:0").unwrap())
}

fn connect(network: &TcpNetwork) -> (TcpStream, BufReader<TcpStream>) {
    let stream = TcpStream::connect(network.local_addr()).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let reader = BufReader::new(stream.try_clone().unwrap());
    (stream, reader)
}

fn accept(network: &TcpNetwork) -> Arc<dyn Session> {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if let Some(session) = network.accept_pending().unwrap() {
            return session;
        }
        assert!(Instant::now() < deadline, "no connection accepted");
        thread::sleep(Duration::from_millis(5));
    }
}

fn read_line(reader: &mut BufReader<TcpStream>) -> String {
    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    line.trim_end().to_string()
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

// =========================================================================
// TcpNetwork
// =========================================================================

#[test]
fn test_accept_pending_empty_returns_none() {
    let network = bind();
    assert!(network.accept_pending().unwrap().is_none());
}

#[test]
fn test_accept_pending_returns_loopback_session() {
    let network = bind();
    let (_client, _) = connect(&network);
    let session = accept(&network);

    assert!(session.remote_addr().ip().is_loopback());
    assert!(session.is_online());
    assert_eq!(network.live_connections(), 1);
}

#[test]
fn test_stop_accepting_hides_new_connections() {
    let network = bind();
    network.stop_accepting();
    network.stop_accepting();

    let _ = TcpStream::connect(network.local_addr());
    thread::sleep(Duration::from_millis(50));
    assert!(network.accept_pending().unwrap().is_none());
}

#[test]
fn test_bind_in_use_address_returns_bind_error() {
    let network = bind();
    let err = TcpNetwork::bind(&network.local_addr().to_string()).unwrap_err();
    assert!(matches!(err, NetError::Bind { .. }));
}

// =========================================================================
// TcpSession
// =========================================================================

#[test]
fn test_kick_delivers_reason_then_closes() {
    let network = bind();
    let (_client, mut reader) = connect(&network);
    let session = accept(&network);

    session.kick("Server is shutting down.");
    assert_eq!(read_line(&mut reader), "KICK Server is shutting down.");

    let mut rest = String::new();
    assert_eq!(reader.read_line(&mut rest).unwrap(), 0, "expected EOF after kick");
    assert!(session.wait_for_disconnect(Duration::from_secs(2)));
    assert!(!session.is_online());
}

#[test]
fn test_client_hangup_marks_session_offline() {
    let network = bind();
    let (client, reader) = connect(&network);
    let session = accept(&network);

    drop(reader);
    drop(client);
    assert!(session.wait_for_disconnect(Duration::from_secs(2)));
    assert!(wait_until(Duration::from_secs(1), || network.live_connections() == 0));
}

#[test]
fn test_wait_for_disconnect_unbounded_timeout_returns_on_hangup() {
    let network = bind();
    let (client, reader) = connect(&network);
    let session = accept(&network);

    drop(reader);
    drop(client);
    assert!(session.wait_for_disconnect(Duration::MAX));
}

#[test]
fn test_wait_for_disconnect_times_out_while_connected() {
    let network = bind();
    let (_client, _) = connect(&network);
    let session = accept(&network);

    let started = Instant::now();
    assert!(!session.wait_for_disconnect(Duration::from_millis(100)));
    assert!(started.elapsed() >= Duration::from_millis(100));
}

#[test]
fn test_close_drops_connection_without_farewell() {
    let network = bind();
    let (_client, mut reader) = connect(&network);
    let session = accept(&network);

    session.close();
    let mut line = String::new();
    assert_eq!(reader.read_line(&mut line).unwrap(), 0);
    assert!(session.wait_for_disconnect(Duration::from_secs(2)));
}

#[test]
fn test_last_active_advances_on_input() {
    let network = bind();
    let (mut client, _) = connect(&network);
    let session = accept(&network);
    let before = session.last_active();

    thread::sleep(Duration::from_millis(20));
    client.write_all(b"hello\n").unwrap();
    assert!(wait_until(Duration::from_secs(2), || session.last_active() > before));
}

// =========================================================================
// LineHandshake through the registry
// =========================================================================

fn registry(network: &Arc<TcpNetwork>, handshake: LineHandshake, config: SessionConfig) -> Arc<SessionRegistry> {
    SessionRegistry::new(config, network.clone(), Arc::new(handshake))
}

fn accept_into(registry: &Arc<SessionRegistry>) {
    assert!(wait_until(Duration::from_secs(2), || registry.accept_pending()));
}

#[test]
fn test_handshake_valid_name_is_welcomed() {
    let network = bind();
    let registry = registry(&network, LineHandshake::new(&network), SessionConfig::default());

    let (mut client, mut reader) = connect(&network);
    client.write_all(b"Bob\n").unwrap();
    accept_into(&registry);

    assert_eq!(read_line(&mut reader), "WELCOME Bob");
    assert!(registry.find_player("bob").is_some());
}

#[test]
fn test_handshake_invalid_name_is_kicked() {
    let network = bind();
    let registry = registry(&network, LineHandshake::new(&network), SessionConfig::default());

    let (mut client, mut reader) = connect(&network);
    client.write_all(b"not a name!\n").unwrap();
    accept_into(&registry);

    let line = read_line(&mut reader);
    assert!(line.starts_with("KICK Login failed: invalid name"), "got {line:?}");
    assert!(wait_until(Duration::from_secs(2), || registry.session_count() == 0));
}

#[test]
fn test_handshake_silent_client_times_out() {
    let network = bind();
    let handshake = LineHandshake::new(&network).with_timeout(Duration::from_millis(100));
    let registry = registry(&network, handshake, SessionConfig::default());

    let (_client, mut reader) = connect(&network);
    accept_into(&registry);

    assert_eq!(read_line(&mut reader), "KICK Login failed: timed out");
}

#[test]
fn test_handshake_duplicate_name_kicks_older_connection() {
    let network = bind();
    let registry = registry(&network, LineHandshake::new(&network), SessionConfig::default());

    let (mut first, mut first_reader) = connect(&network);
    first.write_all(b"Bob\n").unwrap();
    accept_into(&registry);
    assert_eq!(read_line(&mut first_reader), "WELCOME Bob");

    let (mut second, mut second_reader) = connect(&network);
    second.write_all(b"BOB\n").unwrap();
    accept_into(&registry);

    assert_eq!(read_line(&mut first_reader), "KICK Connected from elsewhere!");
    assert_eq!(read_line(&mut second_reader), "WELCOME BOB");
    assert_eq!(registry.player_count(), 1);
}

#[test]
fn test_handshake_reserved_name_joins_full_server() {
    let network = bind();
    let handshake = LineHandshake::new(&network);
    handshake.reserve("Admin");
    let registry = registry(
        &network,
        handshake,
        SessionConfig {
            max_players: 1,
            ..SessionConfig::default()
        },
    );

    let (mut a, mut a_reader) = connect(&network);
    a.write_all(b"alice\n").unwrap();
    accept_into(&registry);
    assert_eq!(read_line(&mut a_reader), "WELCOME alice");

    let (mut b, mut b_reader) = connect(&network);
    b.write_all(b"bob\n").unwrap();
    accept_into(&registry);
    assert_eq!(read_line(&mut b_reader), "KICK Server is full!");

    let (mut c, mut c_reader) = connect(&network);
    c.write_all(b"admin\n").unwrap();
    accept_into(&registry);
    assert_eq!(read_line(&mut c_reader), "WELCOME admin");
    assert_eq!(registry.player_count(), 2);
}

#[test]
fn test_recv_line_returns_client_lines_in_order() {
    let network = bind();
    let (mut client, _) = connect(&network);
    let id = accept(&network).id();
    let session = network.session(id).unwrap();

    client.write_all(b"one\ntwo\n").unwrap();
    let timeout = Duration::from_secs(2);
    assert_eq!(session.recv_line(timeout).unwrap().as_deref(), Some("one"));
    assert_eq!(session.recv_line(timeout).unwrap().as_deref(), Some("two"));
    assert!(matches!(
        session.recv_line(Duration::from_millis(50)),
        Err(NetError::Timeout)
    ));
}

#[test]
fn test_recv_line_after_hangup_returns_none() {
    let network = bind();
    let (mut client, reader) = connect(&network);
    let id = accept(&network).id();
    let session = network.session(id).unwrap();

    client.write_all(b"last\n").unwrap();
    drop(reader);
    drop(client);
    let timeout = Duration::from_secs(2);
    assert_eq!(session.recv_line(timeout).unwrap().as_deref(), Some("last"));
    assert_eq!(session.recv_line(timeout).unwrap(), None);
}

#[test]
fn test_send_line_reaches_client() {
    let network = bind();
    let (_client, mut reader) = connect(&network);
    let id = accept(&network).id();
    let session: Arc<TcpSession> = network.session(id).unwrap();

    session.send_line("hello there").unwrap();
    assert_eq!(read_line(&mut reader), "hello there");
}

#[test]
fn test_send_line_after_close_returns_connection_closed() {
    let network = bind();
    let (_client, _) = connect(&network);
    let id = accept(&network).id();
    let session = network.session(id).unwrap();

    session.close();
    assert!(session.wait_for_disconnect(Duration::from_secs(2)));
    assert!(matches!(
        session.send_line("too late"),
        Err(NetError::ConnectionClosed(_))
    ));
}

// =========================================================================
// Line limits
// =========================================================================

#[test]
fn test_unterminated_login_line_drops_connection() {
    let network = bind();
    let (mut client, _) = connect(&network);
    let id = accept(&network).id();
    let session = network.session(id).unwrap();

    // Far past any valid name, and never a newline.
    let _ = client.write_all(&vec![b'a'; MAX_NAME_LEN * 256]);

    assert!(session.wait_for_disconnect(Duration::from_secs(2)));
    assert_eq!(session.recv_line(Duration::from_secs(1)).unwrap(), None);
}

#[test]
fn test_long_line_after_login_is_delivered() {
    let network = bind();
    let (mut client, _) = connect(&network);
    let id = accept(&network).id();
    let session = network.session(id).unwrap();

    let chat = "x".repeat(MAX_LINE_LEN);
    client.write_all(format!("Bob\n{chat}\n").as_bytes()).unwrap();

    let timeout = Duration::from_secs(2);
    assert_eq!(session.recv_line(timeout).unwrap().as_deref(), Some("Bob"));
    assert_eq!(session.recv_line(timeout).unwrap(), Some(chat));
    assert!(session.is_online());
}

#[test]
fn test_line_over_limit_after_login_drops_connection() {
    let network = bind();
    let (mut client, _) = connect(&network);
    let id = accept(&network).id();
    let session = network.session(id).unwrap();

    client.write_all(b"Bob\n").unwrap();
    let _ = client.write_all(&vec![b'x'; MAX_LINE_LEN * 4]);

    let timeout = Duration::from_secs(2);
    assert_eq!(session.recv_line(timeout).unwrap().as_deref(), Some("Bob"));
    assert!(session.wait_for_disconnect(timeout));
    assert_eq!(session.recv_line(timeout).unwrap(), None);
}
