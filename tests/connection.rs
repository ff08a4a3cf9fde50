//! End-to-end connection runtime tests against in-process scripted servers.
//!
//! Each test spins up a TcpListener whose handler decodes real LDAP frames
//! with the crate's own codec and answers with canned responses.

use ldap_client::connection::{ConnectionState, LdapConnection};
use ldap_client::error::{DisconnectReason, Error};
use ldap_client::filter::{Filter, PartialAttribute};
use ldap_client::filter_string::parse_filter;
use ldap_client::ldap::{
    ExtendedResponse, LdapDN, LdapMessage, LdapOID, LdapResult, LdapString, MessageID, ProtocolOp,
    ResultCode, SearchRequest, SearchResultEntry, SearchScope, NOTICE_OF_DISCONNECTION_OID,
};
use ldap_client::options::ConnectionOptions;
use ldap_client::FromBer;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

// ----------------------- scripted-server plumbing -----------------------

fn read_message(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Option<LdapMessage> {
    let mut chunk = [0u8; 4096];
    loop {
        if !buf.is_empty() {
            let parsed = match LdapMessage::from_ber(buf) {
                Ok((rem, msg)) => Some((buf.len() - rem.len(), msg)),
                Err(ldap_client::Err::Incomplete(_)) => None,
                Err(_) => return None,
            };
            if let Some((consumed, msg)) = parsed {
                buf.drain(..consumed);
                return Some(msg);
            }
        }
        match stream.read(&mut chunk) {
            Ok(0) | Err(_) => return None,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
}

fn send(stream: &mut TcpStream, msg: &LdapMessage) {
    stream.write_all(&msg.to_bytes()).unwrap();
}

fn done(id: MessageID, code: ResultCode) -> LdapMessage {
    LdapMessage::new(
        id,
        ProtocolOp::SearchResultDone(LdapResult {
            result_code: code,
            matched_dn: LdapDN::default(),
            diagnostic_message: LdapString::default(),
            referral: None,
        }),
    )
}

fn entry(id: MessageID, dn: &str, attrs: &[(&str, &[&[u8]])]) -> LdapMessage {
    LdapMessage::new(
        id,
        ProtocolOp::SearchResultEntry(SearchResultEntry {
            object_name: LdapDN(dn.to_string()),
            attributes: attrs
                .iter()
                .map(|(name, values)| PartialAttribute::new(name, values))
                .collect(),
        }),
    )
}

/// Serve a single connection with `handler`, holding the socket open until
/// the handler returns
fn serve_once<F>(handler: F) -> u16
where
    F: FnOnce(TcpStream) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        if let Ok((stream, _)) = listener.accept() {
            handler(stream);
        }
    });
    port
}

/// Serve every connection with its own handler thread; referral chains open
/// several connections that must be live at once
fn serve_loop<F>(handler: F) -> u16
where
    F: Fn(TcpStream) + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handler = Arc::new(handler);
    thread::spawn(move || {
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let handler = Arc::clone(&handler);
                    thread::spawn(move || handler(stream));
                }
                Err(_) => break,
            }
        }
    });
    port
}

fn fast_options() -> ConnectionOptions {
    ConnectionOptions {
        connect_timeout: Duration::from_millis(2000),
        response_timeout: Duration::from_millis(5000),
        ..ConnectionOptions::default()
    }
}

fn connect(port: u16) -> LdapConnection {
    LdapConnection::connect_with_options("127.0.0.1", port, fast_options()).unwrap()
}

/// Answer every request with a success result of the right response type;
/// exit on unbind or EOF
fn answer_all(mut stream: TcpStream) {
    let mut buf = Vec::new();
    while let Some(msg) = read_message(&mut stream, &mut buf) {
        let id = msg.message_id;
        let response = match msg.protocol_op {
            ProtocolOp::UnbindRequest => return,
            ProtocolOp::BindRequest(_) => LdapMessage::new(
                id,
                ProtocolOp::BindResponse(ldap_client::ldap::BindResponse {
                    result: LdapResult::success(),
                    server_sasl_creds: None,
                }),
            ),
            ProtocolOp::SearchRequest(_) => {
                send(&mut stream, &done(id, ResultCode::Success));
                continue;
            }
            ProtocolOp::DelRequest(_) => {
                LdapMessage::new(id, ProtocolOp::DelResponse(LdapResult::success()))
            }
            ProtocolOp::AbandonRequest(_) => continue,
            _ => LdapMessage::new(id, ProtocolOp::DelResponse(LdapResult::success())),
        };
        send(&mut stream, &response);
    }
}

// ----------------------- scenarios -----------------------

#[test]
fn test_simple_search_end_to_end() {
    let port = serve_once(|mut stream| {
        let mut buf = Vec::new();
        while let Some(msg) = read_message(&mut stream, &mut buf) {
            match msg.protocol_op {
                ProtocolOp::SearchRequest(req) => {
                    assert_eq!(&req.base_object.0, "dc=example,dc=com");
                    assert_eq!(req.scope, SearchScope::BaseObject);
                    assert_eq!(req.filter, Filter::present("objectClass"));
                    send(
                        &mut stream,
                        &entry(
                            msg.message_id,
                            "dc=example,dc=com",
                            &[
                                ("objectClass", &[b"top", b"domain"]),
                                ("dc", &[b"example"]),
                            ],
                        ),
                    );
                    send(&mut stream, &done(msg.message_id, ResultCode::Success));
                }
                ProtocolOp::UnbindRequest => return,
                other => panic!("unexpected request {:?}", other.tag()),
            }
        }
    });

    let conn = connect(port);
    let request = SearchRequest {
        base_object: LdapDN("dc=example,dc=com".to_string()),
        scope: SearchScope::BaseObject,
        deref_aliases: ldap_client::ldap::DerefAliases::NeverDerefAliases,
        size_limit: 0,
        time_limit: 0,
        types_only: false,
        filter: parse_filter("(objectClass=*)").unwrap(),
        attributes: vec![LdapString("*".to_string())],
    };
    let result = conn.search(&request).unwrap();
    assert_eq!(result.result.result_code, ResultCode::Success);
    assert_eq!(result.entries.len(), 1);
    assert_eq!(&result.entries[0].object_name.0, "dc=example,dc=com");
    let entry: ldap_client::entry::Entry = result.entries[0].clone().into();
    assert_eq!(
        entry.get("objectClass").unwrap().string_values(),
        vec!["top", "domain"]
    );
    assert_eq!(entry.get_value("dc").unwrap(), "example");
    conn.unbind();
}

#[test]
fn test_compare_true() {
    let port = serve_once(|mut stream| {
        let mut buf = Vec::new();
        while let Some(msg) = read_message(&mut stream, &mut buf) {
            match msg.protocol_op {
                ProtocolOp::CompareRequest(req) => {
                    assert_eq!(&req.entry.0, "dc=example,dc=com");
                    assert_eq!(&req.ava.attribute_desc.0, "dc");
                    assert_eq!(req.ava.assertion_value, b"example");
                    let code = ResultCode::CompareTrue;
                    send(
                        &mut stream,
                        &LdapMessage::new(
                            msg.message_id,
                            ProtocolOp::CompareResponse(LdapResult {
                                result_code: code,
                                matched_dn: LdapDN::default(),
                                diagnostic_message: LdapString::default(),
                                referral: None,
                            }),
                        ),
                    );
                }
                ProtocolOp::UnbindRequest => return,
                other => panic!("unexpected request {:?}", other.tag()),
            }
        }
    });

    let conn = connect(port);
    let result = conn.compare("dc=example,dc=com", "dc", b"example").unwrap();
    assert_eq!(result.result.result_code, ResultCode::CompareTrue);
    assert_eq!(result.value(), Some(true));
    conn.unbind();
}

#[test]
fn test_bind_failure_is_structural() {
    let port = serve_once(|mut stream| {
        let mut buf = Vec::new();
        while let Some(msg) = read_message(&mut stream, &mut buf) {
            match msg.protocol_op {
                ProtocolOp::BindRequest(_) => send(
                    &mut stream,
                    &LdapMessage::new(
                        msg.message_id,
                        ProtocolOp::BindResponse(ldap_client::ldap::BindResponse {
                            result: LdapResult {
                                result_code: ResultCode::InvalidCredentials,
                                matched_dn: LdapDN::default(),
                                diagnostic_message: LdapString("bad password".to_string()),
                                referral: None,
                            },
                            server_sasl_creds: None,
                        }),
                    ),
                ),
                ProtocolOp::UnbindRequest => return,
                other => panic!("unexpected request {:?}", other.tag()),
            }
        }
    });

    let conn = connect(port);
    let bind = conn.simple_bind("cn=admin,dc=example,dc=com", "wrong").unwrap();
    assert_eq!(bind.result.result_code, ResultCode::InvalidCredentials);
    assert_eq!(&bind.result.diagnostic_message.0, "bad password");
    assert!(conn.is_open());
    conn.unbind();
}

#[test]
fn test_simple_bind_requires_password_for_dn() {
    let port = serve_once(answer_all);
    let conn = connect(port);
    match conn.simple_bind("cn=admin,dc=example,dc=com", "") {
        Err(Error::Local(_)) => {}
        other => panic!("unexpected outcome {:?}", other),
    }
    // anonymous bind (empty DN, empty password) is still allowed
    let bind = conn.simple_bind("", "").unwrap();
    assert_eq!(bind.result.result_code, ResultCode::Success);
    conn.unbind();
}

#[test]
fn test_message_ids_strictly_increase() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_server = Arc::clone(&seen);
    let port = serve_once(move |mut stream| {
        let mut buf = Vec::new();
        while let Some(msg) = read_message(&mut stream, &mut buf) {
            match msg.protocol_op {
                ProtocolOp::DelRequest(_) => {
                    seen_server.lock().unwrap().push(msg.message_id.0);
                    send(
                        &mut stream,
                        &LdapMessage::new(
                            msg.message_id,
                            ProtocolOp::DelResponse(LdapResult::success()),
                        ),
                    );
                }
                ProtocolOp::UnbindRequest => return,
                other => panic!("unexpected request {:?}", other.tag()),
            }
        }
    });

    let conn = connect(port);
    for _ in 0..4 {
        conn.delete("cn=x,dc=example,dc=com").unwrap();
    }
    conn.unbind();

    let ids = seen.lock().unwrap().clone();
    assert_eq!(ids.len(), 4);
    assert_eq!(ids[0], 1);
    for window in ids.windows(2) {
        assert!(window[0] < window[1], "ids not increasing: {:?}", ids);
    }
}

#[test]
fn test_interleaved_concurrent_searches() {
    // three searches multiplexed on one connection; the server interleaves
    // entries across message ids before finishing each stream
    let port = serve_once(|mut stream| {
        let mut buf = Vec::new();
        let mut requests = Vec::new();
        while requests.len() < 3 {
            match read_message(&mut stream, &mut buf) {
                Some(msg) => {
                    if let ProtocolOp::SearchRequest(req) = &msg.protocol_op {
                        requests.push((msg.message_id, req.base_object.0.clone()));
                    }
                }
                None => panic!("client closed early"),
            }
        }
        // map each request to its base's marker (a, b, c)
        let id_for = |marker: &str| {
            requests
                .iter()
                .find(|(_, base)| base.starts_with(marker))
                .map(|(id, _)| *id)
                .unwrap()
        };
        let (a, b, c) = (id_for("ou=a"), id_for("ou=b"), id_for("ou=c"));
        send(&mut stream, &entry(a, "cn=1,ou=a", &[]));
        send(&mut stream, &entry(b, "cn=1,ou=b", &[]));
        send(&mut stream, &entry(c, "cn=1,ou=c", &[]));
        send(&mut stream, &entry(a, "cn=2,ou=a", &[]));
        send(&mut stream, &done(b, ResultCode::Success));
        send(&mut stream, &entry(c, "cn=2,ou=c", &[]));
        send(&mut stream, &done(a, ResultCode::Success));
        send(&mut stream, &entry(c, "cn=3,ou=c", &[]));
        send(&mut stream, &done(c, ResultCode::Success));
        // hold the socket open until the client unbinds
        while let Some(msg) = read_message(&mut stream, &mut buf) {
            if msg.protocol_op == ProtocolOp::UnbindRequest {
                return;
            }
        }
    });

    let conn = Arc::new(connect(port));
    let mut workers = Vec::new();
    for (marker, expected) in [("ou=a", 2usize), ("ou=b", 1), ("ou=c", 3)] {
        let conn = Arc::clone(&conn);
        workers.push(thread::spawn(move || {
            let request = SearchRequest::new(
                marker,
                SearchScope::WholeSubtree,
                Filter::present("objectClass"),
            );
            let result = conn.search(&request).unwrap();
            assert_eq!(result.result.result_code, ResultCode::Success);
            assert_eq!(result.entries.len(), expected, "base {}", marker);
            for e in &result.entries {
                assert!(e.object_name.0.ends_with(marker), "{}", e.object_name.0);
            }
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }
    conn.unbind();
}

#[test]
fn test_timeout_leaves_connection_usable() {
    let port = serve_once(|mut stream| {
        let mut buf = Vec::new();
        // first request is swallowed; everything after gets an answer
        let first = read_message(&mut stream, &mut buf).unwrap();
        assert!(matches!(first.protocol_op, ProtocolOp::DelRequest(_)));
        while let Some(msg) = read_message(&mut stream, &mut buf) {
            match msg.protocol_op {
                ProtocolOp::DelRequest(_) => send(
                    &mut stream,
                    &LdapMessage::new(
                        msg.message_id,
                        ProtocolOp::DelResponse(LdapResult::success()),
                    ),
                ),
                ProtocolOp::AbandonRequest(_) => continue,
                ProtocolOp::UnbindRequest => return,
                other => panic!("unexpected request {:?}", other.tag()),
            }
        }
    });

    let conn = connect(port);
    let started = Instant::now();
    let outcome = conn.request(
        ProtocolOp::DelRequest(LdapDN("cn=slow".to_string())),
        None,
        Some(Duration::from_millis(150)),
    );
    match outcome {
        Err(Error::Timeout(_)) => {}
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(started.elapsed() >= Duration::from_millis(150));
    // the timeout is not fatal
    assert!(conn.is_open());
    let result = conn.delete("cn=fast").unwrap();
    assert_eq!(result.result.result_code, ResultCode::Success);
    conn.unbind();
}

#[test]
fn test_abandon_on_timeout_helper() {
    let abandoned = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&abandoned);
    let port = serve_once(move |mut stream| {
        let mut buf = Vec::new();
        // the first delete is swallowed; the client should abandon it
        let first = read_message(&mut stream, &mut buf).unwrap();
        assert!(matches!(first.protocol_op, ProtocolOp::DelRequest(_)));
        while let Some(msg) = read_message(&mut stream, &mut buf) {
            match msg.protocol_op {
                ProtocolOp::AbandonRequest(target) => sink.lock().unwrap().push(target),
                ProtocolOp::DelRequest(_) => send(
                    &mut stream,
                    &LdapMessage::new(
                        msg.message_id,
                        ProtocolOp::DelResponse(LdapResult::success()),
                    ),
                ),
                ProtocolOp::UnbindRequest => return,
                other => panic!("unexpected request {:?}", other.tag()),
            }
        }
    });

    let conn = connect(port);
    let outcome = conn.request_abandon_on_timeout(
        ProtocolOp::DelRequest(LdapDN("cn=slow".to_string())),
        None,
        Some(Duration::from_millis(150)),
    );
    match outcome {
        Err(Error::Timeout(_)) => {}
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(conn.is_open());
    // the follow-up delete proves the abandon reached the server first:
    // both travel the same ordered stream
    conn.delete("cn=fast").unwrap();
    assert_eq!(abandoned.lock().unwrap().clone(), vec![MessageID(1)]);
    conn.unbind();
}

#[test]
fn test_unsolicited_notification_dispatch() {
    let port = serve_once(|mut stream| {
        let mut buf = Vec::new();
        while let Some(msg) = read_message(&mut stream, &mut buf) {
            match msg.protocol_op {
                ProtocolOp::DelRequest(_) => {
                    // unsolicited notification ahead of the response
                    send(
                        &mut stream,
                        &LdapMessage::new(
                            MessageID(0),
                            ProtocolOp::ExtendedResponse(ExtendedResponse {
                                result: LdapResult::success(),
                                response_name: Some(LdapOID("1.2.3.4.5".to_string())),
                                response_value: None,
                            }),
                        ),
                    );
                    send(
                        &mut stream,
                        &LdapMessage::new(
                            msg.message_id,
                            ProtocolOp::DelResponse(LdapResult::success()),
                        ),
                    );
                }
                ProtocolOp::UnbindRequest => return,
                other => panic!("unexpected request {:?}", other.tag()),
            }
        }
    });

    let conn = connect(port);
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    conn.set_unsolicited_notification_handler(Arc::new(move |resp| {
        sink.lock()
            .unwrap()
            .push(resp.response_name.clone().map(|oid| oid.0));
    }));

    conn.delete("cn=x").unwrap();
    assert_eq!(
        received.lock().unwrap().clone(),
        vec![Some("1.2.3.4.5".to_string())]
    );
    assert!(conn.is_open());
    conn.unbind();
}

#[test]
fn test_notice_of_disconnection_closes_connection() {
    let port = serve_once(|mut stream| {
        let mut buf = Vec::new();
        let msg = read_message(&mut stream, &mut buf).unwrap();
        send(
            &mut stream,
            &LdapMessage::new(
                MessageID(0),
                ProtocolOp::ExtendedResponse(ExtendedResponse {
                    result: LdapResult {
                        result_code: ResultCode::Unavailable,
                        matched_dn: LdapDN::default(),
                        diagnostic_message: LdapString("shutting down".to_string()),
                        referral: None,
                    },
                    response_name: Some(LdapOID(NOTICE_OF_DISCONNECTION_OID.to_string())),
                    response_value: None,
                }),
            ),
        );
        let _ = msg;
        // leave the socket to the client; it should treat the notice as a close
        thread::sleep(Duration::from_millis(500));
    });

    let conn = connect(port);
    let disconnects = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&disconnects);
    conn.set_disconnect_handler(Arc::new(move |reason| {
        sink.lock().unwrap().push(reason.clone());
    }));

    match conn.delete("cn=x") {
        Err(Error::ServerDown(DisconnectReason::ServerClosedConnection)) => {}
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(
        conn.state(),
        ConnectionState::Closed(DisconnectReason::ServerClosedConnection)
    );
    assert_eq!(
        disconnects.lock().unwrap().clone(),
        vec![DisconnectReason::ServerClosedConnection]
    );
}

#[test]
fn test_server_close_fails_pending_operation() {
    let port = serve_once(|mut stream| {
        let mut buf = Vec::new();
        let _ = read_message(&mut stream, &mut buf);
        // drop the socket without answering
    });

    let conn = connect(port);
    match conn.delete("cn=x") {
        Err(Error::ServerDown(_)) => {}
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(!conn.is_open());
    // a further request fails immediately
    match conn.delete("cn=y") {
        Err(Error::ServerDown(_)) => {}
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[test]
fn test_auto_reconnect_reopens_transport() {
    let port = serve_loop(|mut stream| {
        let mut buf = Vec::new();
        // answer exactly one request per connection, then close it
        if let Some(msg) = read_message(&mut stream, &mut buf) {
            if let ProtocolOp::DelRequest(_) = msg.protocol_op {
                send(
                    &mut stream,
                    &LdapMessage::new(
                        msg.message_id,
                        ProtocolOp::DelResponse(LdapResult::success()),
                    ),
                );
            }
        }
    });

    let options = ConnectionOptions {
        auto_reconnect: true,
        ..fast_options()
    };
    let conn = LdapConnection::connect_with_options("127.0.0.1", port, options).unwrap();
    conn.delete("cn=first").unwrap();

    // wait for the client to notice the server-side close
    let deadline = Instant::now() + Duration::from_secs(2);
    while conn.is_open() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(!conn.is_open());

    // the next request transparently reopens the transport
    let result = conn.delete("cn=second").unwrap();
    assert_eq!(result.result.result_code, ResultCode::Success);
    conn.unbind();
}

#[test]
fn test_referral_followed_to_target() {
    let target_port = serve_loop(|mut stream| {
        let mut buf = Vec::new();
        while let Some(msg) = read_message(&mut stream, &mut buf) {
            match msg.protocol_op {
                ProtocolOp::DelRequest(dn) => {
                    assert_eq!(&dn.0, "cn=moved,dc=other,dc=com");
                    send(
                        &mut stream,
                        &LdapMessage::new(
                            msg.message_id,
                            ProtocolOp::DelResponse(LdapResult::success()),
                        ),
                    );
                }
                ProtocolOp::UnbindRequest => return,
                other => panic!("unexpected request {:?}", other.tag()),
            }
        }
    });

    let referring_port = serve_once(move |mut stream| {
        let mut buf = Vec::new();
        while let Some(msg) = read_message(&mut stream, &mut buf) {
            match msg.protocol_op {
                ProtocolOp::DelRequest(_) => send(
                    &mut stream,
                    &LdapMessage::new(
                        msg.message_id,
                        ProtocolOp::DelResponse(LdapResult {
                            result_code: ResultCode::Referral,
                            matched_dn: LdapDN::default(),
                            diagnostic_message: LdapString::default(),
                            referral: Some(vec![LdapString(format!(
                                "ldap://127.0.0.1:{}/cn=moved,dc=other,dc=com",
                                target_port
                            ))]),
                        }),
                    ),
                ),
                ProtocolOp::UnbindRequest => return,
                other => panic!("unexpected request {:?}", other.tag()),
            }
        }
    });

    let options = ConnectionOptions {
        follow_referrals: true,
        ..fast_options()
    };
    let conn =
        LdapConnection::connect_with_options("127.0.0.1", referring_port, options).unwrap();
    let result = conn.delete("cn=moved,dc=example,dc=com").unwrap();
    assert_eq!(result.result.result_code, ResultCode::Success);
    conn.unbind();
}

#[test]
fn test_referral_hop_limit_exceeded() {
    // a server that refers every delete to itself: an endless chain
    let port_holder = Arc::new(Mutex::new(0u16));
    let port_for_handler = Arc::clone(&port_holder);
    let port = serve_loop(move |mut stream| {
        let myself = *port_for_handler.lock().unwrap();
        let mut buf = Vec::new();
        while let Some(msg) = read_message(&mut stream, &mut buf) {
            match msg.protocol_op {
                ProtocolOp::DelRequest(_) => send(
                    &mut stream,
                    &LdapMessage::new(
                        msg.message_id,
                        ProtocolOp::DelResponse(LdapResult {
                            result_code: ResultCode::Referral,
                            matched_dn: LdapDN::default(),
                            diagnostic_message: LdapString::default(),
                            referral: Some(vec![LdapString(format!(
                                "ldap://127.0.0.1:{}/cn=loop,dc=example,dc=com",
                                myself
                            ))]),
                        }),
                    ),
                ),
                ProtocolOp::UnbindRequest => return,
                other => panic!("unexpected request {:?}", other.tag()),
            }
        }
    });
    *port_holder.lock().unwrap() = port;

    let options = ConnectionOptions {
        follow_referrals: true,
        referral_hop_limit: 3,
        ..fast_options()
    };
    let conn = LdapConnection::connect_with_options("127.0.0.1", port, options).unwrap();
    let result = conn.delete("cn=loop,dc=example,dc=com").unwrap();
    assert_eq!(result.result.result_code, ResultCode::ReferralLimitExceeded);
    conn.unbind();
}

#[test]
fn test_synchronous_mode_operations() {
    let port = serve_once(answer_all);
    let options = ConnectionOptions {
        use_synchronous_mode: true,
        ..fast_options()
    };
    let conn = LdapConnection::connect_with_options("127.0.0.1", port, options).unwrap();
    let bind = conn.simple_bind("", "").unwrap();
    assert_eq!(bind.result.result_code, ResultCode::Success);
    let result = conn
        .search(&SearchRequest::new(
            "dc=example,dc=com",
            SearchScope::BaseObject,
            Filter::present("objectClass"),
        ))
        .unwrap();
    assert_eq!(result.result.result_code, ResultCode::Success);
    conn.unbind();
}

#[test]
fn test_search_with_listener_streams_entries() {
    let port = serve_once(|mut stream| {
        let mut buf = Vec::new();
        while let Some(msg) = read_message(&mut stream, &mut buf) {
            match msg.protocol_op {
                ProtocolOp::SearchRequest(_) => {
                    send(&mut stream, &entry(msg.message_id, "cn=1,ou=x", &[]));
                    send(&mut stream, &entry(msg.message_id, "cn=2,ou=x", &[]));
                    send(
                        &mut stream,
                        &LdapMessage::new(
                            msg.message_id,
                            ProtocolOp::SearchResultReference(vec![LdapString(
                                "ldap://other/dc=x".to_string(),
                            )]),
                        ),
                    );
                    send(&mut stream, &done(msg.message_id, ResultCode::Success));
                }
                ProtocolOp::UnbindRequest => return,
                other => panic!("unexpected request {:?}", other.tag()),
            }
        }
    });

    struct Collector {
        entries: Mutex<Vec<String>>,
        references: Mutex<usize>,
    }
    impl ldap_client::connection::SearchResultListener for Collector {
        fn entry_received(&self, entry: SearchResultEntry) {
            self.entries.lock().unwrap().push(entry.object_name.0);
        }
        fn reference_received(&self, _reference: Vec<LdapString>) {
            *self.references.lock().unwrap() += 1;
        }
    }

    let conn = connect(port);
    let collector = Arc::new(Collector {
        entries: Mutex::new(Vec::new()),
        references: Mutex::new(0),
    });
    let result = conn
        .search_with_listener(
            &SearchRequest::new("ou=x", SearchScope::WholeSubtree, Filter::present("cn")),
            Arc::clone(&collector) as Arc<dyn ldap_client::connection::SearchResultListener>,
        )
        .unwrap();
    assert_eq!(result.result.result_code, ResultCode::Success);
    assert!(result.entries.is_empty());
    assert_eq!(
        collector.entries.lock().unwrap().clone(),
        vec!["cn=1,ou=x".to_string(), "cn=2,ou=x".to_string()]
    );
    assert_eq!(*collector.references.lock().unwrap(), 1);
    conn.unbind();
}
