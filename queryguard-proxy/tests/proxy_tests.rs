//! End-to-end scenarios over loopback TCP: a real accept loop, a scripted
//! upstream, and a stub control channel.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bson::{doc, Bson};
use tokio::net::{TcpListener, TcpStream};

use queryguard_domain::IndexSpec;
use queryguard_proxy::killop::{NO_INDEX_CODE, TIME_LIMIT_CODE};
use queryguard_proxy::listener;
use queryguard_proxy::pump::Pump;
use queryguard_proxy::testing::{
    // ---
    query_message,
    read_full_message,
    read_query_message,
    reply_message,
    send,
    split_reply,
    StaticControl,
};
use queryguard_wire::{MessageHeader, OpCode, HEADER_LEN};

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// Boot a proxy in front of `upstream`, return its client-facing address.
async fn start_proxy(
    control: Arc<StaticControl>,
    upstream: SocketAddr,
    message_timeout: Duration,
) -> SocketAddr {
    // ---
    let pump = Arc::new(Pump::new(
        control,
        vec![upstream.to_string()],
        message_timeout,
        Duration::from_secs(30),
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(listener::run(listener, pump));
    addr
}

// ---

async fn upstream_listener() -> (TcpListener, SocketAddr) {
    // ---
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

// ---

fn indexed_users_control() -> Arc<StaticControl> {
    // ---
    Arc::new(StaticControl::new().with_count("app.users", 25).with_indexes(
        "app.users",
        vec![IndexSpec {
            name: "email_1".into(),
            keys: vec!["email".into()],
        }],
    ))
}

// ---------------------------------------------------------------------------
// S1 — admit on indexed field
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s1_admitted_query_arrives_wrapped_capped_and_tagged() {
    // ---
    let (upstream, upstream_addr) = upstream_listener().await;
    let proxy = start_proxy(indexed_users_control(), upstream_addr, Duration::from_secs(5)).await;

    let server_task = tokio::spawn(async move {
        let (mut sock, _) = upstream.accept().await.unwrap();
        let parsed = read_query_message(&mut sock).await;
        send(&mut sock, &reply_message(1, &[doc! { "email": "a@b", "ok": 1.0 }])).await;
        parsed
    });

    let mut client = TcpStream::connect(proxy).await.unwrap();
    let client_addr = client.local_addr().unwrap().to_string();
    send(
        &mut client,
        &query_message(1, "app.users", &doc! { "email": "a@b" }),
    )
    .await;

    let parsed = server_task.await.unwrap();
    assert_eq!(parsed.ns, "app.users");

    // Top-level shape: wrapped predicate, capped time, guard envelope.
    let q = &parsed.query;
    assert_eq!(q.get_document("$query").unwrap(), &doc! { "email": "a@b" });
    assert!(q.get_f64("$maxTimeMS").unwrap() <= 4_000.0);
    let guard = q.get_document("$queryGuard").unwrap();
    assert_eq!(guard.get_str("remoteaddr").unwrap(), client_addr);
    assert!(guard.get_str("track").unwrap().starts_with('Q'));

    // Header length equals the recomputed size.
    let actual = HEADER_LEN + 4 + (parsed.ns.len() + 1) + 8 + parsed.query_bytes.len();
    assert_eq!(parsed.header.message_length as usize, actual);

    // The server's reply reached the client untouched.
    let (reply_header, _) = read_full_message(&mut client).await;
    assert_eq!(reply_header.response_to, 1);
}

// ---------------------------------------------------------------------------
// S2 — reject on unindexed field
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s2_rejected_query_never_reaches_the_server() {
    // ---
    let (upstream, upstream_addr) = upstream_listener().await;
    let proxy = start_proxy(indexed_users_control(), upstream_addr, Duration::from_secs(5)).await;

    // The upstream reports every byte it ever sees.
    let (seen_tx, seen_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let (mut sock, _) = upstream.accept().await.unwrap();
        let mut buf = [0u8; 1];
        let n = tokio::io::AsyncReadExt::read(&mut sock, &mut buf).await.unwrap();
        let _ = seen_tx.send(n);
    });

    let mut client = TcpStream::connect(proxy).await.unwrap();
    send(
        &mut client,
        &query_message(77, "app.users", &doc! { "name": "x" }),
    )
    .await;

    let (header, raw) = read_full_message(&mut client).await;
    let (_, prelude, body) = split_reply(&raw);
    assert_eq!(header.response_to, 77);
    assert_eq!(&prelude[16..20], &1i32.to_le_bytes());
    assert_eq!(body.get_i32("code").unwrap(), NO_INDEX_CODE);
    assert!(body
        .get_str("$err")
        .unwrap()
        .contains("db.users.getIndexes()"));

    // Closing the client tears the pump down; the upstream read then
    // resolves with zero bytes ever received.
    drop(client);
    assert_eq!(seen_rx.await.unwrap(), 0);
}

// ---------------------------------------------------------------------------
// S3 — bypass command namespaces
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s3_command_namespace_round_trips_byte_for_byte() {
    // ---
    let (upstream, upstream_addr) = upstream_listener().await;
    let proxy = start_proxy(Arc::new(StaticControl::new()), upstream_addr, Duration::from_secs(5))
        .await;

    let request = query_message(5, "admin.$cmd", &doc! { "ismaster": 1i32 });
    let response = reply_message(5, &[doc! { "ismaster": true, "ok": 1.0 }]);

    let expected_request = request.clone();
    let expected_response = response.clone();
    let server_task = tokio::spawn(async move {
        let (mut sock, _) = upstream.accept().await.unwrap();
        let (_, raw) = read_full_message(&mut sock).await;
        send(&mut sock, &response).await;
        raw
    });

    let mut client = TcpStream::connect(proxy).await.unwrap();
    send(&mut client, &request).await;

    assert_eq!(server_task.await.unwrap(), expected_request);
    let (_, relayed) = read_full_message(&mut client).await;
    assert_eq!(relayed, expected_response);
}

// ---------------------------------------------------------------------------
// S4 — empty collections admit anything
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s4_empty_collection_query_is_admitted_and_mutated() {
    // ---
    let (upstream, upstream_addr) = upstream_listener().await;
    let control = Arc::new(StaticControl::new().with_count("app.fresh", 0));
    let proxy = start_proxy(control, upstream_addr, Duration::from_secs(5)).await;

    let server_task = tokio::spawn(async move {
        let (mut sock, _) = upstream.accept().await.unwrap();
        let parsed = read_query_message(&mut sock).await;
        send(&mut sock, &reply_message(6, &[doc! { "ok": 1.0 }])).await;
        parsed
    });

    let mut client = TcpStream::connect(proxy).await.unwrap();
    send(
        &mut client,
        &query_message(6, "app.fresh", &doc! { "any_field": 1i32 }),
    )
    .await;

    let parsed = server_task.await.unwrap();
    assert_eq!(
        parsed.query.get_document("$query").unwrap(),
        &doc! { "any_field": 1i32 }
    );
    assert!(parsed.query.contains_key("$queryGuard"));

    let (reply_header, _) = read_full_message(&mut client).await;
    assert_eq!(reply_header.response_to, 6);
}

// ---------------------------------------------------------------------------
// S5 — existing maxTimeMS is clamped, spelling preserved
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s5_existing_max_time_is_clamped_to_the_cap() {
    // ---
    let (upstream, upstream_addr) = upstream_listener().await;
    let proxy = start_proxy(indexed_users_control(), upstream_addr, Duration::from_secs(5)).await;

    let server_task = tokio::spawn(async move {
        let (mut sock, _) = upstream.accept().await.unwrap();
        let parsed = read_query_message(&mut sock).await;
        send(&mut sock, &reply_message(8, &[doc! { "ok": 1.0 }])).await;
        parsed
    });

    let mut client = TcpStream::connect(proxy).await.unwrap();
    send(
        &mut client,
        &query_message(
            8,
            "app.users",
            &doc! { "$query": { "email": "x" }, "maxTimeMS": 999_999.0 },
        ),
    )
    .await;

    let parsed = server_task.await.unwrap();
    // 5s message timeout → 4000ms cap, original key spelling kept.
    assert_eq!(parsed.query.get_f64("maxTimeMS").unwrap(), 4_000.0);
    assert!(!parsed.query.contains_key("$maxTimeMS"));
    assert!(parsed.query.contains_key("$queryGuard"));

    read_full_message(&mut client).await;
}

// ---------------------------------------------------------------------------
// S6 — response timeout triggers find + kill + code 50
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s6_response_timeout_kills_the_tagged_operation() {
    // ---
    let (upstream, upstream_addr) = upstream_listener().await;
    let control = Arc::new(
        StaticControl::new()
            .with_count("app.users", 25)
            .with_indexes(
                "app.users",
                vec![IndexSpec {
                    name: "email_1".into(),
                    keys: vec!["email".into()],
                }],
            )
            .with_ops(vec![Bson::Int32(4242)]),
    );
    let proxy = start_proxy(control.clone(), upstream_addr, Duration::from_secs(2)).await;

    // The upstream swallows the query and never replies, then keeps the
    // socket open and absorbs the pump's redial attempts.
    let (track_tx, track_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let (mut sock, _) = upstream.accept().await.unwrap();
        let parsed = read_query_message(&mut sock).await;
        let track = parsed
            .query
            .get_document("$queryGuard")
            .unwrap()
            .get_str("track")
            .unwrap()
            .to_string();
        let _ = track_tx.send(track);

        let _hold = sock;
        loop {
            let _ = upstream.accept().await;
        }
    });

    let mut client = TcpStream::connect(proxy).await.unwrap();
    send(
        &mut client,
        &query_message(9, "app.users", &doc! { "email": "a@b" }),
    )
    .await;

    let track = track_rx.await.unwrap();

    // After the 2s message deadline the client gets the time-limit reply.
    let (header, raw) = read_full_message(&mut client).await;
    let (_, _, body) = split_reply(&raw);
    assert_eq!(header.response_to, 9);
    assert_eq!(body.get_i32("code").unwrap(), TIME_LIMIT_CODE);
    assert!(body.get_str("$err").unwrap().contains("time limit of 2s"));

    // The control channel saw a find pinned to the tag, then the kill.
    let filters = control.find_filters.lock().unwrap();
    assert_eq!(filters.len(), 1);
    assert_eq!(filters[0].get_str("op").unwrap(), "query");
    assert_eq!(filters[0].get_str("ns").unwrap(), "app.users");
    assert_eq!(
        filters[0].get_str("query.$queryGuard.track").unwrap(),
        track
    );
    assert_eq!(*control.killed.lock().unwrap(), vec![Bson::Int32(4242)]);
}

// ---------------------------------------------------------------------------
// Passthrough + serialization
// ---------------------------------------------------------------------------

/// A fire-and-forget opcode forwards verbatim and the connection keeps
/// serving subsequent messages in order.
#[tokio::test]
async fn insert_then_command_stay_serialized() {
    // ---
    let (upstream, upstream_addr) = upstream_listener().await;
    let proxy = start_proxy(Arc::new(StaticControl::new()), upstream_addr, Duration::from_secs(5))
        .await;

    let insert_body = {
        let mut body = queryguard_wire::encode_document(&doc! { "email": "a@b" }).unwrap();
        let mut msg = MessageHeader {
            message_length: (HEADER_LEN + body.len()) as i32,
            request_id: 14,
            response_to: 0,
            op_code: OpCode::Insert,
        }
        .to_wire()
        .to_vec();
        msg.append(&mut body);
        msg
    };
    let command = query_message(15, "admin.$cmd", &doc! { "ping": 1i32 });
    let response = reply_message(15, &[doc! { "ok": 1.0 }]);

    let expected_insert = insert_body.clone();
    let expected_command = command.clone();
    let server_task = tokio::spawn(async move {
        let (mut sock, _) = upstream.accept().await.unwrap();
        let (_, first) = read_full_message(&mut sock).await;
        let (_, second) = read_full_message(&mut sock).await;
        send(&mut sock, &response).await;
        (first, second)
    });

    let mut client = TcpStream::connect(proxy).await.unwrap();
    send(&mut client, &insert_body).await;
    send(&mut client, &command).await;

    let (first, second) = server_task.await.unwrap();
    assert_eq!(first, expected_insert);
    assert_eq!(second, expected_command);

    let (reply_header, _) = read_full_message(&mut client).await;
    assert_eq!(reply_header.response_to, 15);
}

// ---

/// An unparseable document body tears down that client without touching
/// the listener: a fresh connection still works.
#[tokio::test]
async fn framing_error_only_kills_one_connection() {
    // ---
    let (upstream, upstream_addr) = upstream_listener().await;
    let proxy = start_proxy(Arc::new(StaticControl::new()), upstream_addr, Duration::from_secs(5))
        .await;

    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = upstream.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (_, _) = read_full_message(&mut sock).await;
                send(&mut sock, &reply_message(30, &[doc! { "ok": 1.0 }])).await;
            });
        }
    });

    // A query whose document length prefix is garbage.
    let mut bad = query_message(29, "app.users", &doc! { "email": "x" });
    let doc_start = HEADER_LEN + 4 + "app.users".len() + 1 + 8;
    bad[doc_start..doc_start + 4].copy_from_slice(&(-9i32).to_le_bytes());

    let mut broken_client = TcpStream::connect(proxy).await.unwrap();
    send(&mut broken_client, &bad).await;
    let mut probe = [0u8; 1];
    let n = tokio::io::AsyncReadExt::read(&mut broken_client, &mut probe)
        .await
        .unwrap_or(0);
    assert_eq!(n, 0, "proxy should close the broken connection");

    // The listener is still alive for the next client.
    let mut fresh_client = TcpStream::connect(proxy).await.unwrap();
    send(
        &mut fresh_client,
        &query_message(30, "admin.$cmd", &doc! { "ping": 1i32 }),
    )
    .await;
    let (reply_header, _) = read_full_message(&mut fresh_client).await;
    assert_eq!(reply_header.response_to, 30);
}
