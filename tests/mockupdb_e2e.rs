//! End-to-end coverage against a real `TcpStream`: bind an ephemeral port,
//! drive a raw socket as a client would, and assert on both sides of the
//! conversation.

use std::time::Duration;

use bson::doc;
use mockupdb::config::ServerConfig;
use mockupdb::error::Error;
use mockupdb::message::Request;
use mockupdb::protocol::{self, MessageHeader, OP_MSG};
use mockupdb::server::MockServer;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

async fn spawn_server() -> (std::sync::Arc<MockServer>, TcpStream) {
    let cfg = ServerConfig::default()
        .with_port(0)
        .with_request_timeout(Duration::from_millis(500))
        .with_reply_timeout(Duration::from_secs(5));
    let server = MockServer::run(cfg).await.unwrap();
    let stream = TcpStream::connect(server.local_addr()).await.unwrap();
    (server, stream)
}

async fn read_op_msg_reply(stream: &mut TcpStream) -> bson::Document {
    let mut header_buf = [0u8; 16];
    stream.read_exact(&mut header_buf).await.unwrap();
    let header = MessageHeader::parse(&header_buf);
    assert_eq!(header.op_code, OP_MSG);
    let mut body = vec![0u8; header.message_length as usize - 16];
    stream.read_exact(&mut body).await.unwrap();
    // flagBits(4) + kind byte(1), then a single kind-0 BSON document.
    bson::Document::from_reader(&mut std::io::Cursor::new(&body[5..])).unwrap()
}

#[tokio::test]
async fn ismaster_autoresponder_answers_a_legacy_query() {
    let cfg = ServerConfig::default().with_port(0).with_auto_ismaster(true);
    let server = MockServer::run(cfg).await.unwrap();
    let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();

    let bytes =
        protocol::encode_op_query("admin.$cmd", &doc! {"ismaster": 1}, 0, 0, -1).unwrap();
    stream.write_all(&bytes).await.unwrap();

    let mut header_buf = [0u8; 16];
    stream.read_exact(&mut header_buf).await.unwrap();
    let header = MessageHeader::parse(&header_buf);
    let mut body = vec![0u8; header.message_length as usize - 16];
    stream.read_exact(&mut body).await.unwrap();
    // responseFlags(4) + cursorID(8) + startingFrom(4) + numberReturned(4), then the doc.
    let reply_doc = bson::Document::from_reader(&mut std::io::Cursor::new(&body[20..])).unwrap();
    assert_eq!(reply_doc.get_bool("ismaster").unwrap(), true);

    server.stop().await;
}

#[tokio::test]
async fn receives_times_out_when_nothing_arrives() {
    let cfg = ServerConfig::default()
        .with_port(0)
        .with_request_timeout(Duration::from_millis(100));
    let server = MockServer::run(cfg).await.unwrap();

    let started = tokio::time::Instant::now();
    let err = server.got().await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, Error::Timeout(_)));
    assert!(elapsed >= Duration::from_millis(90));
    assert!(elapsed < Duration::from_millis(400));

    server.stop().await;
}

#[tokio::test]
async fn receives_reports_unexpected_request() {
    let (server, mut stream) = spawn_server().await;

    let bytes = protocol::encode_op_msg(&doc! {"foo": 1, "$db": "test"}, 1, 0).unwrap();
    stream.write_all(&bytes).await.unwrap();

    let err = server.receives(Request::command("bar")).await.unwrap_err();
    assert!(matches!(err, Error::UnexpectedRequest { .. }));

    server.stop().await;
}

#[tokio::test]
async fn hangup_closes_the_connection_without_stopping_the_server() {
    let (server, mut stream) = spawn_server().await;

    let bytes = protocol::encode_op_msg(&doc! {"ping": 1, "$db": "admin"}, 1, 0).unwrap();
    stream.write_all(&bytes).await.unwrap();

    let request = server.got().await.unwrap();
    request.hangup().await;

    let mut buf = [0u8; 1];
    let n = stream.read(&mut buf).await.unwrap();
    assert_eq!(n, 0, "client should observe EOF after hangup");

    // The server itself is still accepting new connections.
    let mut second = TcpStream::connect(server.local_addr()).await.unwrap();
    let bytes = protocol::encode_op_msg(&doc! {"ping": 1, "$db": "admin"}, 2, 0).unwrap();
    second.write_all(&bytes).await.unwrap();
    let request = server.got().await.unwrap();
    request.reply(doc! {"ok": 1.0}).await.unwrap();

    server.stop().await;
}

#[tokio::test]
async fn lifo_autoresponder_wins() {
    let (server, mut stream) = spawn_server().await;

    server
        .autoresponds(Request::command("ping"), doc! {"ok": 1.0})
        .await;
    server
        .autoresponds(
            Request::command("ping"),
            doc! {"ok": 0.0, "errmsg": "bad"},
        )
        .await;

    let bytes = protocol::encode_op_msg(&doc! {"ping": 1, "$db": "admin"}, 9, 0).unwrap();
    stream.write_all(&bytes).await.unwrap();

    let reply = read_op_msg_reply(&mut stream).await;
    assert_eq!(reply.get_f64("ok").unwrap(), 0.0);
    assert_eq!(reply.get_str("errmsg").unwrap(), "bad");

    server.stop().await;
}

#[tokio::test]
async fn op_msg_checksum_flag_is_parsed() {
    let (server, mut stream) = spawn_server().await;

    let inner_doc = doc! {"foo": 1, "$db": "mydb"};
    let doc_bytes = bson::to_vec(&inner_doc).unwrap();
    let mut body = Vec::new();
    body.extend_from_slice(&1u32.to_le_bytes()); // checksumPresent
    body.push(0u8);
    body.extend_from_slice(&doc_bytes);
    body.extend_from_slice(&1234u32.to_le_bytes());

    let header = MessageHeader {
        message_length: (16 + body.len()) as i32,
        request_id: 3,
        response_to: 0,
        op_code: OP_MSG,
    };
    let mut wire = Vec::new();
    header.write_to(&mut wire);
    wire.extend_from_slice(&body);
    stream.write_all(&wire).await.unwrap();

    let request = server.got().await.unwrap();
    assert_eq!(request.namespace.as_deref(), Some("mydb"));
    assert_eq!(request.checksum, Some(1234));
    assert_eq!(request.flags, Some(1));

    server.stop().await;
}

#[tokio::test]
async fn registering_an_autoresponder_catches_an_already_queued_request() {
    let (server, mut stream) = spawn_server().await;

    let bytes = protocol::encode_op_msg(&doc! {"ping": 1, "$db": "admin"}, 5, 0).unwrap();
    stream.write_all(&bytes).await.unwrap();

    // Give the connection loop time to enqueue the request before the
    // responder is registered, exercising the "immediate dequeue" race
    // avoidance rather than ordinary live dispatch.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.requests_count(), 1);

    server
        .autoresponds(Request::command("ping"), doc! {"ok": 1.0})
        .await;

    let reply = read_op_msg_reply(&mut stream).await;
    assert_eq!(reply.get_f64("ok").unwrap(), 1.0);

    server.stop().await;
}
