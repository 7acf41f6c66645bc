//! Connect handshake tests against a scripted server on a localhost
//! listener.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use tnsnet::error::{Error, RefuseReason};
use tnsnet::{ConnectConfig, DisconnectMode, DriverContext};

const TYPE_CONNECT: u8 = 1;
const TYPE_ACCEPT: u8 = 2;
const TYPE_REFUSE: u8 = 4;
const TYPE_REDIRECT: u8 = 5;
const TYPE_DATA: u8 = 6;
const TYPE_RESEND: u8 = 11;
const FLAG_REDIRECTED: u8 = 0x04;
const FLAG_REDIRECT_HAS_CDATA: u8 = 0x02;
const NO_SERVICES: u8 = 0x08;

fn init_tracing() {
    let _ = tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .finish(),
    );
}

async fn read_packet(stream: &mut TcpStream) -> Vec<u8> {
    let mut header = [0u8; 8];
    stream.read_exact(&mut header).await.unwrap();
    let len = u16::from_be_bytes([header[0], header[1]]) as usize;
    let mut buf = header.to_vec();
    buf.resize(len, 0);
    stream.read_exact(&mut buf[8..]).await.unwrap();
    buf
}

fn frame(ty: u8, flags: u8, body: &[u8]) -> Vec<u8> {
    let len = (8 + body.len()) as u16;
    let mut buf = vec![0u8; 8];
    buf[0..2].copy_from_slice(&len.to_be_bytes());
    buf[4] = ty;
    buf[5] = flags;
    buf.extend_from_slice(body);
    buf
}

/// Minimal accept for a pre-315 version: 16-bit SDU/TDU, negotiation
/// declined
fn accept_packet(version: u16, sdu: u16) -> Vec<u8> {
    let mut body = vec![0u8; 16];
    body[0..2].copy_from_slice(&version.to_be_bytes());
    body[4..6].copy_from_slice(&sdu.to_be_bytes());
    body[6..8].copy_from_slice(&sdu.to_be_bytes());
    body[15] = NO_SERVICES;
    frame(TYPE_ACCEPT, 0, &body)
}

fn refuse_packet(data: &str) -> Vec<u8> {
    let mut body = vec![4u8, 4u8];
    body.extend_from_slice(&(data.len() as u16).to_be_bytes());
    body.extend_from_slice(data.as_bytes());
    frame(TYPE_REFUSE, 0, &body)
}

fn redirect_packet(flags: u8, data: &[u8]) -> Vec<u8> {
    let mut body = (data.len() as u16).to_be_bytes().to_vec();
    body.extend_from_slice(data);
    frame(TYPE_REDIRECT, flags, &body)
}

fn descriptor_for(port: u16) -> String {
    format!(
        "(DESCRIPTION=(ADDRESS=(PROTOCOL=tcp)(HOST=127.0.0.1)(PORT={port}))\
         (CONNECT_DATA=(SERVICE_NAME=orclpdb1)))"
    )
}

fn config_for(port: u16) -> ConnectConfig {
    ConnectConfig {
        connect_string: descriptor_for(port),
        ..ConnectConfig::default()
    }
}

#[tokio::test]
async fn accept_establishes_session() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let connect = read_packet(&mut stream).await;
        assert_eq!(connect[4], TYPE_CONNECT);
        // desired and minimum protocol versions
        assert_eq!(u16::from_be_bytes([connect[8], connect[9]]), 319);
        assert_eq!(u16::from_be_bytes([connect[10], connect[11]]), 300);
        let cdata = String::from_utf8_lossy(&connect[74..]).into_owned();
        assert!(cdata.contains("(SERVICE_NAME=orclpdb1)"));
        assert!(cdata.contains("(CONNECTION_ID="));
        stream.write_all(&accept_packet(312, 8192)).await.unwrap();

        // graceful disconnect carries the EOF data packet
        let eof = read_packet(&mut stream).await;
        assert_eq!(eof[4], TYPE_DATA);
        assert_eq!(u16::from_be_bytes([eof[8], eof[9]]), 0x40);
    });

    let context = DriverContext::new();
    let mut session = context.new_session();
    session.connect(&config_for(port), None).await.unwrap();
    assert!(session.is_connected());
    assert_eq!(session.session_attributes().version, 312);
    assert_eq!(session.session_attributes().sdu, 8192);
    assert_eq!(session.service_name().as_deref(), Some("orclpdb1"));

    session.disconnect(DisconnectMode::Graceful).await;
    assert!(!session.is_connected());
    server.await.unwrap();
}

#[tokio::test]
async fn refuse_with_unknown_service_maps_to_typed_error() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        read_packet(&mut stream).await;
        stream
            .write_all(&refuse_packet("(DESCRIPTION=(ERR=12514))"))
            .await
            .unwrap();
    });

    let context = DriverContext::new();
    let mut session = context.new_session();
    let err = session.connect(&config_for(port), None).await.unwrap_err();
    match err {
        Error::ProtocolRefused {
            reason: RefuseReason::ServiceNotRegistered(name),
            ..
        } => assert_eq!(name, "orclpdb1"),
        other => panic!("unexpected error {other:?}"),
    }
    server.await.unwrap();
}

#[tokio::test]
async fn resend_replays_the_connect_packet() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let first = read_packet(&mut stream).await;
        stream.write_all(&frame(TYPE_RESEND, 0, &[])).await.unwrap();
        let second = read_packet(&mut stream).await;
        assert_eq!(second, first);
        stream.write_all(&accept_packet(312, 8192)).await.unwrap();
    });

    let context = DriverContext::new();
    let mut session = context.new_session();
    session.connect(&config_for(port), None).await.unwrap();
    assert!(session.is_connected());
    server.await.unwrap();
}

#[tokio::test]
async fn redirect_reconnects_with_redirected_flag() {
    init_tracing();
    let first = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let first_port = first.local_addr().unwrap().port();
    let second = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let second_port = second.local_addr().unwrap().port();

    let redirecting = tokio::spawn(async move {
        let (mut stream, _) = first.accept().await.unwrap();
        read_packet(&mut stream).await;
        let target = descriptor_for(second_port);
        stream
            .write_all(&redirect_packet(0, target.as_bytes()))
            .await
            .unwrap();
    });
    let accepting = tokio::spawn(async move {
        let (mut stream, _) = second.accept().await.unwrap();
        let connect = read_packet(&mut stream).await;
        assert_eq!(connect[4], TYPE_CONNECT);
        assert_eq!(connect[5] & FLAG_REDIRECTED, FLAG_REDIRECTED);
        stream.write_all(&accept_packet(312, 8192)).await.unwrap();
    });

    let context = DriverContext::new();
    let mut session = context.new_session();
    session.connect(&config_for(first_port), None).await.unwrap();
    assert!(session.is_connected());
    redirecting.await.unwrap();
    accepting.await.unwrap();
}

#[tokio::test]
async fn redirect_with_separator_replays_the_embedded_connect_data() {
    init_tracing();
    let first = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let first_port = first.local_addr().unwrap().port();
    let second = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let second_port = second.local_addr().unwrap().port();

    let replacement = "(DESCRIPTION=(CONNECT_DATA=(SERVICE_NAME=relocated)))";
    let redirecting = tokio::spawn(async move {
        let (mut stream, _) = first.accept().await.unwrap();
        read_packet(&mut stream).await;
        // address before the NUL, replacement connect data after it
        let mut payload = format!("127.0.0.1:{second_port}").into_bytes();
        payload.push(0);
        payload.extend_from_slice(replacement.as_bytes());
        stream
            .write_all(&redirect_packet(FLAG_REDIRECT_HAS_CDATA, &payload))
            .await
            .unwrap();
    });
    let accepting = tokio::spawn(async move {
        let (mut stream, _) = second.accept().await.unwrap();
        let connect = read_packet(&mut stream).await;
        assert_eq!(connect[4], TYPE_CONNECT);
        assert_eq!(connect[5] & FLAG_REDIRECTED, FLAG_REDIRECTED);
        assert_eq!(&connect[74..], replacement.as_bytes());
        stream.write_all(&accept_packet(312, 8192)).await.unwrap();
    });

    let context = DriverContext::new();
    let mut session = context.new_session();
    session.connect(&config_for(first_port), None).await.unwrap();
    assert!(session.is_connected());
    redirecting.await.unwrap();
    accepting.await.unwrap();
}

#[tokio::test]
async fn failed_endpoint_is_marked_down_and_next_tried() {
    init_tracing();
    // a bound then dropped listener gives a port that refuses connections
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_port = dead.local_addr().unwrap().port();
    drop(dead);

    let live = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let live_port = live.local_addr().unwrap().port();
    let server = tokio::spawn(async move {
        let (mut stream, _) = live.accept().await.unwrap();
        read_packet(&mut stream).await;
        stream.write_all(&accept_packet(312, 8192)).await.unwrap();
    });

    let connect_string = format!(
        "(DESCRIPTION=(ADDRESS_LIST=(LOAD_BALANCE=off)\
         (ADDRESS=(PROTOCOL=tcp)(HOST=127.0.0.1)(PORT={dead_port}))\
         (ADDRESS=(PROTOCOL=tcp)(HOST=127.0.0.1)(PORT={live_port})))\
         (CONNECT_DATA=(SERVICE_NAME=orclpdb1)))"
    );
    let config = ConnectConfig {
        connect_string,
        ..ConnectConfig::default()
    };

    let context = DriverContext::new();
    let mut session = context.new_session();
    session.connect(&config, None).await.unwrap();
    assert!(session.is_connected());
    assert!(context.down_hosts().is_down("127.0.0.1"));
    server.await.unwrap();
}

#[tokio::test]
async fn exhaustion_surfaces_the_last_failure() {
    init_tracing();
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_port = dead.local_addr().unwrap().port();
    drop(dead);

    let config = ConnectConfig {
        connect_string: descriptor_for(dead_port),
        connect_timeout: Some(Duration::from_secs(5)),
        ..ConnectConfig::default()
    };
    let context = DriverContext::new();
    let mut session = context.new_session();
    let err = session.connect(&config, None).await.unwrap_err();
    assert!(matches!(
        err,
        Error::TransportConnectFailed { .. } | Error::OperationTimedOut { .. }
    ));
}

#[tokio::test]
async fn payload_flows_after_accept() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        read_packet(&mut stream).await;
        stream.write_all(&accept_packet(312, 8192)).await.unwrap();

        let data = read_packet(&mut stream).await;
        assert_eq!(data[4], TYPE_DATA);
        assert_eq!(&data[10..], b"ping");

        let mut reply = vec![0u8; 2];
        reply.extend_from_slice(b"pong");
        stream.write_all(&frame(TYPE_DATA, 0, &reply)).await.unwrap();
    });

    let context = DriverContext::new();
    let mut session = context.new_session();
    session.connect(&config_for(port), None).await.unwrap();

    session.send(b"ping").await.unwrap();
    session.flush().await.unwrap();
    session.receive().await.unwrap();
    assert_eq!(session.received(), b"pong");
    server.await.unwrap();
}

#[tokio::test]
async fn sessions_share_the_down_host_cache() {
    init_tracing();
    let context = DriverContext::new();
    context.down_hosts().mark_down("db-standby");
    assert!(context.down_hosts().is_down("db-standby"));
    let other = Arc::clone(context.down_hosts());
    assert!(other.is_down("db-standby"));
}
