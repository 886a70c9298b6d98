//! Media path of a connected call, driven from a raw loopback peer

mod common;

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::*;
use lancall_call_engine::{CallEngine, CallState, NoopEventHandler};
use lancall_wire_core::{decode_media, encode_media, SignalingKind, MEDIA_HEADER_LEN, MEDIA_PAYLOAD_TYPE};
use tokio::net::UdpSocket;

struct ConnectedCall {
    engine: CallEngine,
    audio: Arc<ChannelAudioDevice>,
    caller: RawPeer,
    caller_media: UdpSocket,
}

/// Engine answering a raw caller whose media socket is `caller_media`
async fn connected_call() -> ConnectedCall {
    let caller = RawPeer::bind().await;
    let caller_media = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let config = test_config().with_peer_media_port(caller_media.local_addr().unwrap().port());
    let audio = ChannelAudioDevice::new();
    let engine = start_engine("Bob", config, audio.clone(), Arc::new(NoopEventHandler)).await;
    let mut status = engine.subscribe();

    caller.invite("media@127.0.0.1", engine.local_signaling_addr()).await;
    wait_for_state(&mut status, CallState::Ringing).await;
    engine.answer().await.unwrap();
    assert_eq!(caller.recv().await.kind, SignalingKind::Ok);

    ConnectedCall {
        engine,
        audio,
        caller,
        caller_media,
    }
}

async fn recv_media(socket: &UdpSocket) -> Vec<u8> {
    let mut buf = vec![0u8; 2048];
    let (len, _) = tokio::time::timeout(WAIT, socket.recv_from(&mut buf))
        .await
        .expect("no media in time")
        .unwrap();
    buf.truncate(len);
    buf
}

#[tokio::test]
async fn test_captured_audio_is_packetized_from_zero() {
    let call = connected_call().await;
    let capture = call.audio.capture().unwrap();

    capture.send(Bytes::from(vec![7u8; 640])).await.unwrap();
    capture.send(Bytes::from(vec![9u8; 320])).await.unwrap();

    let first = recv_media(&call.caller_media).await;
    assert_eq!(first.len(), MEDIA_HEADER_LEN + 640);
    assert_eq!(first[0], 0x80);
    assert_eq!(first[1], MEDIA_PAYLOAD_TYPE);
    let first = decode_media(&first).unwrap();
    assert_eq!(first.sequence_number, 0);
    assert_eq!(first.timestamp, 0);

    let second = decode_media(&recv_media(&call.caller_media).await).unwrap();
    assert_eq!(second.sequence_number, 1);
    // 640 bytes of 16-bit mono is 320 samples
    assert_eq!(second.timestamp, 320);
    assert_eq!(second.ssrc, first.ssrc);
    assert_eq!(&second.payload[..], &[9u8; 320][..]);

    call.engine.shutdown().await;
}

#[tokio::test]
async fn test_received_media_reaches_playback() {
    let call = connected_call().await;
    let mut playback = call.audio.take_playback().unwrap();
    let engine_media: SocketAddr = call.engine.media_addr();

    // Header only: an empty frame, not an error
    let empty = encode_media(&[], 0, 0, 42);
    call.caller_media.send_to(&empty, engine_media).await.unwrap();
    let played = tokio::time::timeout(WAIT, playback.recv()).await.unwrap().unwrap();
    assert!(played.is_empty());

    // Too short to be a packet: dropped, loop keeps running
    call.caller_media.send_to(&[0x80, 96, 0, 1, 0], engine_media).await.unwrap();

    let frame = encode_media(&[1, 2, 3], 2, 160, 42);
    call.caller_media.send_to(&frame, engine_media).await.unwrap();
    let played = tokio::time::timeout(WAIT, playback.recv()).await.unwrap().unwrap();
    assert_eq!(&played[..], &[1, 2, 3]);

    let stats = call.engine.media_stats();
    assert_eq!(stats.packets_received.load(Ordering::Relaxed), 2);
    assert_eq!(stats.packets_dropped.load(Ordering::Relaxed), 1);

    call.engine.shutdown().await;
}

#[tokio::test]
async fn test_remote_bye_stops_media() {
    let call = connected_call().await;
    let mut status = call.engine.subscribe();
    let capture = call.audio.capture().unwrap();

    call.caller.bye("media@127.0.0.1", call.engine.local_signaling_addr()).await;
    let ended = wait_for_state(&mut status, CallState::Idle).await;
    assert_eq!(ended.message, "Call Ended");
    assert_eq!(call.caller.recv().await.kind, SignalingKind::Ok);

    wait_until(|| call.audio.closes() >= 1).await;
    // Capture end is gone once the device is released
    wait_until(|| capture.is_closed()).await;

    // Nothing more is sent after teardown
    let _ = capture.send(Bytes::from_static(b"late")).await;
    let mut buf = [0u8; 64];
    let late = tokio::time::timeout(Duration::from_millis(200), call.caller_media.recv_from(&mut buf)).await;
    assert!(late.is_err());

    call.engine.shutdown().await;
}

#[tokio::test]
async fn test_media_queued_between_calls_is_not_played() {
    let caller = RawPeer::bind().await;
    let caller_media = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let config = test_config().with_peer_media_port(caller_media.local_addr().unwrap().port());
    let audio = ChannelAudioDevice::new();
    let engine = start_engine("Bob", config, audio.clone(), Arc::new(NoopEventHandler)).await;
    let mut status = engine.subscribe();

    // Arrives while no call is up
    let stale = encode_media(b"stale", 40, 6400, 7);
    caller_media.send_to(&stale, engine.media_addr()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    caller.invite("fresh@127.0.0.1", engine.local_signaling_addr()).await;
    wait_for_state(&mut status, CallState::Ringing).await;
    engine.answer().await.unwrap();
    assert_eq!(caller.recv().await.kind, SignalingKind::Ok);
    let mut playback = audio.take_playback().unwrap();

    let frame = encode_media(b"fresh", 0, 0, 8);
    caller_media.send_to(&frame, engine.media_addr()).await.unwrap();
    let played = tokio::time::timeout(WAIT, playback.recv()).await.unwrap().unwrap();
    assert_eq!(&played[..], b"fresh");

    let stats = engine.media_stats();
    assert_eq!(stats.packets_received.load(Ordering::Relaxed), 1);
    assert_eq!(stats.packets_dropped.load(Ordering::Relaxed), 0);

    engine.shutdown().await;
}
