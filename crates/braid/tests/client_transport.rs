//! Client transport handler scenarios, driven against a hand-rolled peer on
//! the other end of an in-memory codec pair.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use braid::http2::mem::{codec_pair, MemCodec};
use braid::http2::{
    HeaderBlock, Http2Codec, Http2ErrorCode, Http2Frame, DEFAULT_WINDOW_SIZE, MAX_STREAM_ID,
};
use braid::transport::client::{ClientTransportConfig, Http2ClientTransport};
use braid::{
    frame_message, ClientStream, ClientStreamListener, Code, ManagedClientTransport, Metadata,
    Status, TransportListener,
};

struct EventListener {
    tx: mpsc::UnboundedSender<String>,
}

impl ClientStreamListener for EventListener {
    fn on_headers(&mut self, headers: Metadata) {
        let _ = self.tx.send(format!("headers({})", headers.len()));
    }

    fn on_message(&mut self, message: Bytes) {
        let _ = self
            .tx
            .send(format!("message({})", String::from_utf8_lossy(&message)));
    }

    fn on_close(&mut self, status: Status, trailers: Metadata) {
        let content_type = trailers
            .get("content-type")
            .map(|v| format!("|content-type={}", v))
            .unwrap_or_default();
        let _ = self.tx.send(format!(
            "close:{}:{}{}",
            status.code(),
            status.description().unwrap_or(""),
            content_type
        ));
    }
}

#[derive(Default)]
struct Lifecycle {
    events: Arc<Mutex<Vec<String>>>,
}

struct LifecycleListener {
    events: Arc<Mutex<Vec<String>>>,
}

impl TransportListener for LifecycleListener {
    fn transport_ready(&mut self) {
        self.events.lock().push("ready".into());
    }

    fn transport_shutdown(&mut self, status: Status) {
        self.events.lock().push(format!("shutdown:{}", status.code()));
    }

    fn transport_terminated(&mut self) {
        self.events.lock().push("terminated".into());
    }

    fn transport_in_use(&mut self, in_use: bool) {
        self.events.lock().push(format!("in_use({})", in_use));
    }
}

async fn next_frame(peer: &mut MemCodec) -> Http2Frame {
    tokio::time::timeout(Duration::from_secs(5), peer.next_frame())
        .await
        .expect("timed out waiting for a frame")
        .expect("codec healthy")
        .expect("peer still open")
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<String>) -> String {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("sender alive")
}

/// Completes the settings exchange from the peer's side.
async fn handshake(peer: &mut MemCodec) {
    match next_frame(peer).await {
        Http2Frame::Settings { ack: false, .. } => {}
        other => panic!("expected client SETTINGS, got {:?}", other),
    }
    peer.write_frame(Http2Frame::Settings {
        ack: false,
        initial_window_size: Some(DEFAULT_WINDOW_SIZE),
        max_concurrent_streams: None,
    })
    .await
    .expect("write settings");
    peer.write_frame(Http2Frame::Settings {
        ack: true,
        initial_window_size: None,
        max_concurrent_streams: None,
    })
    .await
    .expect("write settings ack");
    match next_frame(peer).await {
        Http2Frame::Settings { ack: true, .. } => {}
        other => panic!("expected SETTINGS ack, got {:?}", other),
    }
}

fn started_transport(
    config: ClientTransportConfig,
) -> (Arc<Http2ClientTransport>, MemCodec, Arc<Mutex<Vec<String>>>) {
    let (client, peer) = codec_pair();
    let transport = Http2ClientTransport::new(client, config);
    let lifecycle = Lifecycle::default();
    let events = lifecycle.events.clone();
    transport.start(Box::new(LifecycleListener {
        events: lifecycle.events,
    }));
    (transport, peer, events)
}

fn new_stream(
    transport: &Http2ClientTransport,
    method: &str,
) -> (Arc<dyn ClientStream>, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let stream = braid::ClientTransport::new_stream(
        transport,
        method,
        Metadata::new(),
        Box::new(EventListener { tx }),
    );
    (stream, rx)
}

fn ok_response_headers() -> HeaderBlock {
    let mut block = HeaderBlock::new();
    block.push(":status", "200");
    block.push("content-type", "application/grpc");
    block
}

fn ok_trailers() -> HeaderBlock {
    let mut block = HeaderBlock::new();
    block.push("grpc-status", "0");
    block
}

#[tokio::test]
async fn request_headers_and_stream_ids_are_well_formed() {
    let (transport, mut peer, _lifecycle) =
        started_transport(ClientTransportConfig::new("svc.example"));
    handshake(&mut peer).await;

    let (_s1, _e1) = new_stream(&transport, "pkg.Svc/First");
    let (_s2, _e2) = new_stream(&transport, "pkg.Svc/Second");

    let mut seen_ids = Vec::new();
    for expected_path in ["/pkg.Svc/First", "/pkg.Svc/Second"] {
        match next_frame(&mut peer).await {
            Http2Frame::Headers {
                stream_id,
                headers,
                end_stream,
            } => {
                assert!(!end_stream);
                seen_ids.push(stream_id);
                assert_eq!(headers.get_str(":method"), Some("POST"));
                assert_eq!(headers.get_str(":path"), Some(expected_path));
                assert_eq!(headers.get_str(":authority"), Some("svc.example"));
                assert_eq!(headers.get_str("te"), Some("trailers"));
                assert_eq!(headers.get_str("content-type"), Some("application/grpc"));
                assert!(headers
                    .get_str("user-agent")
                    .unwrap()
                    .contains("grpc-braid/"));
            }
            other => panic!("expected HEADERS, got {:?}", other),
        }
    }
    assert_eq!(seen_ids, vec![3, 5], "odd and strictly increasing");
}

#[tokio::test]
async fn data_frames_carry_framed_messages_and_half_close() {
    let (transport, mut peer, _lifecycle) =
        started_transport(ClientTransportConfig::new("svc.example"));
    handshake(&mut peer).await;

    let (stream, _events) = new_stream(&transport, "pkg.Svc/Send");
    match next_frame(&mut peer).await {
        Http2Frame::Headers { .. } => {}
        other => panic!("expected HEADERS, got {:?}", other),
    }

    stream.send_message(Bytes::from_static(b"payload"));
    match next_frame(&mut peer).await {
        Http2Frame::Data {
            stream_id,
            data,
            end_stream,
        } => {
            assert_eq!(stream_id, 3);
            assert!(!end_stream);
            assert_eq!(&data[..], &frame_message(b"payload", false)[..]);
        }
        other => panic!("expected DATA, got {:?}", other),
    }

    stream.half_close();
    match next_frame(&mut peer).await {
        Http2Frame::Data {
            data, end_stream, ..
        } => {
            assert!(end_stream);
            assert!(data.is_empty());
        }
        other => panic!("expected empty end-of-stream DATA, got {:?}", other),
    }
}

#[tokio::test]
async fn exhausted_stream_ids_fail_the_call_and_send_goaway() {
    let config =
        ClientTransportConfig::new("svc.example").with_initial_stream_id(MAX_STREAM_ID);
    let (transport, mut peer, lifecycle) = started_transport(config);
    handshake(&mut peer).await;

    let (_first, mut first_events) = new_stream(&transport, "pkg.Svc/First");
    match next_frame(&mut peer).await {
        Http2Frame::Headers { stream_id, .. } => assert_eq!(stream_id, MAX_STREAM_ID),
        other => panic!("expected HEADERS, got {:?}", other),
    }

    let (_second, mut second_events) = new_stream(&transport, "pkg.Svc/Second");
    let close = next_event(&mut second_events).await;
    assert_eq!(
        close,
        format!("close:{}:Stream IDs have been exhausted", Code::Unavailable)
    );
    match next_frame(&mut peer).await {
        Http2Frame::GoAway { error_code, .. } => {
            assert_eq!(error_code, Http2ErrorCode::NoError.code());
        }
        other => panic!("expected GOAWAY, got {:?}", other),
    }
    assert!(lifecycle.lock().contains(&format!(
        "shutdown:{}",
        Code::Unavailable
    )));

    // The in-flight stream still completes normally.
    peer.write_frame(Http2Frame::Headers {
        stream_id: MAX_STREAM_ID,
        headers: ok_response_headers(),
        end_stream: false,
    })
    .await
    .unwrap();
    peer.write_frame(Http2Frame::Headers {
        stream_id: MAX_STREAM_ID,
        headers: ok_trailers(),
        end_stream: true,
    })
    .await
    .unwrap();
    assert_eq!(next_event(&mut first_events).await, "headers(1)");
    assert!(next_event(&mut first_events).await.starts_with("close:OK"));
}

#[tokio::test]
async fn goaway_fails_streams_above_the_watermark_only() {
    let (transport, mut peer, _lifecycle) =
        started_transport(ClientTransportConfig::new("svc.example"));
    handshake(&mut peer).await;

    let (_s3, mut events3) = new_stream(&transport, "pkg.Svc/Three");
    let (_s5, mut events5) = new_stream(&transport, "pkg.Svc/Five");
    for _ in 0..2 {
        match next_frame(&mut peer).await {
            Http2Frame::Headers { .. } => {}
            other => panic!("expected HEADERS, got {:?}", other),
        }
    }

    peer.write_frame(Http2Frame::GoAway {
        last_stream_id: 3,
        error_code: Http2ErrorCode::NoError.code(),
        debug_data: Bytes::from_static(b"maintenance"),
    })
    .await
    .unwrap();

    let close = next_event(&mut events5).await;
    assert!(close.starts_with(&format!("close:{}", Code::Unavailable)), "{}", close);
    assert!(close.contains("Goaway"), "{}", close);
    assert!(close.contains("maintenance"), "{}", close);

    // Stream 3 sits exactly on the watermark and completes normally.
    peer.write_frame(Http2Frame::Headers {
        stream_id: 3,
        headers: ok_response_headers(),
        end_stream: false,
    })
    .await
    .unwrap();
    peer.write_frame(Http2Frame::Headers {
        stream_id: 3,
        headers: ok_trailers(),
        end_stream: true,
    })
    .await
    .unwrap();
    assert_eq!(next_event(&mut events3).await, "headers(1)");
    assert!(next_event(&mut events3).await.starts_with("close:OK"));
}

#[tokio::test]
async fn bad_response_content_type_closes_with_unknown() {
    let (transport, mut peer, _lifecycle) =
        started_transport(ClientTransportConfig::new("svc.example"));
    handshake(&mut peer).await;

    let (_stream, mut events) = new_stream(&transport, "pkg.Svc/Bad");
    match next_frame(&mut peer).await {
        Http2Frame::Headers { .. } => {}
        other => panic!("expected HEADERS, got {:?}", other),
    }

    let mut block = HeaderBlock::new();
    block.push(":status", "200");
    block.push("content-type", "application/bad");
    peer.write_frame(Http2Frame::Headers {
        stream_id: 3,
        headers: block,
        end_stream: false,
    })
    .await
    .unwrap();

    let close = next_event(&mut events).await;
    assert!(close.starts_with(&format!("close:{}", Code::Unknown)), "{}", close);
    assert!(close.contains("content-type"), "{}", close);
    assert!(close.contains("application/bad"), "{}", close);
    match next_frame(&mut peer).await {
        Http2Frame::RstStream { stream_id, .. } => assert_eq!(stream_id, 3),
        other => panic!("expected RST_STREAM, got {:?}", other),
    }
}

#[tokio::test]
async fn rst_stream_codes_map_to_statuses() {
    let (transport, mut peer, _lifecycle) =
        started_transport(ClientTransportConfig::new("svc.example"));
    handshake(&mut peer).await;

    let (_stream, mut events) = new_stream(&transport, "pkg.Svc/Calm");
    match next_frame(&mut peer).await {
        Http2Frame::Headers { .. } => {}
        other => panic!("expected HEADERS, got {:?}", other),
    }
    peer.write_frame(Http2Frame::RstStream {
        stream_id: 3,
        error_code: Http2ErrorCode::EnhanceYourCalm.code(),
    })
    .await
    .unwrap();
    let close = next_event(&mut events).await;
    assert!(
        close.starts_with(&format!("close:{}", Code::ResourceExhausted)),
        "{}",
        close
    );
    assert!(close.contains("Rst Stream"), "{}", close);
}

#[tokio::test]
async fn messages_are_delivered_in_receive_order_then_trailers() {
    let (transport, mut peer, _lifecycle) =
        started_transport(ClientTransportConfig::new("svc.example"));
    handshake(&mut peer).await;

    let (stream, mut events) = new_stream(&transport, "pkg.Svc/Stream");
    match next_frame(&mut peer).await {
        Http2Frame::Headers { .. } => {}
        other => panic!("expected HEADERS, got {:?}", other),
    }
    stream.request(3);

    peer.write_frame(Http2Frame::Headers {
        stream_id: 3,
        headers: ok_response_headers(),
        end_stream: false,
    })
    .await
    .unwrap();
    for payload in [b"one".as_slice(), b"two", b"three"] {
        peer.write_frame(Http2Frame::Data {
            stream_id: 3,
            data: frame_message(payload, false),
            end_stream: false,
        })
        .await
        .unwrap();
    }
    let mut trailers = ok_trailers();
    trailers.push("grpc-message", "all%20done");
    peer.write_frame(Http2Frame::Headers {
        stream_id: 3,
        headers: trailers,
        end_stream: true,
    })
    .await
    .unwrap();

    assert_eq!(next_event(&mut events).await, "headers(1)");
    assert_eq!(next_event(&mut events).await, "message(one)");
    assert_eq!(next_event(&mut events).await, "message(two)");
    assert_eq!(next_event(&mut events).await, "message(three)");
    assert_eq!(next_event(&mut events).await, "close:OK:all done");
}

#[tokio::test]
async fn a_single_ping_serves_every_pending_callback() {
    let (transport, mut peer, _lifecycle) =
        started_transport(ClientTransportConfig::new("svc.example"));
    handshake(&mut peer).await;

    let (tx, mut results) = mpsc::unbounded_channel::<Result<(), Code>>();
    for _ in 0..2 {
        let tx = tx.clone();
        braid::ClientTransport::ping(
            transport.as_ref(),
            Box::new(move |outcome| {
                let _ = tx.send(outcome.map(|_| ()).map_err(|s| s.code()));
            }),
        );
    }

    let payload = match next_frame(&mut peer).await {
        Http2Frame::Ping {
            ack: false,
            payload,
        } => payload,
        other => panic!("expected PING, got {:?}", other),
    };
    // No second PING frame goes out; answer the one that did.
    peer.write_frame(Http2Frame::Ping { ack: true, payload })
        .await
        .unwrap();
    for _ in 0..2 {
        let outcome = tokio::time::timeout(Duration::from_secs(5), results.recv())
            .await
            .expect("ping outcome")
            .expect("sender alive");
        assert_eq!(outcome, Ok(()));
    }
}

#[tokio::test]
async fn peer_disconnect_fails_active_streams_with_unavailable() {
    let (transport, mut peer, lifecycle) =
        started_transport(ClientTransportConfig::new("svc.example"));
    handshake(&mut peer).await;

    let (_stream, mut events) = new_stream(&transport, "pkg.Svc/Drop");
    match next_frame(&mut peer).await {
        Http2Frame::Headers { .. } => {}
        other => panic!("expected HEADERS, got {:?}", other),
    }
    drop(peer);

    let close = next_event(&mut events).await;
    assert!(
        close.starts_with(&format!("close:{}:Network closed", Code::Unavailable)),
        "{}",
        close
    );
    // Lifecycle saw shutdown then terminated.
    for _ in 0..200 {
        if lifecycle.lock().contains(&"terminated".to_string()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    let events = lifecycle.lock().clone();
    assert!(events.contains(&format!("shutdown:{}", Code::Unavailable)));
    assert!(events.contains(&"terminated".to_string()));
}
