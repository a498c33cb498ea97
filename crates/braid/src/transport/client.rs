//! The client-side HTTP/2 transport handler.
//!
//! One event-loop task per connection owns every piece of HTTP/2 state.
//! Application threads never touch it directly: stream operations are
//! enqueued as commands on the write queue and the loop interleaves them
//! with frames from the codec. Commands enqueued from one thread are
//! processed in order, and a stream's inbound messages are delivered in
//! receive order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use braid_core::http2::flow::{LocalWindow, OutboundFlow};
use braid_core::http2::{
    AnyHttp2Codec, HeaderBlock, Http2Codec, Http2ErrorCode, Http2Frame, DEFAULT_WINDOW_SIZE,
    MAX_STREAM_ID,
};
use braid_core::{
    frame_message, http_status_to_grpc, Deframed, MessageDeframer, Metadata, Status,
    DEFAULT_MAX_MESSAGE_SIZE,
};

use super::{
    client_request_headers, headers_to_metadata, is_grpc_content_type, ClientStream,
    ClientStreamListener, ClientTransport, ManagedClientTransport, PingCallback,
    TransportListener,
};

/// Construction-time settings for one client connection.
pub struct ClientTransportConfig {
    pub authority: String,
    pub scheme: String,
    pub user_agent: String,
    pub max_message_size: usize,
    /// First stream id to allocate. Must be odd. The default is 3; tests
    /// inject values near the cap to exercise exhaustion.
    pub initial_stream_id: u32,
}

impl ClientTransportConfig {
    pub fn new(authority: impl Into<String>) -> ClientTransportConfig {
        ClientTransportConfig {
            authority: authority.into(),
            scheme: "http".to_string(),
            user_agent: super::grpc_user_agent(None),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            initial_stream_id: 3,
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> ClientTransportConfig {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_initial_stream_id(mut self, id: u32) -> ClientTransportConfig {
        debug_assert!(id % 2 == 1, "client stream ids are odd");
        self.initial_stream_id = id;
        self
    }
}

#[derive(Default)]
struct StreamHandle {
    id: AtomicU32,
}

enum Command {
    CreateStream {
        handle: Arc<StreamHandle>,
        method: String,
        headers: Metadata,
        listener: Box<dyn ClientStreamListener>,
    },
    SendFrame {
        handle: Arc<StreamHandle>,
        data: Bytes,
        end_stream: bool,
    },
    CancelStream {
        handle: Arc<StreamHandle>,
        status: Status,
    },
    RequestMessages {
        handle: Arc<StreamHandle>,
        count: u32,
    },
    SendPing {
        callback: PingCallback,
    },
    GracefulClose {
        status: Status,
    },
    ForcefulClose {
        status: Status,
    },
}

struct Http2ClientStream {
    handle: Arc<StreamHandle>,
    commands: mpsc::UnboundedSender<Command>,
}

impl ClientStream for Http2ClientStream {
    fn send_message(&self, message: Bytes) {
        let framed = frame_message(&message, false);
        let _ = self.commands.send(Command::SendFrame {
            handle: self.handle.clone(),
            data: framed,
            end_stream: false,
        });
    }

    fn half_close(&self) {
        let _ = self.commands.send(Command::SendFrame {
            handle: self.handle.clone(),
            data: Bytes::new(),
            end_stream: true,
        });
    }

    fn cancel(&self, status: Status) {
        let _ = self.commands.send(Command::CancelStream {
            handle: self.handle.clone(),
            status,
        });
    }

    fn request(&self, count: u32) {
        let _ = self.commands.send(Command::RequestMessages {
            handle: self.handle.clone(),
            count,
        });
    }
}

struct StartArgs {
    codec: AnyHttp2Codec,
    config: ClientTransportConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    runtime: tokio::runtime::Handle,
}

/// A client transport over one HTTP/2 connection.
pub struct Http2ClientTransport {
    commands: mpsc::UnboundedSender<Command>,
    start_args: Mutex<Option<StartArgs>>,
}

impl Http2ClientTransport {
    /// Wraps a codec. The event loop does not run until
    /// [`ManagedClientTransport::start`].
    pub fn new(codec: impl Http2Codec, config: ClientTransportConfig) -> Arc<Http2ClientTransport> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Http2ClientTransport {
            commands: tx,
            start_args: Mutex::new(Some(StartArgs {
                codec: AnyHttp2Codec::new(codec),
                config,
                commands: rx,
                runtime: tokio::runtime::Handle::current(),
            })),
        })
    }
}

impl ClientTransport for Http2ClientTransport {
    fn new_stream(
        &self,
        method: &str,
        headers: Metadata,
        listener: Box<dyn ClientStreamListener>,
    ) -> Arc<dyn ClientStream> {
        let handle = Arc::new(StreamHandle::default());
        let stream = Arc::new(Http2ClientStream {
            handle: handle.clone(),
            commands: self.commands.clone(),
        });
        let command = Command::CreateStream {
            handle,
            method: method.to_string(),
            headers,
            listener,
        };
        if let Err(mpsc::error::SendError(command)) = self.commands.send(command) {
            if let Command::CreateStream { mut listener, .. } = command {
                listener.on_close(
                    Status::unavailable("transport terminated"),
                    Metadata::new(),
                );
            }
        }
        stream
    }

    fn ping(&self, callback: PingCallback) {
        let command = Command::SendPing { callback };
        if let Err(mpsc::error::SendError(command)) = self.commands.send(command) {
            if let Command::SendPing { callback } = command {
                callback(Err(Status::unavailable("transport terminated")));
            }
        }
    }
}

impl ManagedClientTransport for Http2ClientTransport {
    fn start(&self, listener: Box<dyn TransportListener>) {
        let args = self
            .start_args
            .lock()
            .take()
            .expect("transport started twice");
        let runtime = args.runtime.clone();
        runtime.spawn(async move {
            TransportLoop::new(args, listener).run().await;
        });
    }

    fn shutdown(&self) {
        let _ = self.commands.send(Command::GracefulClose {
            status: Status::unavailable("transport shutdown"),
        });
    }

    fn shutdown_now(&self, status: Status) {
        let _ = self.commands.send(Command::ForcefulClose { status });
    }
}

struct StreamEntry {
    listener: Box<dyn ClientStreamListener>,
    deframer: MessageDeframer,
    window: LocalWindow,
    headers_received: bool,
}

struct OutstandingPing {
    payload: u64,
    sent_at: Instant,
    callbacks: Vec<PingCallback>,
}

struct TransportLoop {
    codec: AnyHttp2Codec,
    commands: mpsc::UnboundedReceiver<Command>,
    listener: Box<dyn TransportListener>,
    config: ClientTransportConfig,
    streams: HashMap<u32, StreamEntry>,
    next_stream_id: u32,
    last_created_id: u32,
    goaway_sent: bool,
    shutdown_status: Option<Status>,
    close_when_drained: bool,
    closing: bool,
    settings_received: bool,
    ready_notified: bool,
    terminated_notified: bool,
    in_use: bool,
    ping: Option<OutstandingPing>,
    outbound: OutboundFlow,
    connection_window: LocalWindow,
}

impl TransportLoop {
    fn new(args: StartArgs, listener: Box<dyn TransportListener>) -> TransportLoop {
        let next_stream_id = args.config.initial_stream_id;
        TransportLoop {
            codec: args.codec,
            commands: args.commands,
            listener,
            config: args.config,
            streams: HashMap::new(),
            next_stream_id,
            last_created_id: 0,
            goaway_sent: false,
            shutdown_status: None,
            close_when_drained: false,
            closing: false,
            settings_received: false,
            ready_notified: false,
            terminated_notified: false,
            in_use: false,
            ping: None,
            outbound: OutboundFlow::new(DEFAULT_WINDOW_SIZE),
            connection_window: LocalWindow::default(),
        }
    }

    async fn run(mut self) {
        self.write(Http2Frame::Settings {
            ack: false,
            initial_window_size: Some(DEFAULT_WINDOW_SIZE),
            max_concurrent_streams: None,
        })
        .await;

        while !self.closing {
            enum Step {
                Command(Option<Command>),
                Frame(Result<Option<Http2Frame>, braid_core::http2::CodecError>),
            }
            let step = tokio::select! {
                command = self.commands.recv() => Step::Command(command),
                frame = self.codec.next_frame() => Step::Frame(frame),
            };
            match step {
                Step::Command(Some(command)) => self.handle_command(command).await,
                Step::Command(None) => {
                    // The owning handle is gone; nobody can use this
                    // connection again.
                    self.notify_shutdown(Status::unavailable("transport released"));
                    self.closing = true;
                }
                Step::Frame(Ok(Some(frame))) => self.handle_frame(frame).await,
                Step::Frame(Ok(None)) => {
                    tracing::debug!("connection closed by peer");
                    self.closing = true;
                }
                Step::Frame(Err(error)) => {
                    tracing::debug!(%error, "connection error");
                    self.notify_shutdown(Status::unavailable("connection error").augment_description(error.to_string()));
                    self.closing = true;
                }
            }
        }
        self.finalize();
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::CreateStream {
                handle,
                method,
                headers,
                mut listener,
            } => {
                if let Some(status) = &self.shutdown_status {
                    listener.on_close(status.clone(), Metadata::new());
                    return;
                }
                if self.next_stream_id > MAX_STREAM_ID {
                    let status = Status::unavailable("Stream IDs have been exhausted");
                    listener.on_close(status.clone(), Metadata::new());
                    if !self.goaway_sent {
                        tracing::debug!(
                            "stream ids exhausted, starting graceful shutdown of the connection"
                        );
                        self.goaway_sent = true;
                        self.write(Http2Frame::GoAway {
                            last_stream_id: 0,
                            error_code: Http2ErrorCode::NoError.code(),
                            debug_data: Bytes::new(),
                        })
                        .await;
                        self.notify_shutdown(status);
                        self.close_when_drained = true;
                        self.maybe_close_when_drained();
                    }
                    return;
                }
                let id = self.next_stream_id;
                self.next_stream_id += 2;
                self.last_created_id = id;
                handle.id.store(id, Ordering::SeqCst);

                let block = client_request_headers(
                    &method,
                    &self.config.scheme,
                    &self.config.authority,
                    &self.config.user_agent,
                    &headers,
                );
                self.write(Http2Frame::Headers {
                    stream_id: id,
                    headers: block,
                    end_stream: false,
                })
                .await;
                self.outbound.open_stream(id);
                let mut entry = StreamEntry {
                    listener,
                    deframer: MessageDeframer::new(self.config.max_message_size),
                    window: LocalWindow::default(),
                    headers_received: false,
                };
                entry.listener.on_ready();
                self.streams.insert(id, entry);
                self.update_in_use();
            }
            Command::SendFrame {
                handle,
                data,
                end_stream,
            } => {
                let id = handle.id.load(Ordering::SeqCst);
                if id == 0 || !self.streams.contains_key(&id) {
                    return;
                }
                self.outbound.queue(id, data, end_stream);
                self.flush_outbound().await;
            }
            Command::CancelStream { handle, status } => {
                let id = handle.id.load(Ordering::SeqCst);
                if id == 0 {
                    return;
                }
                if self.streams.contains_key(&id) {
                    self.finish_stream(id, status, Metadata::new(), false).await;
                    self.write(Http2Frame::RstStream {
                        stream_id: id,
                        error_code: Http2ErrorCode::Cancel.code(),
                    })
                    .await;
                }
            }
            Command::RequestMessages { handle, count } => {
                let id = handle.id.load(Ordering::SeqCst);
                if let Some(entry) = self.streams.get_mut(&id) {
                    entry.deframer.request(count);
                    self.pump_stream(id).await;
                }
            }
            Command::SendPing { callback } => {
                // Pings stay legal after shutdown starts, until termination.
                match &mut self.ping {
                    Some(ping) => ping.callbacks.push(callback),
                    None => {
                        let payload: u64 = rand::random();
                        self.ping = Some(OutstandingPing {
                            payload,
                            sent_at: Instant::now(),
                            callbacks: vec![callback],
                        });
                        self.write(Http2Frame::Ping {
                            ack: false,
                            payload,
                        })
                        .await;
                    }
                }
            }
            Command::GracefulClose { status } => {
                self.notify_shutdown(status);
                if !self.goaway_sent {
                    self.goaway_sent = true;
                    self.write(Http2Frame::GoAway {
                        last_stream_id: 0,
                        error_code: Http2ErrorCode::NoError.code(),
                        debug_data: Bytes::new(),
                    })
                    .await;
                }
                self.close_when_drained = true;
                self.maybe_close_when_drained();
            }
            Command::ForcefulClose { status } => {
                self.notify_shutdown(status.clone());
                let ids: Vec<u32> = self.streams.keys().copied().collect();
                for id in ids {
                    self.finish_stream(id, status.clone(), Metadata::new(), false)
                        .await;
                    self.write(Http2Frame::RstStream {
                        stream_id: id,
                        error_code: Http2ErrorCode::Cancel.code(),
                    })
                    .await;
                }
                self.closing = true;
            }
        }
    }

    async fn handle_frame(&mut self, frame: Http2Frame) {
        match frame {
            Http2Frame::Settings {
                ack: false,
                initial_window_size,
                ..
            } => {
                if let Some(window) = initial_window_size {
                    self.outbound.set_initial_window(window);
                }
                self.write(Http2Frame::Settings {
                    ack: true,
                    initial_window_size: None,
                    max_concurrent_streams: None,
                })
                .await;
                if !self.settings_received {
                    self.settings_received = true;
                    self.notify_ready();
                }
                self.flush_outbound().await;
            }
            Http2Frame::Settings { ack: true, .. } => {}
            Http2Frame::WindowUpdate {
                stream_id,
                increment,
            } => {
                self.outbound.window_update(stream_id, increment);
                self.flush_outbound().await;
            }
            Http2Frame::Ping {
                ack: false,
                payload,
            } => {
                self.write(Http2Frame::Ping { ack: true, payload }).await;
            }
            Http2Frame::Ping { ack: true, payload } => self.handle_ping_ack(payload),
            Http2Frame::Headers {
                stream_id,
                headers,
                end_stream,
            } => {
                self.handle_response_headers(stream_id, headers, end_stream)
                    .await;
            }
            Http2Frame::Data {
                stream_id,
                data,
                end_stream,
            } => {
                if let Some(entry) = self.streams.get_mut(&stream_id) {
                    entry.deframer.feed(data, end_stream);
                    self.pump_stream(stream_id).await;
                }
            }
            Http2Frame::RstStream {
                stream_id,
                error_code,
            } => {
                if self.streams.contains_key(&stream_id) {
                    let status = Http2ErrorCode::status_for_code(error_code)
                        .augment_description("Received Rst Stream");
                    self.finish_stream(stream_id, status, Metadata::new(), true)
                        .await;
                }
            }
            Http2Frame::GoAway {
                last_stream_id,
                error_code,
                debug_data,
            } => {
                let mut status = Http2ErrorCode::status_for_code(error_code)
                    .augment_description("Received Goaway");
                if !debug_data.is_empty() {
                    status = status.augment_description(String::from_utf8_lossy(&debug_data));
                }
                tracing::debug!(last_stream_id, error_code, "received GOAWAY");
                self.notify_shutdown(status.clone());
                self.close_when_drained = true;
                let affected: Vec<u32> = self
                    .streams
                    .keys()
                    .copied()
                    .filter(|id| *id > last_stream_id)
                    .collect();
                for id in affected {
                    self.finish_stream(id, status.clone(), Metadata::new(), false)
                        .await;
                }
                self.maybe_close_when_drained();
            }
        }
    }

    fn handle_ping_ack(&mut self, payload: u64) {
        let matched = self.ping.as_ref().map(|p| p.payload == payload);
        match matched {
            Some(true) => {
                let ping = self.ping.take().expect("checked above");
                let rtt = ping.sent_at.elapsed();
                for callback in ping.callbacks {
                    callback(Ok(rtt));
                }
            }
            Some(false) => {
                let expected = self.ping.as_ref().map(|p| p.payload).unwrap_or_default();
                tracing::warn!(expected, got = payload, "received unexpected ping ack");
            }
            None => tracing::warn!("received ping ack but no ping is outstanding"),
        }
    }

    async fn handle_response_headers(
        &mut self,
        stream_id: u32,
        block: HeaderBlock,
        end_stream: bool,
    ) {
        let Some(entry) = self.streams.get_mut(&stream_id) else {
            return;
        };
        if end_stream {
            // Trailers, or a trailers-only response.
            let trailers = headers_to_metadata(&block);
            let status = match Status::from_trailers(&trailers) {
                Some(status) => status,
                None => match block.get_str(":status").and_then(|s| s.parse::<u16>().ok()) {
                    Some(code) => http_status_to_grpc(code)
                        .augment_description("missing grpc-status in trailers"),
                    None => Status::internal("missing grpc-status in trailers"),
                },
            };
            self.finish_stream(stream_id, status, trailers, true).await;
            return;
        }
        if !entry.headers_received {
            let http_status = block.get_str(":status").and_then(|s| s.parse::<u16>().ok());
            let content_type = block.get_str("content-type");
            let failure = if http_status != Some(200) {
                Some(match http_status {
                    Some(code) => http_status_to_grpc(code),
                    None => Status::internal("response is missing :status"),
                })
            } else if !content_type.map(is_grpc_content_type).unwrap_or(false) {
                Some(Status::unknown(format!(
                    "invalid content-type: {}",
                    content_type.unwrap_or("<missing>")
                )))
            } else {
                None
            };
            match failure {
                Some(status) => {
                    let metadata = headers_to_metadata(&block);
                    self.finish_stream(stream_id, status, metadata, false).await;
                    self.write(Http2Frame::RstStream {
                        stream_id,
                        error_code: Http2ErrorCode::Cancel.code(),
                    })
                    .await;
                }
                None => {
                    entry.headers_received = true;
                    let metadata = headers_to_metadata(&block);
                    entry.listener.on_headers(metadata);
                }
            }
        } else {
            // A second non-final HEADERS block is not something gRPC produces.
            self.finish_stream(
                stream_id,
                Status::internal("unexpected headers frame on an open stream"),
                Metadata::new(),
                false,
            )
            .await;
            self.write(Http2Frame::RstStream {
                stream_id,
                error_code: Http2ErrorCode::InternalError.code(),
            })
            .await;
        }
    }

    /// Delivers whatever the deframer can release, handling stream errors and
    /// server half-close.
    async fn pump_stream(&mut self, stream_id: u32) {
        loop {
            enum Out {
                Message(Bytes, usize),
                EndOfStream,
                Error(Status),
                Blocked,
            }
            let out = match self.streams.get_mut(&stream_id) {
                None => return,
                Some(entry) => match entry.deframer.next() {
                    Ok(Some(Deframed::Message { payload, wire_size })) => {
                        Out::Message(payload, wire_size)
                    }
                    Ok(Some(Deframed::EndOfStream)) => Out::EndOfStream,
                    Ok(None) => Out::Blocked,
                    Err(status) => Out::Error(status),
                },
            };
            match out {
                Out::Message(payload, wire_size) => {
                    self.return_processed_bytes(stream_id, wire_size).await;
                    if let Some(entry) = self.streams.get_mut(&stream_id) {
                        entry.listener.on_message(payload);
                    }
                }
                Out::EndOfStream => {
                    // A gRPC response must end with trailers, not a DATA
                    // end-of-stream.
                    self.finish_stream(
                        stream_id,
                        Status::internal("end of stream without trailers"),
                        Metadata::new(),
                        false,
                    )
                    .await;
                    return;
                }
                Out::Error(status) => {
                    self.finish_stream(stream_id, status, Metadata::new(), false)
                        .await;
                    self.write(Http2Frame::RstStream {
                        stream_id,
                        error_code: Http2ErrorCode::InternalError.code(),
                    })
                    .await;
                    return;
                }
                Out::Blocked => return,
            }
        }
    }

    /// Returns consumed bytes to the stream and connection windows.
    async fn return_processed_bytes(&mut self, stream_id: u32, bytes: usize) {
        let stream_increment = self
            .streams
            .get_mut(&stream_id)
            .and_then(|entry| entry.window.consume(bytes));
        if let Some(increment) = stream_increment {
            self.write(Http2Frame::WindowUpdate {
                stream_id,
                increment,
            })
            .await;
        }
        if let Some(increment) = self.connection_window.consume(bytes) {
            self.write(Http2Frame::WindowUpdate {
                stream_id: 0,
                increment,
            })
            .await;
        }
    }

    /// Removes the stream and reports `on_close` exactly once. With `drain`,
    /// messages the application has already requested are delivered first;
    /// anything beyond the permit count is dropped with the stream.
    async fn finish_stream(
        &mut self,
        stream_id: u32,
        status: Status,
        trailers: Metadata,
        drain: bool,
    ) {
        if drain {
            self.drain_permitted(stream_id).await;
        }
        let Some(mut entry) = self.streams.remove(&stream_id) else {
            return;
        };
        entry.listener.on_close(status, trailers);
        self.outbound.close_stream(stream_id);
        self.update_in_use();
        self.maybe_close_when_drained();
    }

    async fn drain_permitted(&mut self, stream_id: u32) {
        loop {
            let message = match self.streams.get_mut(&stream_id) {
                None => return,
                Some(entry) => match entry.deframer.next() {
                    Ok(Some(Deframed::Message { payload, wire_size })) => {
                        Some((payload, wire_size))
                    }
                    _ => None,
                },
            };
            let Some((payload, wire_size)) = message else {
                return;
            };
            self.return_processed_bytes(stream_id, wire_size).await;
            if let Some(entry) = self.streams.get_mut(&stream_id) {
                entry.listener.on_message(payload);
            }
        }
    }

    async fn flush_outbound(&mut self) {
        for (stream_id, data, end_stream) in self.outbound.take_writable() {
            self.write(Http2Frame::Data {
                stream_id,
                data,
                end_stream,
            })
            .await;
        }
    }

    async fn write(&mut self, frame: Http2Frame) {
        if let Err(error) = self.codec.write_frame(frame).await {
            tracing::debug!(%error, "write failed; closing connection");
            self.notify_shutdown(
                Status::unavailable("connection error").augment_description(error.to_string()),
            );
            self.closing = true;
        }
    }

    fn update_in_use(&mut self) {
        let now_in_use = !self.streams.is_empty();
        if now_in_use != self.in_use {
            self.in_use = now_in_use;
            self.listener.transport_in_use(now_in_use);
        }
    }

    fn maybe_close_when_drained(&mut self) {
        if self.close_when_drained && self.streams.is_empty() {
            self.closing = true;
        }
    }

    fn notify_ready(&mut self) {
        if !self.ready_notified && self.shutdown_status.is_none() {
            self.ready_notified = true;
            self.listener.transport_ready();
        }
    }

    fn notify_shutdown(&mut self, status: Status) {
        if self.shutdown_status.is_none() {
            self.shutdown_status = Some(status.clone());
            self.listener.transport_shutdown(status);
        }
    }

    fn notify_terminated(&mut self) {
        if !self.terminated_notified {
            self.terminated_notified = true;
            self.listener.transport_terminated();
        }
    }

    fn finalize(&mut self) {
        let status = self
            .shutdown_status
            .clone()
            .unwrap_or_else(|| Status::unavailable("Network closed for unknown reason"));
        if self.shutdown_status.is_none() {
            self.notify_shutdown(status.clone());
        }
        let ids: Vec<u32> = self.streams.keys().copied().collect();
        for id in ids {
            if let Some(mut entry) = self.streams.remove(&id) {
                entry.listener.on_close(status.clone(), Metadata::new());
            }
        }
        self.update_in_use();
        if let Some(ping) = self.ping.take() {
            for callback in ping.callbacks {
                callback(Err(status.clone()));
            }
        }
        self.notify_terminated();
    }
}
