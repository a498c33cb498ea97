//! The server-side HTTP/2 transport handler.
//!
//! Mirrors the client handler: one event-loop task per accepted connection
//! owns all HTTP/2 state, commands arrive on a write queue, and new streams
//! are validated and announced to the transport listener before any of their
//! DATA is processed.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use braid_core::http2::flow::{LocalWindow, OutboundFlow};
use braid_core::http2::{
    AnyHttp2Codec, HeaderBlock, Http2Codec, Http2ErrorCode, Http2Frame, DEFAULT_WINDOW_SIZE,
};
use braid_core::{frame_message, Deframed, MessageDeframer, Metadata, Status, DEFAULT_MAX_MESSAGE_SIZE};

use super::{
    headers_to_metadata, is_grpc_content_type, response_headers, response_trailers, ServerStream,
    ServerStreamListener, ServerTransport, ServerTransportListener, HTTP_METHOD_POST, TE_TRAILERS,
};

/// Construction-time settings for one server connection.
pub struct ServerTransportConfig {
    pub max_message_size: usize,
    pub max_concurrent_streams: Option<u32>,
}

impl Default for ServerTransportConfig {
    fn default() -> ServerTransportConfig {
        ServerTransportConfig {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_concurrent_streams: None,
        }
    }
}

struct StreamShared {
    id: u32,
    listener: Mutex<Option<Box<dyn ServerStreamListener>>>,
}

impl StreamShared {
    fn with_listener(&self, f: impl FnOnce(&mut dyn ServerStreamListener)) {
        if let Some(listener) = self.listener.lock().as_mut() {
            f(listener.as_mut());
        }
    }
}

enum Command {
    SendHeaders {
        shared: Arc<StreamShared>,
        metadata: Metadata,
    },
    SendFrame {
        shared: Arc<StreamShared>,
        data: Bytes,
    },
    SendTrailers {
        shared: Arc<StreamShared>,
        status: Status,
        trailers: Metadata,
    },
    CancelStream {
        shared: Arc<StreamShared>,
        status: Status,
    },
    RequestMessages {
        shared: Arc<StreamShared>,
        count: u32,
    },
    Shutdown,
    ForcefulClose {
        status: Status,
    },
}

struct Http2ServerStream {
    shared: Arc<StreamShared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl ServerStream for Http2ServerStream {
    fn set_listener(&self, listener: Box<dyn ServerStreamListener>) {
        *self.shared.listener.lock() = Some(listener);
    }

    fn send_headers(&self, headers: Metadata) {
        let _ = self.commands.send(Command::SendHeaders {
            shared: self.shared.clone(),
            metadata: headers,
        });
    }

    fn send_message(&self, message: Bytes) {
        let _ = self.commands.send(Command::SendFrame {
            shared: self.shared.clone(),
            data: frame_message(&message, false),
        });
    }

    fn close(&self, status: Status, trailers: Metadata) {
        let _ = self.commands.send(Command::SendTrailers {
            shared: self.shared.clone(),
            status,
            trailers,
        });
    }

    fn cancel(&self, status: Status) {
        let _ = self.commands.send(Command::CancelStream {
            shared: self.shared.clone(),
            status,
        });
    }

    fn request(&self, count: u32) {
        let _ = self.commands.send(Command::RequestMessages {
            shared: self.shared.clone(),
            count,
        });
    }
}

struct StartArgs {
    codec: AnyHttp2Codec,
    config: ServerTransportConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    command_sender: mpsc::UnboundedSender<Command>,
    runtime: tokio::runtime::Handle,
}

/// A server transport over one accepted HTTP/2 connection.
pub struct Http2ServerTransport {
    commands: mpsc::UnboundedSender<Command>,
    start_args: Mutex<Option<StartArgs>>,
}

impl Http2ServerTransport {
    pub fn new(
        codec: impl Http2Codec,
        config: ServerTransportConfig,
    ) -> Arc<Http2ServerTransport> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Http2ServerTransport {
            commands: tx.clone(),
            start_args: Mutex::new(Some(StartArgs {
                codec: AnyHttp2Codec::new(codec),
                config,
                commands: rx,
                command_sender: tx,
                runtime: tokio::runtime::Handle::current(),
            })),
        })
    }

    /// Starts the connection's event loop; stream announcements go to
    /// `listener`.
    pub fn start(&self, listener: Box<dyn ServerTransportListener>) {
        let args = self
            .start_args
            .lock()
            .take()
            .expect("transport started twice");
        let runtime = args.runtime.clone();
        runtime.spawn(async move {
            ServerLoop::new(args, listener).run().await;
        });
    }
}

impl ServerTransport for Http2ServerTransport {
    fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    fn shutdown_now(&self, status: Status) {
        let _ = self.commands.send(Command::ForcefulClose { status });
    }
}

struct StreamEntry {
    shared: Arc<StreamShared>,
    deframer: MessageDeframer,
    window: LocalWindow,
    headers_sent: bool,
    half_closed_delivered: bool,
}

struct ServerLoop {
    codec: AnyHttp2Codec,
    commands: mpsc::UnboundedReceiver<Command>,
    command_sender: mpsc::UnboundedSender<Command>,
    listener: Box<dyn ServerTransportListener>,
    config: ServerTransportConfig,
    streams: HashMap<u32, StreamEntry>,
    last_accepted_id: u32,
    accepting: bool,
    goaway_sent: bool,
    te_warning_logged: bool,
    close_when_drained: bool,
    closing: bool,
    terminated_notified: bool,
    outbound: OutboundFlow,
    connection_window: LocalWindow,
}

impl ServerLoop {
    fn new(args: StartArgs, listener: Box<dyn ServerTransportListener>) -> ServerLoop {
        ServerLoop {
            codec: args.codec,
            commands: args.commands,
            command_sender: args.command_sender,
            listener,
            config: args.config,
            streams: HashMap::new(),
            last_accepted_id: 0,
            accepting: true,
            goaway_sent: false,
            te_warning_logged: false,
            close_when_drained: false,
            closing: false,
            terminated_notified: false,
            outbound: OutboundFlow::new(DEFAULT_WINDOW_SIZE),
            connection_window: LocalWindow::default(),
        }
    }

    async fn run(mut self) {
        self.write(Http2Frame::Settings {
            ack: false,
            initial_window_size: Some(DEFAULT_WINDOW_SIZE),
            max_concurrent_streams: self.config.max_concurrent_streams,
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
                    self.closing = true;
                }
                Step::Frame(Ok(Some(frame))) => self.handle_frame(frame).await,
                Step::Frame(Ok(None)) => {
                    tracing::debug!("connection closed by client");
                    self.closing = true;
                }
                Step::Frame(Err(error)) => {
                    tracing::debug!(%error, "connection error");
                    self.closing = true;
                }
            }
        }
        self.finalize();
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::SendHeaders { shared, metadata } => {
                let id = shared.id;
                let Some(entry) = self.streams.get_mut(&id) else {
                    return;
                };
                if entry.headers_sent {
                    return;
                }
                entry.headers_sent = true;
                self.write(Http2Frame::Headers {
                    stream_id: id,
                    headers: response_headers(&metadata),
                    end_stream: false,
                })
                .await;
            }
            Command::SendFrame { shared, data } => {
                let id = shared.id;
                if !self.streams.contains_key(&id) {
                    return;
                }
                self.outbound.queue(id, data, false);
                self.flush_outbound().await;
            }
            Command::SendTrailers {
                shared,
                status,
                trailers,
            } => {
                let id = shared.id;
                let Some(entry) = self.streams.get_mut(&id) else {
                    return;
                };
                let first_block = !entry.headers_sent;
                // Pending DATA must reach the wire before the trailers.
                self.flush_outbound().await;
                let block = response_trailers(&status, &trailers, first_block);
                self.write(Http2Frame::Headers {
                    stream_id: id,
                    headers: block,
                    end_stream: true,
                })
                .await;
                // The frame is flushed: the stream is complete.
                self.complete_stream(id);
            }
            Command::CancelStream { shared, status } => {
                let id = shared.id;
                if let Some(entry) = self.streams.remove(&id) {
                    entry.shared.with_listener(|l| l.closed(status.clone()));
                    self.outbound.close_stream(id);
                    self.write(Http2Frame::RstStream {
                        stream_id: id,
                        error_code: Http2ErrorCode::Cancel.code(),
                    })
                    .await;
                    self.maybe_close_when_drained();
                }
            }
            Command::RequestMessages { shared, count } => {
                let id = shared.id;
                if let Some(entry) = self.streams.get_mut(&id) {
                    entry.deframer.request(count);
                    self.pump_stream(id).await;
                }
            }
            Command::Shutdown => {
                if !self.goaway_sent {
                    self.goaway_sent = true;
                    self.accepting = false;
                    self.write(Http2Frame::GoAway {
                        last_stream_id: self.last_accepted_id,
                        error_code: Http2ErrorCode::NoError.code(),
                        debug_data: Bytes::new(),
                    })
                    .await;
                }
                self.close_when_drained = true;
                self.maybe_close_when_drained();
            }
            Command::ForcefulClose { status } => {
                let ids: Vec<u32> = self.streams.keys().copied().collect();
                for id in ids {
                    if let Some(entry) = self.streams.remove(&id) {
                        entry.shared.with_listener(|l| l.closed(status.clone()));
                        self.write(Http2Frame::RstStream {
                            stream_id: id,
                            error_code: Http2ErrorCode::Cancel.code(),
                        })
                        .await;
                    }
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
            Http2Frame::Ping { ack: true, .. } => {}
            Http2Frame::Headers {
                stream_id,
                headers,
                end_stream,
            } => {
                self.handle_request_headers(stream_id, headers, end_stream)
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
            Http2Frame::RstStream { stream_id, .. } => {
                // Report cancellation; write nothing back.
                if let Some(entry) = self.streams.remove(&stream_id) {
                    entry
                        .shared
                        .with_listener(|l| l.closed(Status::cancelled("stream reset by client")));
                    self.outbound.close_stream(stream_id);
                    self.maybe_close_when_drained();
                }
            }
            Http2Frame::GoAway { .. } => {
                // The client is going away; in-flight streams still finish.
                tracing::debug!("received GOAWAY from client");
            }
        }
    }

    async fn handle_request_headers(
        &mut self,
        stream_id: u32,
        block: HeaderBlock,
        end_stream: bool,
    ) {
        if self.streams.contains_key(&stream_id) {
            // Clients do not send trailers; a second HEADERS block is a
            // protocol violation for this stream.
            if let Some(entry) = self.streams.remove(&stream_id) {
                entry
                    .shared
                    .with_listener(|l| l.closed(Status::internal("unexpected trailers from client")));
            }
            self.write(Http2Frame::RstStream {
                stream_id,
                error_code: Http2ErrorCode::ProtocolError.code(),
            })
            .await;
            return;
        }
        if !self.accepting {
            self.refuse_stream(stream_id).await;
            return;
        }

        if !self.te_warning_logged && block.get_str("te") != Some(TE_TRAILERS) {
            tracing::warn!(
                te = ?block.get_str("te"),
                "expected header te: trailers; an intermediate proxy may not support trailers"
            );
            self.te_warning_logged = true;
        }

        if block.get_str(":method") != Some(HTTP_METHOD_POST) {
            tracing::debug!(method = ?block.get_str(":method"), "refusing non-POST stream");
            self.refuse_stream(stream_id).await;
            return;
        }
        let content_type_ok = block
            .get_str("content-type")
            .map(is_grpc_content_type)
            .unwrap_or(false);
        if !content_type_ok {
            tracing::debug!(
                content_type = ?block.get_str("content-type"),
                "refusing stream with unsupported content-type"
            );
            self.refuse_stream(stream_id).await;
            return;
        }
        let method = match block.get_str(":path") {
            Some(path) if path.starts_with('/') && path.len() > 1 => path[1..].to_string(),
            other => {
                tracing::debug!(path = ?other, "refusing stream with malformed path");
                self.refuse_stream(stream_id).await;
                return;
            }
        };

        self.last_accepted_id = self.last_accepted_id.max(stream_id);
        let shared = Arc::new(StreamShared {
            id: stream_id,
            listener: Mutex::new(None),
        });
        let stream = Arc::new(Http2ServerStream {
            shared: shared.clone(),
            commands: self.stream_command_sender(),
        });
        self.outbound.open_stream(stream_id);
        self.streams.insert(
            stream_id,
            StreamEntry {
                shared,
                deframer: MessageDeframer::new(self.config.max_message_size),
                window: LocalWindow::default(),
                headers_sent: false,
                half_closed_delivered: false,
            },
        );
        let metadata = headers_to_metadata(&block);
        self.listener.stream_created(stream, method, metadata);
        if end_stream {
            if let Some(entry) = self.streams.get_mut(&stream_id) {
                entry.deframer.feed(Bytes::new(), true);
            }
            self.pump_stream(stream_id).await;
        }
    }

    async fn refuse_stream(&mut self, stream_id: u32) {
        self.write(Http2Frame::RstStream {
            stream_id,
            error_code: Http2ErrorCode::RefusedStream.code(),
        })
        .await;
    }

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
                        entry.shared.with_listener(|l| l.on_message(payload));
                    }
                }
                Out::EndOfStream => {
                    if let Some(entry) = self.streams.get_mut(&stream_id) {
                        if !entry.half_closed_delivered {
                            entry.half_closed_delivered = true;
                            entry.shared.with_listener(|l| l.half_closed());
                        }
                    }
                    return;
                }
                Out::Error(status) => {
                    tracing::debug!(stream_id, %status, "stream deframing failed");
                    if let Some(entry) = self.streams.remove(&stream_id) {
                        entry.shared.with_listener(|l| l.closed(status.clone()));
                    }
                    self.outbound.close_stream(stream_id);
                    self.write(Http2Frame::RstStream {
                        stream_id,
                        error_code: Http2ErrorCode::InternalError.code(),
                    })
                    .await;
                    self.maybe_close_when_drained();
                    return;
                }
                Out::Blocked => return,
            }
        }
    }

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

    /// The response (trailers included) has been flushed; `closed(OK)` fires
    /// exactly once.
    fn complete_stream(&mut self, stream_id: u32) {
        if let Some(entry) = self.streams.remove(&stream_id) {
            entry.shared.with_listener(|l| l.closed(Status::ok()));
        }
        self.outbound.close_stream(stream_id);
        self.maybe_close_when_drained();
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
            self.closing = true;
        }
    }

    fn stream_command_sender(&self) -> mpsc::UnboundedSender<Command> {
        self.command_sender.clone()
    }

    fn maybe_close_when_drained(&mut self) {
        if self.close_when_drained && self.streams.is_empty() {
            self.closing = true;
        }
    }

    fn finalize(&mut self) {
        let status = Status::unavailable("connection terminated for unknown reason");
        let ids: Vec<u32> = self.streams.keys().copied().collect();
        for id in ids {
            if let Some(entry) = self.streams.remove(&id) {
                entry.shared.with_listener(|l| l.closed(status.clone()));
            }
        }
        if !self.terminated_notified {
            self.terminated_notified = true;
            self.listener.transport_terminated();
        }
    }
}
