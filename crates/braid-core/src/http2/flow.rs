//! Flow-control accounting shared by the client and server handlers.

use std::collections::{BTreeMap, VecDeque};

use bytes::Bytes;

use super::{DEFAULT_WINDOW_SIZE, MAX_FRAME_SIZE};

/// Fraction of the window that may sit unreturned before a WINDOW_UPDATE is
/// emitted.
const REFILL_RATIO: f64 = 0.5;

/// Inbound credit accounting for one window (a stream, or the connection when
/// used with stream id 0).
#[derive(Debug)]
pub struct LocalWindow {
    limit: u64,
    unreturned: u64,
}

impl LocalWindow {
    pub fn new(limit: u32) -> LocalWindow {
        LocalWindow {
            limit: limit as u64,
            unreturned: 0,
        }
    }

    /// Records application-consumed bytes. Returns the WINDOW_UPDATE
    /// increment to send once the configured fraction of the window is
    /// waiting to be restored.
    pub fn consume(&mut self, bytes: usize) -> Option<u32> {
        self.unreturned += bytes as u64;
        if self.unreturned as f64 >= self.limit as f64 * REFILL_RATIO {
            let increment = self.unreturned.min(u32::MAX as u64) as u32;
            self.unreturned -= increment as u64;
            Some(increment)
        } else {
            None
        }
    }
}

impl Default for LocalWindow {
    fn default() -> LocalWindow {
        LocalWindow::new(DEFAULT_WINDOW_SIZE)
    }
}

#[derive(Debug, Default)]
struct OutboundStream {
    window: i64,
    queue: VecDeque<(Bytes, bool)>,
}

/// Outbound DATA scheduling against the peer's stream and connection windows.
///
/// Data that does not fit is queued; [`OutboundFlow::take_writable`] hands
/// back the chunks that may be written now, fragmented at the frame-size
/// limit. Empty end-of-stream frames bypass the windows, as they carry no
/// flow-controlled bytes.
#[derive(Debug)]
pub struct OutboundFlow {
    connection: i64,
    initial_window: i64,
    streams: BTreeMap<u32, OutboundStream>,
}

impl OutboundFlow {
    pub fn new(initial_window: u32) -> OutboundFlow {
        OutboundFlow {
            connection: initial_window as i64,
            initial_window: initial_window as i64,
            streams: BTreeMap::new(),
        }
    }

    pub fn open_stream(&mut self, stream_id: u32) {
        self.streams.insert(
            stream_id,
            OutboundStream {
                window: self.initial_window,
                queue: VecDeque::new(),
            },
        );
    }

    /// Drops the stream and anything still queued on it.
    pub fn close_stream(&mut self, stream_id: u32) {
        self.streams.remove(&stream_id);
    }

    pub fn queue(&mut self, stream_id: u32, data: Bytes, end_stream: bool) {
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.queue.push_back((data, end_stream));
        }
    }

    /// Applies a WINDOW_UPDATE; stream id 0 addresses the connection window.
    pub fn window_update(&mut self, stream_id: u32, increment: u32) {
        if stream_id == 0 {
            self.connection += increment as i64;
        } else if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.window += increment as i64;
        }
    }

    /// Applies a SETTINGS initial-window-size change: the delta adjusts every
    /// open stream's window, which may drive some negative.
    pub fn set_initial_window(&mut self, new_initial: u32) {
        let delta = new_initial as i64 - self.initial_window;
        self.initial_window = new_initial as i64;
        for stream in self.streams.values_mut() {
            stream.window += delta;
        }
    }

    /// Chunks that may be written now, in stream-id order. Each entry is
    /// `(stream_id, data, end_stream)`.
    pub fn take_writable(&mut self) -> Vec<(u32, Bytes, bool)> {
        let mut out = Vec::new();
        let ids: Vec<u32> = self.streams.keys().copied().collect();
        for id in ids {
            loop {
                let Some(stream) = self.streams.get_mut(&id) else {
                    break;
                };
                let Some((front, _)) = stream.queue.front() else {
                    break;
                };
                if front.is_empty() {
                    let (data, end) = stream.queue.pop_front().expect("front checked");
                    out.push((id, data, end));
                    continue;
                }
                let allowance = stream
                    .window
                    .min(self.connection)
                    .min(MAX_FRAME_SIZE as i64);
                if allowance <= 0 {
                    break;
                }
                let (mut data, end) = stream.queue.pop_front().expect("front checked");
                if data.len() as i64 <= allowance {
                    stream.window -= data.len() as i64;
                    self.connection -= data.len() as i64;
                    out.push((id, data, end));
                } else {
                    let chunk = data.split_to(allowance as usize);
                    stream.window -= allowance;
                    self.connection -= allowance;
                    stream.queue.push_front((data, end));
                    out.push((id, chunk, false));
                }
            }
        }
        out
    }
}

impl Default for OutboundFlow {
    fn default() -> OutboundFlow {
        OutboundFlow::new(DEFAULT_WINDOW_SIZE)
    }
}
