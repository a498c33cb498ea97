//! A connected in-memory codec pair.
//!
//! Frames written on one side come out of `next_frame` on the other, in
//! order. Dropping either side closes the connection: the peer's reads
//! return `Ok(None)` and its writes fail with [`CodecError::Closed`]. This
//! is the codec used by in-process transports and by the test suites.

use tokio::sync::mpsc;

use super::{CodecError, Http2Codec, Http2Frame};

pub struct MemCodec {
    tx: mpsc::UnboundedSender<Http2Frame>,
    rx: mpsc::UnboundedReceiver<Http2Frame>,
}

/// Two connected codecs.
pub fn codec_pair() -> (MemCodec, MemCodec) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        MemCodec { tx: a_tx, rx: b_rx },
        MemCodec { tx: b_tx, rx: a_rx },
    )
}

impl Http2Codec for MemCodec {
    async fn next_frame(&mut self) -> Result<Option<Http2Frame>, CodecError> {
        Ok(self.rx.recv().await)
    }

    async fn write_frame(&mut self, frame: Http2Frame) -> Result<(), CodecError> {
        self.tx.send(frame).map_err(|_| CodecError::Closed)
    }
}
