//! Guest trace buffer source
//!
//! A hypervisor exposes trace buffers collected inside a guest on a local
//! subscriber socket. Each buffer is preceded by its length as a
//! native-endian `usize` and is relayed whole as one trace frame, so a buffer
//! larger than the MTU ends the stream.

use std::collections::VecDeque;
use std::path::Path;

use crossbeam_channel::Sender;
use futures::stream::StreamExt;
use tokio::io::AsyncRead;
use tokio::net::UnixStream;
use tokio::sync::watch;
use tokio_util::codec::{FramedRead, LengthDelimitedCodec};
use tracing::{debug, info};

use crate::relay::error::{RelayError, RelayResult};
use crate::relay::source::{Frame, FrameSource};

/// Length-prefixed buffers read from a guest socket
#[derive(Debug)]
pub struct GuestSource<T> {
    reader: FramedRead<T, LengthDelimitedCodec>,
    ready: VecDeque<Frame>,
    buffers: u64,
}

impl GuestSource<UnixStream> {
    /// Connect to the subscriber socket at `path`
    pub async fn connect(path: &Path, max_buffer: usize) -> RelayResult<Self> {
        let stream = UnixStream::connect(path).await.map_err(|e| {
            RelayError::Io(std::io::Error::new(
                e.kind(),
                format!("{}: {}", path.display(), e),
            ))
        })?;
        info!(socket = %path.display(), "Connected to guest buffer socket");
        Ok(Self::new(stream, max_buffer))
    }
}

impl<T: AsyncRead + Unpin> GuestSource<T> {
    pub fn new(io: T, max_buffer: usize) -> Self {
        let codec = LengthDelimitedCodec::builder()
            .native_endian()
            .length_field_length(std::mem::size_of::<usize>())
            .max_frame_length(max_buffer)
            .new_codec();
        Self {
            reader: FramedRead::new(io, codec),
            ready: VecDeque::new(),
            buffers: 0,
        }
    }

    /// Read the next buffer; `false` once the guest closed the socket
    ///
    /// Cancel safe: a partially received buffer stays in the read buffer.
    pub async fn fill(&mut self) -> RelayResult<bool> {
        match self.reader.next().await {
            Some(Ok(buffer)) => {
                self.buffers += 1;
                debug!(len = buffer.len(), "Guest buffer received");
                if !buffer.is_empty() {
                    self.ready.push_back(Frame::trace(buffer.freeze()));
                }
                Ok(true)
            }
            Some(Err(e)) => Err(RelayError::Io(e)),
            None => Ok(false),
        }
    }
}

impl<T> GuestSource<T> {
    /// Buffers received so far, empty ones included
    pub fn buffers(&self) -> u64 {
        self.buffers
    }
}

impl<T> FrameSource for GuestSource<T> {
    fn drain_frames(&mut self) -> Vec<Frame> {
        self.ready.drain(..).collect()
    }
}

/// Forward guest buffers to the publisher until shutdown or end of stream
///
/// Returns the number of buffers received.
pub async fn forward_guest<T: AsyncRead + Unpin>(
    mut source: GuestSource<T>,
    outbound: Sender<Frame>,
    mut shutdown: watch::Receiver<bool>,
) -> RelayResult<u64> {
    while !*shutdown.borrow_and_update() {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            more = source.fill() => {
                if !more? {
                    info!(buffers = source.buffers(), "Guest buffer socket closed");
                    break;
                }
                for frame in source.drain_frames() {
                    outbound
                        .send(frame)
                        .map_err(|_| RelayError::Broker("publisher thread stopped".to_string()))?;
                }
            }
        }
    }
    Ok(source.buffers())
}
