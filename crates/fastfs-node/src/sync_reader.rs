use std::io::Cursor;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, ReadBuf};

/// Adapts an in-memory, already-fully-buffered body into `AsyncRead` so it
/// can be fed to [`fastfs_pipeline::ReverseAggregator::read_from`] without
/// that type needing a second, buffer-specific code path. Reads never
/// actually block (the data is already resident), so polling it directly
/// from `poll_read` is safe.
pub struct BufferedReader(Cursor<Bytes>);

impl BufferedReader {
    pub fn new(data: Bytes) -> Self {
        Self(Cursor::new(data))
    }
}

impl AsyncRead for BufferedReader {
    fn poll_read(mut self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        use std::io::Read;
        let n = self.0.read(buf.initialize_unfilled())?;
        buf.advance(n);
        Poll::Ready(Ok(()))
    }
}
