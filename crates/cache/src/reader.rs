use crate::PartialFileReader;
use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::{
    fs::File,
    io::{AsyncRead, AsyncSeek, ReadBuf},
};

/// A readable, seekable handle onto a cache entry.
///
/// `Cached` wraps a finished file on disk; `Downloading` is a view onto a
/// download still in flight, which streams bytes as the writer makes
/// progress. Callers that need to wait for the final outcome of an
/// in-flight download use the completion channel they passed to
/// [`DownloadManager::get_file`](crate::DownloadManager::get_file).
pub enum FileReader {
    Cached(File),
    Downloading(PartialFileReader),
}

impl FileReader {
    /// Whether the underlying download is still in flight.
    pub fn is_downloading(&self) -> bool {
        matches!(self, FileReader::Downloading(_))
    }
}

impl AsyncRead for FileReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            FileReader::Cached(file) => Pin::new(file).poll_read(cx, buf),
            FileReader::Downloading(reader) => Pin::new(reader).poll_read(cx, buf),
        }
    }
}

impl AsyncSeek for FileReader {
    fn start_seek(self: Pin<&mut Self>, position: io::SeekFrom) -> io::Result<()> {
        match self.get_mut() {
            FileReader::Cached(file) => Pin::new(file).start_seek(position),
            FileReader::Downloading(reader) => Pin::new(reader).start_seek(position),
        }
    }

    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        match self.get_mut() {
            FileReader::Cached(file) => Pin::new(file).poll_complete(cx),
            FileReader::Downloading(reader) => Pin::new(reader).poll_complete(cx),
        }
    }
}
