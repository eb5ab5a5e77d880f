use std::{
    future::Future,
    io,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::{
    fs::File,
    io::{AsyncRead, AsyncSeek, ReadBuf},
    sync::watch,
};

/// Upper bound on how many bytes a single read pulls from the file.
const READ_CHUNK: usize = 64 * 1024;

/// Readable, seekable view over a file that is still being written.
///
/// The writer publishes its progress through a watch channel carrying the
/// number of bytes flushed to disk so far; reads are clamped to that
/// counter, so a reader can never observe bytes the writer has not written
/// yet. A read that would start at or past the counter suspends until the
/// writer publishes more bytes, reaches the declared size, or goes away
/// (which surfaces as an [`io::ErrorKind::UnexpectedEof`] error).
///
/// Relies on the counter being monotone non-decreasing and on the
/// underlying file ending only after `size` bytes.
pub struct PartialFileReader {
    file: File,
    size: u64,
    pos: u64,
    written: watch::Receiver<u64>,
    wait: Option<Pin<Box<dyn Future<Output = u64> + Send>>>,
    pending_pos: Option<u64>,
    scratch: Vec<u8>,
}

impl PartialFileReader {
    pub fn new(file: File, size: u64, written: watch::Receiver<u64>) -> Self {
        PartialFileReader {
            file,
            size,
            pos: 0,
            written,
            wait: None,
            pending_pos: None,
            scratch: Vec::new(),
        }
    }

    /// Declared total size of the file once the download completes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Wait until the counter moves past `pos` (or the channel closes),
    /// then report the latest published value.
    fn wait_for_progress(&self, pos: u64) -> Pin<Box<dyn Future<Output = u64> + Send>> {
        let mut written = self.written.clone();
        let size = self.size;
        Box::pin(async move {
            let outcome = written.wait_for(|count| *count > pos || *count >= size).await.map(|count| *count);
            match outcome {
                Ok(count) => count,
                Err(_) => *written.borrow(),
            }
        })
    }
}

impl AsyncRead for PartialFileReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if let Some(wait) = this.wait.as_mut() {
                match wait.as_mut().poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(_) => this.wait = None,
                }
            }

            if this.pos >= this.size {
                return Poll::Ready(Ok(()));
            }

            let written = (*this.written.borrow()).min(this.size);
            if written <= this.pos {
                if this.written.has_changed().is_err() {
                    // The writer is gone and the file will never be complete.
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "download ended before the file was complete",
                    )));
                }
                this.wait = Some(this.wait_for_progress(this.pos));
                continue;
            }

            let available = written - this.pos;
            let want = available.min(buf.remaining() as u64).min(READ_CHUNK as u64) as usize;
            if this.scratch.len() < want {
                this.scratch.resize(want, 0);
            }
            let mut chunk = ReadBuf::new(&mut this.scratch[..want]);
            return match Pin::new(&mut this.file).poll_read(cx, &mut chunk) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(Err(error)) => Poll::Ready(Err(error)),
                Poll::Ready(Ok(())) => {
                    let filled = chunk.filled();
                    this.pos += filled.len() as u64;
                    buf.put_slice(filled);
                    Poll::Ready(Ok(()))
                }
            };
        }
    }
}

impl AsyncSeek for PartialFileReader {
    fn start_seek(self: Pin<&mut Self>, position: io::SeekFrom) -> io::Result<()> {
        let this = self.get_mut();
        let target = match position {
            io::SeekFrom::Start(offset) => offset as i128,
            io::SeekFrom::Current(delta) => this.pos as i128 + delta as i128,
            io::SeekFrom::End(delta) => this.size as i128 + delta as i128,
        };
        if target < 0 || target > this.size as i128 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek outside the declared file size",
            ));
        }
        this.wait = None;
        this.pending_pos = Some(target as u64);
        Pin::new(&mut this.file).start_seek(io::SeekFrom::Start(target as u64))
    }

    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        let this = self.get_mut();
        match Pin::new(&mut this.file).poll_complete(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(error)) => Poll::Ready(Err(error)),
            Poll::Ready(Ok(_)) => {
                if let Some(pos) = this.pending_pos.take() {
                    this.pos = pos;
                }
                Poll::Ready(Ok(this.pos))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::SeekFrom;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

    async fn reader_over(
        content: &[u8],
        size: u64,
        published: u64,
    ) -> (PartialFileReader, watch::Sender<u64>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.part");
        let mut file = File::create(&path).await.unwrap();
        file.write_all(content).await.unwrap();
        file.flush().await.unwrap();

        let (sender, receiver) = watch::channel(published);
        let reader = PartialFileReader::new(File::open(&path).await.unwrap(), size, receiver);
        (reader, sender, dir)
    }

    #[tokio::test]
    async fn reads_are_clamped_to_the_published_counter() {
        let (mut reader, sender, _dir) = reader_over(b"hello", 5, 3).await;

        let mut buf = [0u8; 16];
        let read = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..read], b"hel");

        sender.send_replace(5);
        let read = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..read], b"lo");

        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn read_suspends_until_the_writer_publishes() {
        let (mut reader, sender, _dir) = reader_over(b"abcdef", 6, 0).await;

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            sender.send_replace(6);
        });

        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"abcdef");
    }

    #[tokio::test]
    async fn vanished_writer_surfaces_as_unexpected_eof() {
        let (mut reader, sender, _dir) = reader_over(b"abc", 10, 3).await;

        let mut buf = [0u8; 16];
        let read = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..read], b"abc");

        drop(sender);
        let error = reader.read(&mut buf).await.unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn seek_stays_within_the_declared_size() {
        let (mut reader, _sender, _dir) = reader_over(b"0123456789", 10, 10).await;

        reader.seek(SeekFrom::Start(4)).await.unwrap();
        let mut buf = [0u8; 3];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"456");

        reader.seek(SeekFrom::Current(-5)).await.unwrap();
        let mut buf = [0u8; 2];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"23");

        let error = reader.seek(SeekFrom::Start(11)).await.unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::InvalidInput);
        let error = reader.seek(SeekFrom::Current(-100)).await.unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn seek_past_the_written_part_waits_for_the_writer() {
        let (mut reader, sender, _dir) = reader_over(b"0123456789", 10, 2).await;

        reader.seek(SeekFrom::Start(6)).await.unwrap();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            sender.send_replace(10);
        });

        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"6789");
    }
}
