//! Streaming multipart upload bodies.
//!
//! [`StreamingUpload`] encodes a file as a single `multipart/form-data` field
//! on a producer thread and exposes the encoded bytes through [`Read`]. The
//! producer and consumer are joined by a bounded [`channel_pipe`], so at most
//! `capacity` chunks of the file are in memory at once and the request can
//! start sending before the file has been read.
//!
//! A producer failure travels down the pipe as an `Err` chunk, so the
//! consumer sees a read error instead of a silently truncated body. The
//! producer's final verdict is also available from [`StreamingUpload::finish`].

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::{HarnessError, HarnessResult};

/// Size of each file read and each chunk sent down the pipe.
pub const UPLOAD_CHUNK_SIZE: usize = 32 * 1024;

/// Chunks the pipe buffers before the producer blocks.
pub const UPLOAD_PIPE_CAPACITY: usize = 4;

/// Form field name the file is sent under.
pub const UPLOAD_FIELD_NAME: &str = "file";

type Chunk = io::Result<Vec<u8>>;

/// Producer half of a [`channel_pipe`].
#[derive(Debug)]
pub struct ChannelPipeWriter {
    tx: Option<SyncSender<Chunk>>,
}

/// Consumer half of a [`channel_pipe`].
#[derive(Debug)]
pub struct ChannelPipeReader {
    rx: Receiver<Chunk>,
    current: Vec<u8>,
    pos: usize,
    failed: bool,
}

/// Bounded in-process byte pipe holding at most `capacity` pending chunks.
///
/// Writes block while the pipe is full. Dropping (or [`ChannelPipeWriter::close`])
/// the writer ends the stream; [`ChannelPipeWriter::fail`] ends it with an error.
pub fn channel_pipe(capacity: usize) -> (ChannelPipeWriter, ChannelPipeReader) {
    let (tx, rx) = mpsc::sync_channel(capacity.max(1));
    (
        ChannelPipeWriter { tx: Some(tx) },
        ChannelPipeReader {
            rx,
            current: Vec::new(),
            pos: 0,
            failed: false,
        },
    )
}

impl ChannelPipeWriter {
    /// Send one chunk. Fails with `BrokenPipe` once the reader is gone.
    pub fn send(&mut self, chunk: Vec<u8>) -> io::Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"))?;
        tx.send(Ok(chunk))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader dropped"))
    }

    /// End the stream with `err`; the reader's next read returns it.
    pub fn fail(&mut self, err: io::Error) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(err));
        }
    }

    pub fn close(&mut self) {
        self.tx.take();
    }
}

impl io::Write for ChannelPipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.send(buf.to_vec())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for ChannelPipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pos == self.current.len() {
            if self.failed {
                return Err(io::Error::other("upload producer failed"));
            }
            match self.rx.recv() {
                Ok(Ok(chunk)) => {
                    self.current = chunk;
                    self.pos = 0;
                }
                Ok(Err(err)) => {
                    self.failed = true;
                    return Err(err);
                }
                // Writer closed cleanly.
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.current.len() - self.pos);
        buf[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// A file being encoded as a multipart body on a background thread.
pub struct StreamingUpload {
    reader: ChannelPipeReader,
    boundary: String,
    file_name: String,
    producer: Option<JoinHandle<HarnessResult<u64>>>,
}

impl StreamingUpload {
    /// Open `path` and start encoding it. Failing to open the file is a setup
    /// failure reported here, before any body bytes exist.
    pub fn new(path: &Path) -> HarnessResult<Self> {
        let file = File::open(path).map_err(|e| {
            HarnessError::Setup(format!("cannot open upload source {}: {e}", path.display()))
        })?;
        Self::from_reader(file, file_name_of(path))
    }

    /// Encode an arbitrary source under `file_name`.
    pub fn from_reader<R: Read + Send + 'static>(
        source: R,
        file_name: impl Into<String>,
    ) -> HarnessResult<Self> {
        let boundary = Uuid::new_v4().simple().to_string();
        let file_name = file_name.into();
        let (writer, reader) = channel_pipe(UPLOAD_PIPE_CAPACITY);

        let header = part_header(&boundary, &file_name);
        let trailer = format!("\r\n--{boundary}--\r\n").into_bytes();
        let producer = thread::Builder::new()
            .name("ctlcheck-upload".to_string())
            .spawn(move || produce(source, writer, header, trailer))?;

        debug!(file = %file_name, %boundary, "Started streaming upload");
        Ok(Self {
            reader,
            boundary,
            file_name,
            producer: Some(producer),
        })
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Value for the request's `Content-Type` header.
    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    /// Completion signal: wait for the producer and return the number of
    /// file bytes it encoded, or the error that stopped it.
    ///
    /// Call after the consumer has finished reading. Any unread body is
    /// discarded first so the producer cannot stay blocked on a full pipe.
    pub fn finish(mut self) -> HarnessResult<u64> {
        let _ = io::copy(&mut self.reader, &mut io::sink());
        self.join_producer()
    }

    fn join_producer(&mut self) -> HarnessResult<u64> {
        let handle = self
            .producer
            .take()
            .ok_or_else(|| HarnessError::UploadFailed("producer already joined".to_string()))?;
        handle.join().unwrap_or_else(|_| {
            Err(HarnessError::UploadFailed(
                "producer thread panicked".to_string(),
            ))
        })
    }
}

impl Read for StreamingUpload {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl std::fmt::Debug for StreamingUpload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingUpload")
            .field("boundary", &self.boundary)
            .field("file_name", &self.file_name)
            .finish_non_exhaustive()
    }
}

fn part_header(boundary: &str, file_name: &str) -> Vec<u8> {
    format!(
        "--{boundary}\r\n\
         Content-Disposition: form-data; name=\"{UPLOAD_FIELD_NAME}\"; filename=\"{}\"\r\n\
         Content-Type: application/octet-stream\r\n\r\n",
        file_name.replace('"', "%22")
    )
    .into_bytes()
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| PathBuf::from(path).display().to_string())
}

fn produce<R: Read>(
    mut source: R,
    mut writer: ChannelPipeWriter,
    header: Vec<u8>,
    trailer: Vec<u8>,
) -> HarnessResult<u64> {
    if let Err(err) = writer.send(header) {
        return Err(HarnessError::UploadFailed(format!("consumer went away: {err}")));
    }

    let mut total = 0u64;
    loop {
        let mut chunk = vec![0u8; UPLOAD_CHUNK_SIZE];
        let n = match source.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!(%err, bytes_sent = total, "Upload source read failed");
                let message = err.to_string();
                writer.fail(err);
                return Err(HarnessError::UploadFailed(format!(
                    "reading source after {total} bytes: {message}"
                )));
            }
        };
        chunk.truncate(n);
        if let Err(err) = writer.send(chunk) {
            return Err(HarnessError::UploadFailed(format!("consumer went away: {err}")));
        }
        total += n as u64;
    }

    if let Err(err) = writer.send(trailer) {
        return Err(HarnessError::UploadFailed(format!("consumer went away: {err}")));
    }
    writer.close();
    debug!(bytes = total, "Streaming upload producer finished");
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    struct FailingSource {
        remaining: usize,
    }

    impl Read for FailingSource {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.remaining == 0 {
                return Err(io::Error::other("disk vanished"));
            }
            let n = buf.len().min(self.remaining);
            buf[..n].fill(b'z');
            self.remaining -= n;
            Ok(n)
        }
    }

    #[test]
    fn test_channel_pipe_preserves_order_and_eof() {
        let (mut writer, mut reader) = channel_pipe(2);
        let producer = thread::spawn(move || {
            writer.write_all(b"abcd").unwrap();
            writer.write_all(b"1234").unwrap();
        });
        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        producer.join().unwrap();
        assert_eq!(out, "abcd1234");
    }

    #[test]
    fn test_channel_pipe_failure_is_read_error() {
        let (mut writer, mut reader) = channel_pipe(2);
        writer.send(b"partial".to_vec()).unwrap();
        writer.fail(io::Error::other("producer broke"));

        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).unwrap_err();
        assert_eq!(err.to_string(), "producer broke");
        assert_eq!(out, b"partial");
        // Stays failed rather than turning into a clean EOF.
        assert!(reader.read(&mut [0u8; 4]).is_err());
    }

    #[test]
    fn test_send_after_reader_dropped() {
        let (mut writer, reader) = channel_pipe(1);
        drop(reader);
        let err = writer.send(b"x".to_vec()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn test_upload_body_is_multipart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::File::create(&path).unwrap().write_all(&data).unwrap();

        let mut upload = StreamingUpload::new(&path).unwrap();
        assert!(upload.content_type().ends_with(upload.boundary()));
        let mut body = Vec::new();
        upload.read_to_end(&mut body).unwrap();

        let header = part_header(upload.boundary(), "payload.bin");
        assert!(body.starts_with(&header));
        let trailer = format!("\r\n--{}--\r\n", upload.boundary());
        assert!(body.ends_with(trailer.as_bytes()));
        assert_eq!(&body[header.len()..body.len() - trailer.len()], &data[..]);
        assert_eq!(upload.finish().unwrap(), data.len() as u64);
    }

    #[test]
    fn test_missing_file_is_setup_failure() {
        let err = StreamingUpload::new(Path::new("/nonexistent/payload.bin")).unwrap_err();
        assert!(err.is_setup_failure());
    }

    #[test]
    fn test_source_error_reaches_consumer_and_completion() {
        let source = FailingSource { remaining: 70_000 };
        let mut upload = StreamingUpload::from_reader(source, "broken.bin").unwrap();
        let mut body = Vec::new();
        let err = upload.read_to_end(&mut body).unwrap_err();
        assert!(err.to_string().contains("disk vanished"));

        let verdict = upload.finish().unwrap_err();
        assert!(matches!(verdict, HarnessError::UploadFailed(_)));
        assert!(verdict.to_string().contains("disk vanished"));
    }

    #[test]
    fn test_producer_is_bounded_by_consumer() {
        let source = io::repeat(b'a').take(10 * 1024 * 1024);
        let mut upload = StreamingUpload::from_reader(source, "big.bin").unwrap();
        let mut first = [0u8; 16];
        upload.read_exact(&mut first).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(100));
        // Producer is parked on the full pipe, not racing through the source.
        assert!(!upload.producer.as_ref().unwrap().is_finished());
        assert_eq!(upload.finish().unwrap(), 10 * 1024 * 1024);
    }
}
