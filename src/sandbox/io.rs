//! Bounded capture of guest output streams.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;

const PUMP_CHUNK_BYTES: usize = 8192;

/// Text captured from a stream, with its truncation flag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedText {
    /// Captured bytes decoded as UTF-8 (lossy).
    pub text: String,
    /// Whether output was dropped because the cap was reached.
    pub truncated: bool,
}

#[derive(Debug, Default)]
struct BufferState {
    data: Vec<u8>,
    truncated: bool,
}

/// A byte sink that never grows past its capacity.
///
/// Clones share the same storage, so a pump task and its owner can both hold it.
#[derive(Clone, Debug)]
pub struct TruncatingBuffer {
    state: Arc<Mutex<BufferState>>,
    max_bytes: usize,
}

impl TruncatingBuffer {
    /// Create an empty buffer holding at most `max_bytes`.
    pub fn new(max_bytes: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(BufferState::default())),
            max_bytes,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append as much of `bytes` as fits.
    ///
    /// Returns `false` once anything had to be dropped; the truncated flag is
    /// sticky until [`take`](Self::take).
    pub fn write_limited(&self, bytes: &[u8]) -> bool {
        let mut state = self.lock();
        let room = self.max_bytes.saturating_sub(state.data.len());
        if bytes.len() > room {
            state.data.extend_from_slice(&bytes[..room]);
            state.truncated = true;
            return false;
        }
        state.data.extend_from_slice(bytes);
        true
    }

    /// Configured capacity.
    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Whether anything has been dropped.
    pub fn is_truncated(&self) -> bool {
        self.lock().truncated
    }

    /// Get the length of captured data.
    pub fn len(&self) -> usize {
        self.lock().data.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get the captured output as a string.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.lock().data).into_owned()
    }

    /// Snapshot the contents without consuming them.
    pub fn snapshot(&self) -> CapturedText {
        let state = self.lock();
        CapturedText {
            text: String::from_utf8_lossy(&state.data).into_owned(),
            truncated: state.truncated,
        }
    }

    /// Drain the contents and reset the truncated flag.
    pub fn take(&self) -> CapturedText {
        let mut state = self.lock();
        let data = std::mem::take(&mut state.data);
        let truncated = std::mem::replace(&mut state.truncated, false);
        CapturedText {
            text: String::from_utf8_lossy(&data).into_owned(),
            truncated,
        }
    }
}

/// What a pump does once its buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpMode {
    /// Exit as soon as the buffer reports truncation.
    StopOnTruncate,
    /// Keep reading and discarding so the writer never blocks on a full pipe.
    Drain,
}

/// Removes every occurrence of a fixed byte sequence from a stream and counts them.
///
/// Bytes that could still begin a fence are held back until the next chunk
/// decides them.
#[derive(Debug)]
struct FenceSplitter {
    fence: &'static [u8],
    held: Vec<u8>,
}

impl FenceSplitter {
    fn new(fence: &'static [u8]) -> Self {
        Self {
            fence,
            held: Vec::with_capacity(fence.len()),
        }
    }

    /// Append the non-fence bytes of `input` to `out`; returns the fences seen.
    fn feed(&mut self, input: &[u8], out: &mut Vec<u8>) -> u64 {
        let mut fences = 0;
        for &byte in input {
            self.held.push(byte);
            loop {
                if self.held == self.fence {
                    self.held.clear();
                    fences += 1;
                    break;
                }
                if self.fence.starts_with(&self.held) {
                    break;
                }
                out.push(self.held.remove(0));
            }
        }
        fences
    }

    /// Bytes still held back at end of stream.
    fn flush(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.held)
    }
}

/// Background task copying a stream into a [`TruncatingBuffer`].
#[derive(Debug)]
pub struct StreamPump {
    handle: JoinHandle<()>,
}

impl StreamPump {
    /// Start pumping `reader` into `buffer`.
    pub fn spawn<R>(reader: R, buffer: TruncatingBuffer, mode: PumpMode) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let handle = tokio::spawn(run_pump(reader, buffer, mode, None));
        Self { handle }
    }

    /// Like [`spawn`](Self::spawn), but strips `fence` from the stream.
    ///
    /// The receiver counts the fences passed; everything written before a
    /// fence is in the buffer by the time the count moves.
    pub fn spawn_fenced<R>(
        reader: R,
        buffer: TruncatingBuffer,
        mode: PumpMode,
        fence: &'static [u8],
    ) -> (Self, watch::Receiver<u64>)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, rx) = watch::channel(0);
        let splitter = FenceSplitter::new(fence);
        let handle = tokio::spawn(run_pump(reader, buffer, mode, Some((splitter, tx))));
        (Self { handle }, rx)
    }

    /// Whether the pump has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait up to `grace` for the pump to reach end of stream, then stop it.
    pub async fn finish(mut self, grace: Duration) {
        if tokio::time::timeout(grace, &mut self.handle).await.is_err() {
            self.handle.abort();
        }
    }

    /// Stop the pump immediately.
    pub fn abort(&self) {
        self.handle.abort();
    }
}

impl Drop for StreamPump {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn run_pump<R>(
    mut reader: R,
    buffer: TruncatingBuffer,
    mode: PumpMode,
    mut fence: Option<(FenceSplitter, watch::Sender<u64>)>,
) where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; PUMP_CHUNK_BYTES];
    let mut passed = Vec::with_capacity(PUMP_CHUNK_BYTES);
    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(error = %e, "stream pump stopped on read error");
                break;
            }
        };

        let (bytes, fences) = match fence.as_mut() {
            Some((splitter, _)) => {
                passed.clear();
                let fences = splitter.feed(&chunk[..n], &mut passed);
                (passed.as_slice(), fences)
            }
            None => (&chunk[..n], 0),
        };
        let fits = buffer.write_limited(bytes);
        if let Some((_, tx)) = fence.as_ref().filter(|_| fences > 0) {
            tx.send_modify(|count| *count += fences);
        }
        if !fits && mode == PumpMode::StopOnTruncate {
            tracing::debug!(cap = buffer.max_bytes(), "stream pump stopped at capacity");
            return;
        }
    }

    if let Some((splitter, _)) = fence.as_mut() {
        buffer.write_limited(&splitter.flush());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_write_within_capacity() {
        let buffer = TruncatingBuffer::new(16);
        assert!(buffer.write_limited(b"hello "));
        assert!(buffer.write_limited(b"world"));
        assert_eq!(buffer.to_string_lossy(), "hello world");
        assert!(!buffer.is_truncated());
    }

    #[test]
    fn test_write_past_capacity_truncates() {
        let buffer = TruncatingBuffer::new(10);
        assert!(!buffer.write_limited(b"abcdefghijklmnop"));
        assert_eq!(buffer.to_string_lossy(), "abcdefghij");
        assert!(buffer.is_truncated());

        // Sticky until taken, and nothing more is accepted.
        assert!(!buffer.write_limited(b"x"));
        assert_eq!(buffer.len(), 10);
    }

    #[test]
    fn test_take_resets() {
        let buffer = TruncatingBuffer::new(4);
        buffer.write_limited(b"123456");
        let captured = buffer.take();
        assert_eq!(captured.text, "1234");
        assert!(captured.truncated);
        assert!(buffer.is_empty());
        assert!(!buffer.is_truncated());
        assert!(buffer.write_limited(b"ok"));
    }

    #[tokio::test]
    async fn test_pump_copies_until_eof() {
        let buffer = TruncatingBuffer::new(1024);
        let pump = StreamPump::spawn(
            Cursor::new(b"line one\nline two\n".to_vec()),
            buffer.clone(),
            PumpMode::StopOnTruncate,
        );
        pump.finish(Duration::from_secs(1)).await;
        assert_eq!(buffer.to_string_lossy(), "line one\nline two\n");
    }

    #[tokio::test]
    async fn test_pump_stops_at_capacity() {
        let buffer = TruncatingBuffer::new(8);
        let data = vec![b'x'; 64 * 1024];
        let pump = StreamPump::spawn(Cursor::new(data), buffer.clone(), PumpMode::StopOnTruncate);
        pump.finish(Duration::from_secs(1)).await;
        assert_eq!(buffer.len(), 8);
        assert!(buffer.is_truncated());
    }

    #[tokio::test]
    async fn test_drain_pump_consumes_everything() {
        let buffer = TruncatingBuffer::new(8);
        let (mut writer, reader) = tokio::io::duplex(64);
        let pump = StreamPump::spawn(reader, buffer.clone(), PumpMode::Drain);

        // Far more than the duplex capacity: only completes if the pump keeps reading.
        tokio::io::AsyncWriteExt::write_all(&mut writer, &vec![b'y'; 4096])
            .await
            .unwrap();
        drop(writer);

        pump.finish(Duration::from_secs(1)).await;
        assert_eq!(buffer.len(), 8);
        assert!(buffer.is_truncated());
    }

    #[test]
    fn test_fence_split_across_chunks() {
        let mut splitter = FenceSplitter::new(b"<END>\n");
        let mut out = Vec::new();
        assert_eq!(splitter.feed(b"trace<E", &mut out), 0);
        assert_eq!(out, b"trace");
        assert_eq!(splitter.feed(b"ND>\nnext<", &mut out), 1);
        assert_eq!(splitter.feed(b"<END>\n", &mut out), 1);
        assert_eq!(out, b"tracenext<");
        assert!(splitter.flush().is_empty());
    }

    #[test]
    fn test_fence_lookalikes_pass_through() {
        let mut splitter = FenceSplitter::new(b"[[END]]\n");
        let mut out = Vec::new();
        assert_eq!(splitter.feed(b"[[[END]]\n[[EN", &mut out), 1);
        assert_eq!(out, b"[");
        assert_eq!(splitter.flush(), b"[[EN");
    }

    #[tokio::test]
    async fn test_fenced_pump_counts_and_strips() {
        let buffer = TruncatingBuffer::new(1024);
        let reader = tokio_test::io::Builder::new()
            .read(b"first error\n<EN")
            .wait(Duration::from_millis(10))
            .read(b"D>\nsecond\n<END>\ntail")
            .build();
        let (pump, mut fences) =
            StreamPump::spawn_fenced(reader, buffer.clone(), PumpMode::Drain, b"<END>\n");

        tokio::time::timeout(Duration::from_secs(1), fences.wait_for(|n| *n >= 2))
            .await
            .unwrap()
            .unwrap();
        pump.finish(Duration::from_secs(1)).await;
        assert_eq!(buffer.to_string_lossy(), "first error\nsecond\ntail");
    }

    #[tokio::test]
    async fn test_fences_counted_past_capacity() {
        let buffer = TruncatingBuffer::new(4);
        let (pump, fences) = StreamPump::spawn_fenced(
            Cursor::new(b"overflowing<END>\nmore<END>\n".to_vec()),
            buffer.clone(),
            PumpMode::Drain,
            b"<END>\n",
        );
        pump.finish(Duration::from_secs(1)).await;
        assert_eq!(*fences.borrow(), 2);
        assert_eq!(buffer.to_string_lossy(), "over");
        assert!(buffer.is_truncated());
    }

    #[tokio::test]
    async fn test_pump_keeps_output_before_read_error() {
        let buffer = TruncatingBuffer::new(1024);
        let reader = tokio_test::io::Builder::new()
            .read(b"partial ")
            .wait(Duration::from_millis(10))
            .read(b"output")
            .read_error(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed"))
            .build();
        let pump = StreamPump::spawn(reader, buffer.clone(), PumpMode::Drain);
        pump.finish(Duration::from_secs(1)).await;
        assert_eq!(buffer.to_string_lossy(), "partial output");
        assert!(!buffer.is_truncated());
    }
}
