//! Request bodies, and the wrapper that counts what a handler reads from them.

use std::fmt;
use std::io::{self, Cursor, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use crate::error::CapturedError;

/// Called with the cumulative byte count after each successful read or write.
pub(crate) type ByteEvent = Box<dyn Fn(u64) + Send + Sync>;

/// An owned request body: either empty, or a stream read on demand.
#[derive(Default)]
pub struct Body(Option<Box<dyn Read + Send>>);

impl Body {
    pub fn empty() -> Self {
        Self(None)
    }

    pub fn from_reader(reader: impl Read + Send + 'static) -> Self {
        Self(Some(Box::new(reader)))
    }

    /// Whether this is the empty sentinel. A reader that happens to yield no
    /// bytes is not empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    /// Reads the rest of the body into memory.
    pub fn read_to_vec(&mut self) -> io::Result<Vec<u8>> {
        let mut buffer = Vec::new();
        self.read_to_end(&mut buffer)?;
        Ok(buffer)
    }
}

impl Read for Body {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.0 {
            Some(reader) => reader.read(buf),
            None => Ok(0),
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            f.write_str("Body(empty)")
        } else {
            f.write_str("Body(stream)")
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Self::from_reader(Cursor::new(bytes))
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Self::from(text.into_bytes())
    }
}

impl From<&'static [u8]> for Body {
    fn from(bytes: &'static [u8]) -> Self {
        Self::from_reader(bytes)
    }
}

impl From<&'static str> for Body {
    fn from(text: &'static str) -> Self {
        Self::from(text.as_bytes())
    }
}

/// What a [`BodyWrapper`] has observed so far. Shared with the middleware,
/// which reads it after the handler has consumed the body.
#[derive(Debug, Default)]
pub(crate) struct ReadStats {
    read: AtomicU64,
    error: OnceLock<CapturedError>,
}

impl ReadStats {
    pub fn bytes_read(&self) -> u64 {
        self.read.load(Ordering::Relaxed)
    }

    pub fn error(&self) -> Option<&CapturedError> {
        self.error.get()
    }

    fn add(&self, bytes: usize) -> u64 {
        let bytes = bytes as u64;
        self.read.fetch_add(bytes, Ordering::Relaxed) + bytes
    }
}

/// Counts the bytes read from a request body and keeps the first error.
///
/// Reads are delegated unchanged: the same byte counts and the same errors
/// reach the caller. Dropping the wrapper drops (closes) the inner body.
pub struct BodyWrapper {
    inner: Body,
    stats: Arc<ReadStats>,
    on_read: Option<ByteEvent>,
}

impl BodyWrapper {
    pub fn new(inner: Body) -> Self {
        Self {
            inner,
            stats: Arc::default(),
            on_read: None,
        }
    }

    pub(crate) fn with_read_event(mut self, on_read: ByteEvent) -> Self {
        self.on_read = Some(on_read);
        self
    }

    pub(crate) fn stats(&self) -> Arc<ReadStats> {
        Arc::clone(&self.stats)
    }

    /// The number of bytes read so far.
    pub fn bytes_read(&self) -> u64 {
        self.stats.bytes_read()
    }

    /// The first error returned by the inner body, if any.
    pub fn error(&self) -> Option<&CapturedError> {
        self.stats.error()
    }

    pub fn into_inner(self) -> Body {
        self.inner
    }
}

impl Read for BodyWrapper {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.inner.read(buf) {
            Ok(bytes) => {
                let total = self.stats.add(bytes);
                if bytes > 0 {
                    if let Some(on_read) = &self.on_read {
                        on_read(total);
                    }
                }
                Ok(bytes)
            }
            Err(error) => {
                CapturedError::record_first(&self.stats.error, &error);
                Err(error)
            }
        }
    }
}

impl fmt::Debug for BodyWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyWrapper")
            .field("inner", &self.inner)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    /// Yields its chunks, then fails with each of its errors in turn.
    struct Scripted {
        chunks: VecDeque<Vec<u8>>,
        errors: VecDeque<io::Error>,
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if let Some(chunk) = self.chunks.pop_front() {
                buf[..chunk.len()].copy_from_slice(&chunk);
                return Ok(chunk.len());
            }
            match self.errors.pop_front() {
                Some(error) => Err(error),
                None => Ok(0),
            }
        }
    }

    #[test]
    fn counts_every_byte_of_a_drained_body() {
        let mut body = BodyWrapper::new(Body::from(vec![7u8; 10_000]));

        let mut drained = Vec::new();
        body.read_to_end(&mut drained).unwrap();

        assert_eq!(drained.len(), 10_000);
        assert_eq!(body.bytes_read(), 10_000);
        assert_eq!(body.error(), None);
    }

    #[test]
    fn end_of_stream_is_not_an_error() {
        let mut body = BodyWrapper::new(Body::from("abc"));
        let mut buffer = [0u8; 8];

        assert_eq!(body.read(&mut buffer).unwrap(), 3);
        assert_eq!(body.read(&mut buffer).unwrap(), 0);
        assert_eq!(body.read(&mut buffer).unwrap(), 0);

        assert_eq!(body.bytes_read(), 3);
        assert!(body.error().is_none());
    }

    #[test]
    fn keeps_the_first_error() {
        let mut body = BodyWrapper::new(Body::from_reader(Scripted {
            chunks: VecDeque::from([b"hello".to_vec()]),
            errors: VecDeque::from([
                io::Error::new(io::ErrorKind::ConnectionReset, "peer went away"),
                io::Error::new(io::ErrorKind::TimedOut, "too slow"),
            ]),
        }));
        let mut buffer = [0u8; 16];

        assert_eq!(body.read(&mut buffer).unwrap(), 5);
        let first = body.read(&mut buffer).unwrap_err();
        let second = body.read(&mut buffer).unwrap_err();

        // The caller sees every error exactly as the inner body produced it.
        assert_eq!(first.kind(), io::ErrorKind::ConnectionReset);
        assert_eq!(second.kind(), io::ErrorKind::TimedOut);

        let captured = body.error().unwrap();
        assert_eq!(captured.kind(), io::ErrorKind::ConnectionReset);
        assert_eq!(captured.to_string(), "peer went away");
        assert_eq!(body.bytes_read(), 5);
    }

    #[test]
    fn interruptions_are_not_recorded() {
        let mut body = BodyWrapper::new(Body::from_reader(Scripted {
            chunks: VecDeque::new(),
            errors: VecDeque::from([io::Error::from(io::ErrorKind::Interrupted)]),
        }));
        let mut buffer = [0u8; 4];

        assert!(body.read(&mut buffer).is_err());
        assert!(body.error().is_none());
    }

    #[test]
    fn read_events_carry_the_running_total() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        let mut body = BodyWrapper::new(Body::from_reader(Scripted {
            chunks: VecDeque::from([vec![1; 4], vec![2; 6]]),
            errors: VecDeque::new(),
        }))
        .with_read_event(Box::new(move |total| recorder.lock().unwrap().push(total)));

        body.read_to_vec_for_test();

        assert_eq!(*seen.lock().unwrap(), vec![4, 10]);
    }

    #[test]
    fn stats_outlive_the_wrapper() {
        let mut body = BodyWrapper::new(Body::from("twelve bytes"));
        let stats = body.stats();

        body.read_to_vec_for_test();
        drop(body);

        assert_eq!(stats.bytes_read(), 12);
    }

    impl BodyWrapper {
        fn read_to_vec_for_test(&mut self) -> Vec<u8> {
            let mut buffer = Vec::new();
            self.read_to_end(&mut buffer).unwrap();
            buffer
        }
    }
}
