//! The response side of a gateway handler: the [`ResponseWriter`] capability,
//! an in-memory implementation, and the wrapper that counts what is written.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use http::{HeaderMap, Response, StatusCode};

use crate::body::ByteEvent;
use crate::error::CapturedError;

/// A sink for an HTTP response, written incrementally by a handler.
///
/// The status line is committed by the first call to [`write_header`] or, if
/// that never happens, by the first [`write`], which implies `200 OK`.
///
/// [`write_header`]: ResponseWriter::write_header
/// [`write`]: ResponseWriter::write
pub trait ResponseWriter {
    /// The response headers. Changes after the status is committed have no effect.
    fn headers_mut(&mut self) -> &mut HeaderMap;

    /// Commits the status code. Only the first call takes effect.
    fn write_header(&mut self, status: StatusCode);

    /// Writes part of the body, returning how many bytes were accepted.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Sends any buffered data to the client.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Trailers sent after the body, for sinks that support them.
    fn trailers_mut(&mut self) -> Option<&mut HeaderMap> {
        None
    }

    /// Writes the whole of `buf`, retrying on partial writes and interruptions.
    fn write_all(&mut self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            match self.write(buf) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(written) => buf = &buf[written..],
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) => return Err(error),
            }
        }
        Ok(())
    }
}

/// A [`ResponseWriter`] that keeps the whole response in memory.
#[derive(Debug, Default)]
pub struct BufferedResponse {
    status: Option<StatusCode>,
    headers: HeaderMap,
    trailers: HeaderMap,
    body: Vec<u8>,
}

impl BufferedResponse {
    pub fn new() -> Self {
        Self::default()
    }

    /// The committed status, if any.
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn trailers(&self) -> &HeaderMap {
        &self.trailers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Converts into an [`http::Response`]. A response that never committed a
    /// status is a `200 OK`, as it would be on the wire. Trailers are dropped.
    pub fn into_response(self) -> Response<Vec<u8>> {
        let mut response = Response::new(self.body);
        *response.status_mut() = self.status.unwrap_or(StatusCode::OK);
        *response.headers_mut() = self.headers;
        response
    }
}

impl ResponseWriter for BufferedResponse {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn write_header(&mut self, status: StatusCode) {
        if let Some(committed) = self.status {
            tracing::warn!(%committed, ignored = %status, "superfluous write_header call");
            return;
        }
        self.status = Some(status);
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.status.is_none() {
            self.write_header(StatusCode::OK);
        }
        self.body.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn trailers_mut(&mut self) -> Option<&mut HeaderMap> {
        Some(&mut self.trailers)
    }
}

/// What a [`ResponseWrapper`] has observed so far. Shared with the middleware,
/// so it can still be read while a panicking handler unwinds.
#[derive(Debug, Default)]
pub(crate) struct WriteStats {
    // 0 until the status is committed.
    status: AtomicU16,
    written: AtomicU64,
    error: OnceLock<CapturedError>,
}

impl WriteStats {
    /// The committed status, or `200 OK` if the handler never committed one.
    pub fn status_code(&self) -> StatusCode {
        match self.status.load(Ordering::Relaxed) {
            0 => StatusCode::OK,
            code => StatusCode::from_u16(code).unwrap_or(StatusCode::OK),
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    pub fn error(&self) -> Option<&CapturedError> {
        self.error.get()
    }

    fn wrote_header(&self) -> bool {
        self.status.load(Ordering::Relaxed) != 0
    }

    fn commit(&self, status: StatusCode) {
        let _ = self.status.compare_exchange(
            0,
            status.as_u16(),
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }

    fn add(&self, bytes: usize) -> u64 {
        let bytes = bytes as u64;
        self.written.fetch_add(bytes, Ordering::Relaxed) + bytes
    }
}

/// Counts the bytes written through a [`ResponseWriter`], remembers the
/// status code and keeps the first write error.
///
/// Every call is forwarded to the inner writer, including repeated
/// `write_header` calls: the inner writer decides what to do with those.
pub struct ResponseWrapper<'w> {
    inner: &'w mut dyn ResponseWriter,
    stats: Arc<WriteStats>,
    on_write: Option<ByteEvent>,
}

impl<'w> ResponseWrapper<'w> {
    pub fn new(inner: &'w mut dyn ResponseWriter) -> Self {
        Self {
            inner,
            stats: Arc::default(),
            on_write: None,
        }
    }

    pub(crate) fn with_write_event(mut self, on_write: ByteEvent) -> Self {
        self.on_write = Some(on_write);
        self
    }

    pub(crate) fn stats(&self) -> Arc<WriteStats> {
        Arc::clone(&self.stats)
    }

    /// The committed status code, defaulting to `200 OK`.
    pub fn status_code(&self) -> StatusCode {
        self.stats.status_code()
    }

    pub fn bytes_written(&self) -> u64 {
        self.stats.bytes_written()
    }

    pub fn error(&self) -> Option<&CapturedError> {
        self.stats.error()
    }
}

impl ResponseWriter for ResponseWrapper<'_> {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        self.inner.headers_mut()
    }

    fn write_header(&mut self, status: StatusCode) {
        self.stats.commit(status);
        self.inner.write_header(status);
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.stats.wrote_header() {
            self.write_header(StatusCode::OK);
        }
        match self.inner.write(buf) {
            Ok(written) => {
                let total = self.stats.add(written);
                if written > 0 {
                    if let Some(on_write) = &self.on_write {
                        on_write(total);
                    }
                }
                Ok(written)
            }
            Err(error) => {
                CapturedError::record_first(&self.stats.error, &error);
                Err(error)
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }

    fn trailers_mut(&mut self) -> Option<&mut HeaderMap> {
        self.inner.trailers_mut()
    }
}

impl fmt::Debug for ResponseWrapper<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseWrapper")
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use http::header::{HeaderValue, CONTENT_TYPE};

    use super::*;

    /// Accepts at most `capacity` bytes, then fails every write.
    #[derive(Default)]
    struct Bounded {
        inner: BufferedResponse,
        capacity: usize,
        flushes: usize,
    }

    impl ResponseWriter for Bounded {
        fn headers_mut(&mut self) -> &mut HeaderMap {
            self.inner.headers_mut()
        }

        fn write_header(&mut self, status: StatusCode) {
            self.inner.write_header(status);
        }

        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let room = self.capacity - self.inner.body().len();
            if room == 0 {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "client hung up"));
            }
            self.inner.write(&buf[..buf.len().min(room)])
        }

        fn flush(&mut self) -> io::Result<()> {
            self.flushes += 1;
            Ok(())
        }
    }

    #[test]
    fn counts_bytes_across_writes() {
        let mut sink = BufferedResponse::new();
        let mut writer = ResponseWrapper::new(&mut sink);

        for size in [10, 20, 5] {
            writer.write_all(&vec![b'x'; size]).unwrap();
        }

        assert_eq!(writer.bytes_written(), 35);
        assert_eq!(writer.status_code(), StatusCode::OK);
        assert_eq!(sink.body().len(), 35);
        assert_eq!(sink.status(), Some(StatusCode::OK));
    }

    #[test]
    fn first_write_implies_ok() {
        let mut sink = BufferedResponse::new();
        let mut writer = ResponseWrapper::new(&mut sink);

        writer.write_all(b"body").unwrap();
        writer.write_header(StatusCode::NOT_FOUND);

        assert_eq!(writer.status_code(), StatusCode::OK);
        assert_eq!(sink.into_response().status(), StatusCode::OK);
    }

    #[test]
    fn first_status_wins() {
        let mut sink = BufferedResponse::new();
        let mut writer = ResponseWrapper::new(&mut sink);

        writer.write_header(StatusCode::SERVICE_UNAVAILABLE);
        writer.write_header(StatusCode::OK);
        writer.write_all(b"retry later").unwrap();

        assert_eq!(writer.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(sink.status(), Some(StatusCode::SERVICE_UNAVAILABLE));
    }

    #[test]
    fn status_defaults_to_ok_when_nothing_is_written() {
        let mut sink = BufferedResponse::new();
        let writer = ResponseWrapper::new(&mut sink);

        assert_eq!(writer.status_code(), StatusCode::OK);
        assert_eq!(writer.bytes_written(), 0);
    }

    #[test]
    fn headers_pass_through() {
        let mut sink = BufferedResponse::new();
        let mut writer = ResponseWrapper::new(&mut sink);

        writer
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        writer
            .trailers_mut()
            .unwrap()
            .insert("grpc-status", HeaderValue::from_static("0"));

        assert_eq!(sink.headers()[CONTENT_TYPE], "application/json");
        assert_eq!(sink.trailers()["grpc-status"], "0");
    }

    #[test]
    fn keeps_the_first_write_error_and_the_partial_count() {
        let mut sink = Bounded {
            capacity: 8,
            ..Bounded::default()
        };
        let mut writer = ResponseWrapper::new(&mut sink);

        let error = writer.write_all(b"0123456789").unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::BrokenPipe);
        let error = writer.write(b"more").unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::BrokenPipe);

        assert_eq!(writer.bytes_written(), 8);
        let captured = writer.error().unwrap();
        assert_eq!(captured.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(captured.message(), "client hung up");
    }

    #[test]
    fn flush_is_forwarded_without_accounting() {
        let mut sink = Bounded {
            capacity: 64,
            ..Bounded::default()
        };
        let mut writer = ResponseWrapper::new(&mut sink);

        writer.write_all(b"chunk").unwrap();
        writer.flush().unwrap();
        writer.flush().unwrap();

        assert_eq!(writer.bytes_written(), 5);
        assert_eq!(sink.flushes, 2);
    }

    #[test]
    fn write_events_carry_the_running_total() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        let mut sink = BufferedResponse::new();
        let mut writer = ResponseWrapper::new(&mut sink)
            .with_write_event(Box::new(move |total| recorder.lock().unwrap().push(total)));

        writer.write_all(b"abc").unwrap();
        writer.write_all(b"").unwrap();
        writer.write_all(b"defg").unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![3, 7]);
    }
}
