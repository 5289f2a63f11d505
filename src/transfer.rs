//! Per-request configuration of the native transfer handle and the sink
//! callbacks libcurl drives while a transfer is in flight.
//!
//! The sink trampolines run on the worker thread under no lock. They reach
//! back to the engine only through a weak reference (a dying engine makes
//! them discard) and a shared cancellation flag; everything else they touch
//! is owned by the handle itself.

use std::io::{Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use curl::easy::{Easy2, Handler, InfoType, List, ProxyType as CurlProxyType, WriteError};
use tracing::{trace, warn};

use crate::config::Config;
use crate::engine::EngineShared;
use crate::metrics;
use crate::request::{ProxyType, Request, Verb};
use crate::response::{DataCallback, HeaderCallback, Payload, RequestId};

/// Apply one request to a (previously reset) easy handle.
///
/// Every option is set anew on each submission, so a handle coming back
/// from `reset()` or from a different request carries nothing over.
pub(crate) fn configure(
    easy: &mut Easy2<TransferSink>,
    request: &Request,
    config: &Config,
) -> Result<(), curl::Error> {
    let settings = request.settings();

    easy.verbose(config.verbose)?;
    easy.signal(false)?;
    easy.url(request.url())?;

    match request.verb() {
        Verb::Get => easy.get(true)?,
        Verb::Head => easy.nobody(true)?,
        Verb::Post => easy.post(true)?,
        Verb::Put => easy.custom_request("PUT")?,
        Verb::Patch => easy.custom_request("PATCH")?,
        Verb::Delete => easy.custom_request("DELETE")?,
    }

    if !matches!(request.verb(), Verb::Get | Verb::Head) {
        match request.body() {
            Some(body) if !body.is_empty() => {
                easy.post_field_size(body.len() as u64)?;
                easy.post_fields_copy(body)?;
            }
            // Some servers insist on a zero Content-Length even when there
            // is no body at all.
            _ => easy.post_field_size(0)?,
        }
    }

    if !request.headers().is_empty() {
        let mut list = List::new();
        for (name, value) in request.headers() {
            list.append(&format!("{name}: {value}"))?;
        }
        easy.http_headers(list)?;
    }

    let proxy = &settings.proxy;
    if proxy.proxy_type != ProxyType::None {
        easy.proxy(&proxy.hostname)?;
        easy.proxy_port(proxy.port)?;
        if proxy.proxy_type != ProxyType::Http {
            easy.proxy_type(curl_proxy_type(proxy.proxy_type))?;
        }
        // Both fields are expected to be empty or filled together.
        if !proxy.username.is_empty() && !proxy.password.is_empty() {
            easy.proxy_username(&proxy.username)?;
            easy.proxy_password(&proxy.password)?;
        }
    }

    if config.verify_certificates {
        easy.ssl_verify_peer(true)?;
        easy.ssl_verify_host(true)?;
        if let Some(bundle) = crate::ca::discover_ca_bundle(config.ca_bundle.as_deref()) {
            easy.cainfo(&bundle)?;
        }
    } else {
        easy.ssl_verify_peer(false)?;
        easy.ssl_verify_host(false)?;
    }

    easy.follow_location(true)?;
    easy.fail_on_error(false)?;
    easy.connect_timeout(settings.connect_timeout)?;
    easy.timeout(settings.connect_timeout + settings.transfer_timeout)?;
    easy.accept_encoding("")?;
    easy.transfer_encoding(true)?;
    easy.tcp_keepalive(true)?;
    easy.tcp_keepidle(Duration::from_secs(120))?;
    easy.tcp_keepintvl(Duration::from_secs(60))?;

    Ok(())
}

fn curl_proxy_type(proxy_type: ProxyType) -> CurlProxyType {
    match proxy_type {
        ProxyType::Socks4 => CurlProxyType::Socks4,
        ProxyType::Socks4a => CurlProxyType::Socks4a,
        ProxyType::Socks5 => CurlProxyType::Socks5,
        ProxyType::Socks5Hostname => CurlProxyType::Socks5Hostname,
        ProxyType::None | ProxyType::Http => CurlProxyType::Http,
    }
}

// ── Sink ────────────────────────────────────────────────────────────

/// Per-handle sink: receives body chunks and header lines from libcurl,
/// forwards them to the user callbacks and the payload sink, and captures
/// the cache-relevant response headers.
pub(crate) struct TransferSink {
    engine: Weak<EngineShared>,
    cancelled: Arc<AtomicBool>,
    id: RequestId,
    verbose: bool,
    skip_content: bool,
    ignore_offset: bool,
    /// Parsed from the status line; stands in for querying the response
    /// code mid-transfer.
    http_status: u16,
    /// Any header or body callback has fired for the current submission.
    started: bool,
    /// Bytes delivered so far.
    count: u64,
    /// First-byte offset announced by a Content-Range header.
    offset: u64,
    /// Server reported the requested range lies past the end of the
    /// resource; the body (an error description) is discarded.
    range_out: bool,
    etag: String,
    content_type: String,
    date: String,
    max_age: i64,
    expires: i64,
    payload: Option<Box<dyn Payload>>,
    header_callback: Option<HeaderCallback>,
    data_callback: Option<DataCallback>,
}

impl TransferSink {
    pub(crate) fn new(engine: Weak<EngineShared>, cancelled: Arc<AtomicBool>) -> Self {
        TransferSink {
            engine,
            cancelled,
            id: 0,
            verbose: false,
            skip_content: false,
            ignore_offset: false,
            http_status: 0,
            started: false,
            count: 0,
            offset: 0,
            range_out: false,
            etag: String::new(),
            content_type: String::new(),
            date: String::new(),
            max_age: -1,
            expires: -1,
            payload: None,
            header_callback: None,
            data_callback: None,
        }
    }

    /// Arm the sink for one submission.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn begin_request(
        &mut self,
        id: RequestId,
        verbose: bool,
        skip_content: bool,
        ignore_offset: bool,
        payload: Option<Box<dyn Payload>>,
        header_callback: Option<HeaderCallback>,
        data_callback: Option<DataCallback>,
    ) {
        self.id = id;
        self.verbose = verbose;
        self.skip_content = skip_content;
        self.ignore_offset = ignore_offset;
        self.http_status = 0;
        self.started = false;
        self.count = 0;
        self.offset = 0;
        self.range_out = false;
        self.etag.clear();
        self.content_type.clear();
        self.date.clear();
        self.max_age = -1;
        self.expires = -1;
        self.payload = payload;
        self.header_callback = header_callback;
        self.data_callback = data_callback;
    }

    /// Drop everything a submission handed in. Called while releasing the
    /// slot, before `in_use` is cleared.
    pub(crate) fn clear_request(&mut self) {
        self.payload = None;
        self.header_callback = None;
        self.data_callback = None;
        self.etag.clear();
        self.content_type.clear();
        self.date.clear();
    }

    /// Rewind the byte counter for a retry attempt. Header captures and
    /// the activity flag deliberately survive.
    pub(crate) fn reset_progress(&mut self) {
        self.count = 0;
    }

    pub(crate) fn offset(&self) -> u64 {
        self.offset
    }

    pub(crate) fn has_activity(&self) -> bool {
        self.started
    }
}

impl Handler for TransferSink {
    fn write(&mut self, data: &[u8]) -> Result<usize, WriteError> {
        let len = data.len();
        trace!(id = self.id, len, "received body chunk");

        let Some(engine) = self.engine.upgrade() else {
            return Ok(len);
        };
        self.started = true;

        // Error bodies are dropped on request.
        if self.skip_content && !matches!(self.http_status, 0 | 200 | 201 | 206) {
            return Ok(len);
        }
        if !engine.is_started() || self.range_out || self.cancelled.load(Ordering::Relaxed) {
            return Ok(len);
        }

        if let Some(callback) = self.data_callback.as_mut() {
            callback(self.offset + self.count, data);
        }
        if let Some(payload) = self.payload.as_mut() {
            if !self.ignore_offset {
                let aligned = matches!(payload.stream_position(), Ok(pos) if pos == self.count);
                if !aligned {
                    if let Err(error) = payload.seek(SeekFrom::Start(self.count)) {
                        warn!(id = self.id, %error, "payload seek failed");
                    }
                }
            }
            if let Err(error) = payload.write_all(data) {
                warn!(id = self.id, %error, "payload write failed");
            }
        }
        self.count += len as u64;
        metrics::BYTES_RECEIVED.add(len as u64);

        if self.verbose && self.http_status >= 400 {
            trace!(
                id = self.id,
                status = self.http_status,
                body = %String::from_utf8_lossy(data),
                "error response content"
            );
        }

        Ok(len)
    }

    fn header(&mut self, data: &[u8]) -> bool {
        let Some(engine) = self.engine.upgrade() else {
            return true;
        };
        self.started = true;
        if !engine.is_started() || self.cancelled.load(Ordering::Relaxed) {
            return true;
        }

        let line = String::from_utf8_lossy(data);
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return true;
        }

        // A redirect chain replays the status line; the last one wins.
        if let Some(code) = parse_status_line(line) {
            self.http_status = code;
            return true;
        }

        let Some((name, value)) = split_header_line(line) else {
            return true;
        };
        if let Some(callback) = self.header_callback.as_mut() {
            callback(name, value);
        }

        if name.eq_ignore_ascii_case("date") {
            self.date = value.to_string();
        } else if name.eq_ignore_ascii_case("cache-control") {
            if let Some(max_age) = parse_max_age(value) {
                self.max_age = max_age;
            }
        } else if name.eq_ignore_ascii_case("expires") {
            self.expires = parse_expires(value);
        } else if name.eq_ignore_ascii_case("etag") {
            self.etag = value.to_string();
        } else if name.eq_ignore_ascii_case("content-type") {
            self.content_type = value.to_string();
        } else if name.eq_ignore_ascii_case("content-range") {
            match parse_content_range(value) {
                ContentRange::OutOfRange => self.range_out = true,
                ContentRange::StartOffset(offset) => self.offset = offset,
                ContentRange::Invalid => {
                    warn!(id = self.id, header = line, "invalid Content-Range header");
                }
            }
        }
        true
    }

    fn debug(&mut self, kind: InfoType, data: &[u8]) {
        if !self.verbose {
            return;
        }
        match kind {
            InfoType::Text | InfoType::HeaderIn | InfoType::HeaderOut => {
                trace!(
                    target: "tidepool::protocol",
                    id = self.id,
                    "{}",
                    String::from_utf8_lossy(data).trim_end()
                );
            }
            _ => {}
        }
    }
}

// ── Header line parsing ─────────────────────────────────────────────

/// Split a `Name: Value` header line. Lines without the two-character
/// separator, or with nothing after it, yield `None`.
fn split_header_line(line: &str) -> Option<(&str, &str)> {
    let (name, value) = line.split_once(": ")?;
    if value.is_empty() {
        return None;
    }
    Some((name, value))
}

/// Extract the status code from an `HTTP/x.y NNN reason` line.
fn parse_status_line(line: &str) -> Option<u16> {
    let rest = line.strip_prefix("HTTP/")?;
    let code = rest.split_whitespace().nth(1)?;
    code.parse().ok()
}

/// Pull `max-age=N` out of a Cache-Control value, wherever it sits in the
/// directive list.
fn parse_max_age(value: &str) -> Option<i64> {
    let lower = value.to_ascii_lowercase();
    let index = lower.find("max-age=")?;
    let digits: String = value[index + "max-age=".len()..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Expires header: the literals `0` and `-1` pass through, anything else is
/// parsed as an HTTP date into epoch seconds, with `-1` for garbage.
fn parse_expires(value: &str) -> i64 {
    match value {
        "0" => 0,
        "-1" => -1,
        other => chrono::DateTime::parse_from_rfc2822(other)
            .map(|date| date.timestamp())
            .unwrap_or(-1),
    }
}

#[derive(Debug, PartialEq, Eq)]
enum ContentRange {
    /// `bytes N-M/T`: the first-byte offset is N.
    StartOffset(u64),
    /// `bytes */T`: the requested range lies past the end of the resource.
    OutOfRange,
    Invalid,
}

fn parse_content_range(value: &str) -> ContentRange {
    let Some(prefix) = value.get(..6) else {
        return ContentRange::Invalid;
    };
    if !prefix.eq_ignore_ascii_case("bytes ") {
        return ContentRange::Invalid;
    }
    let rest = &value[6..];
    if rest.starts_with("*/") {
        return ContentRange::OutOfRange;
    }
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return ContentRange::Invalid;
    }
    match digits.parse() {
        Ok(offset) => ContentRange::StartOffset(offset),
        Err(_) => ContentRange::Invalid,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::Mutex;

    use crate::config::Config;
    use crate::engine::WorkerState;

    fn started_engine() -> Arc<EngineShared> {
        let shared = EngineShared::new(Config::default());
        shared.store_state(WorkerState::Started);
        shared
    }

    fn armed_sink(engine: &Arc<EngineShared>) -> TransferSink {
        let mut sink = TransferSink::new(
            Arc::downgrade(engine),
            Arc::new(AtomicBool::new(false)),
        );
        sink.begin_request(
            7,
            false,
            false,
            false,
            Some(Box::new(Cursor::new(Vec::new()))),
            None,
            None,
        );
        sink
    }

    // ── Line parsing ────────────────────────────────────────────────

    #[test]
    fn header_line_splitting() {
        assert_eq!(split_header_line("ETag: \"abc\""), Some(("ETag", "\"abc\"")));
        assert_eq!(split_header_line("NoSeparator"), None);
        assert_eq!(split_header_line("Colon:but-no-space"), None);
        assert_eq!(split_header_line("Empty: "), None);
    }

    #[test]
    fn status_lines() {
        assert_eq!(parse_status_line("HTTP/1.1 200 OK"), Some(200));
        assert_eq!(parse_status_line("HTTP/2 404 Not Found"), Some(404));
        assert_eq!(parse_status_line("HTTP/1.0 301"), Some(301));
        assert_eq!(parse_status_line("ETag: x"), None);
    }

    #[test]
    fn max_age_directive() {
        assert_eq!(parse_max_age("max-age=3600"), Some(3600));
        assert_eq!(parse_max_age("public, max-age=60, immutable"), Some(60));
        assert_eq!(parse_max_age("Max-Age=120"), Some(120));
        assert_eq!(parse_max_age("no-cache"), None);
        assert_eq!(parse_max_age("max-age=garbage"), None);
    }

    #[test]
    fn expires_values() {
        assert_eq!(parse_expires("0"), 0);
        assert_eq!(parse_expires("-1"), -1);
        assert_eq!(parse_expires("Thu, 01 Jan 1970 00:01:00 GMT"), 60);
        assert_eq!(parse_expires("not a date"), -1);
    }

    #[test]
    fn content_range_forms() {
        assert_eq!(
            parse_content_range("bytes 21010-47021/47022"),
            ContentRange::StartOffset(21010)
        );
        assert_eq!(parse_content_range("bytes 0-4/5"), ContentRange::StartOffset(0));
        assert_eq!(parse_content_range("bytes */47022"), ContentRange::OutOfRange);
        assert_eq!(parse_content_range("bytes x-y/z"), ContentRange::Invalid);
        assert_eq!(parse_content_range("items 0-4/5"), ContentRange::Invalid);
        assert_eq!(parse_content_range("b"), ContentRange::Invalid);
    }

    // ── Sink behavior ───────────────────────────────────────────────

    #[test]
    fn header_captures_last_occurrence() {
        let engine = started_engine();
        let mut sink = armed_sink(&engine);

        assert!(sink.header(b"HTTP/1.1 200 OK\r\n"));
        assert!(sink.header(b"Date: Mon, 01 Jan 2024 00:00:00 GMT\r\n"));
        assert!(sink.header(b"ETag: \"v1\"\r\n"));
        assert!(sink.header(b"ETag: \"v2\"\r\n"));
        assert!(sink.header(b"Content-Type: text/plain\r\n"));
        assert!(sink.header(b"Cache-Control: public, max-age=300\r\n"));
        assert!(sink.header(b"Expires: 0\r\n"));

        assert_eq!(sink.http_status, 200);
        assert_eq!(sink.date, "Mon, 01 Jan 2024 00:00:00 GMT");
        assert_eq!(sink.etag, "\"v2\"");
        assert_eq!(sink.content_type, "text/plain");
        assert_eq!(sink.max_age, 300);
        assert_eq!(sink.expires, 0);
        assert!(sink.has_activity());
    }

    #[test]
    fn header_callback_sees_every_header_once() {
        let engine = started_engine();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_callback = seen.clone();

        let mut sink = TransferSink::new(
            Arc::downgrade(&engine),
            Arc::new(AtomicBool::new(false)),
        );
        sink.begin_request(
            1,
            false,
            false,
            false,
            None,
            Some(Box::new(move |name: &str, value: &str| {
                seen_in_callback
                    .lock()
                    .unwrap()
                    .push((name.to_string(), value.to_string()));
            })),
            None,
        );

        sink.header(b"HTTP/1.1 200 OK\r\n");
        sink.header(b"X-One: 1\r\n");
        sink.header(b"X-Two: 2\r\n");
        sink.header(b"\r\n");

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                ("X-One".to_string(), "1".to_string()),
                ("X-Two".to_string(), "2".to_string()),
            ]
        );
    }

    #[test]
    fn write_appends_and_counts() {
        let engine = started_engine();
        let mut sink = armed_sink(&engine);

        assert_eq!(sink.write(b"hello").unwrap(), 5);
        assert_eq!(sink.write(b" world").unwrap(), 6);
        assert_eq!(sink.count, 11);

        let payload = sink.payload.take().unwrap();
        // Round-trip through the trait object is not possible; the cursor
        // position reflects what reached the sink.
        assert_eq!(
            {
                let mut p = payload;
                p.stream_position().unwrap()
            },
            11
        );
    }

    #[test]
    fn write_realigns_cursor_to_count() {
        let engine = started_engine();
        let mut sink = armed_sink(&engine);

        sink.write(b"abcde").unwrap();
        // Something moved the cursor; the next chunk must land at count.
        sink.payload.as_mut().unwrap().seek(SeekFrom::Start(0)).unwrap();
        sink.write(b"fgh").unwrap();

        assert_eq!(sink.count, 8);
        assert_eq!(sink.payload.as_mut().unwrap().stream_position().unwrap(), 8);
    }

    #[test]
    fn data_callback_gets_running_offsets() {
        let engine = started_engine();
        let offsets = Arc::new(Mutex::new(Vec::new()));
        let offsets_in_callback = offsets.clone();

        let mut sink = TransferSink::new(
            Arc::downgrade(&engine),
            Arc::new(AtomicBool::new(false)),
        );
        sink.begin_request(
            1,
            false,
            false,
            false,
            None,
            None,
            Some(Box::new(move |offset: u64, chunk: &[u8]| {
                offsets_in_callback.lock().unwrap().push((offset, chunk.len()));
            })),
        );

        sink.write(b"aaaa").unwrap();
        sink.write(b"bb").unwrap();

        assert_eq!(*offsets.lock().unwrap(), vec![(0, 4), (4, 2)]);
    }

    #[test]
    fn data_callback_offset_includes_range_start() {
        let engine = started_engine();
        let offsets = Arc::new(Mutex::new(Vec::new()));
        let offsets_in_callback = offsets.clone();

        let mut sink = TransferSink::new(
            Arc::downgrade(&engine),
            Arc::new(AtomicBool::new(false)),
        );
        sink.begin_request(
            1,
            false,
            false,
            false,
            None,
            None,
            Some(Box::new(move |offset: u64, _: &[u8]| {
                offsets_in_callback.lock().unwrap().push(offset);
            })),
        );

        sink.header(b"HTTP/1.1 206 Partial Content\r\n");
        sink.header(b"Content-Range: bytes 100-104/200\r\n");
        sink.write(b"abc").unwrap();

        assert_eq!(sink.offset(), 100);
        assert_eq!(*offsets.lock().unwrap(), vec![100]);
    }

    #[test]
    fn out_of_range_response_discards_body() {
        let engine = started_engine();
        let mut sink = armed_sink(&engine);

        sink.header(b"HTTP/1.1 206 Partial Content\r\n");
        sink.header(b"Content-Range: bytes */100\r\n");
        assert!(sink.range_out);

        assert_eq!(sink.write(b"range error body").unwrap(), 16);
        assert_eq!(sink.count, 0);
        assert_eq!(sink.payload.as_mut().unwrap().stream_position().unwrap(), 0);
    }

    #[test]
    fn cancelled_flag_discards_writes_and_headers() {
        let engine = started_engine();
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut sink = TransferSink::new(Arc::downgrade(&engine), cancelled.clone());
        sink.begin_request(
            1,
            false,
            false,
            false,
            Some(Box::new(Cursor::new(Vec::new()))),
            None,
            None,
        );

        cancelled.store(true, Ordering::Relaxed);
        assert_eq!(sink.write(b"dropped").unwrap(), 7);
        assert_eq!(sink.count, 0);
        sink.header(b"ETag: \"x\"\r\n");
        assert!(sink.etag.is_empty());
    }

    #[test]
    fn stopped_engine_discards_writes() {
        let engine = EngineShared::new(Config::default());
        let mut sink = armed_sink(&engine);
        assert_eq!(sink.write(b"dropped").unwrap(), 7);
        assert_eq!(sink.count, 0);
    }

    #[test]
    fn skip_content_filters_error_bodies() {
        let engine = started_engine();
        let mut sink = TransferSink::new(
            Arc::downgrade(&engine),
            Arc::new(AtomicBool::new(false)),
        );
        sink.begin_request(
            1,
            false,
            true,
            false,
            Some(Box::new(Cursor::new(Vec::new()))),
            None,
            None,
        );

        sink.header(b"HTTP/1.1 404 Not Found\r\n");
        assert_eq!(sink.write(b"not found body").unwrap(), 14);
        assert_eq!(sink.count, 0);

        sink.header(b"HTTP/1.1 200 OK\r\n");
        assert_eq!(sink.write(b"ok").unwrap(), 2);
        assert_eq!(sink.count, 2);
    }

    #[test]
    fn dead_engine_discards() {
        let engine = started_engine();
        let mut sink = armed_sink(&engine);
        drop(engine);
        assert_eq!(sink.write(b"late").unwrap(), 4);
        assert_eq!(sink.count, 0);
        assert!(!sink.has_activity());
    }

    #[test]
    fn retry_rewinds_count_but_keeps_activity() {
        let engine = started_engine();
        let mut sink = armed_sink(&engine);
        sink.write(b"partial").unwrap();
        assert!(sink.has_activity());
        sink.reset_progress();
        assert_eq!(sink.count, 0);
        assert!(sink.has_activity());
    }
}
