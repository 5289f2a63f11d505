//! Completion routing.
//!
//! One finished, failed, lost, or cancelled transfer goes in; exactly one of
//! {retry re-queue, terminal callback, silent release} comes out. The user
//! callback is always invoked with the engine mutex dropped.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::engine::EngineShared;
use crate::error::{classify_curl_code, ErrorKind};
use crate::event::Event;
use crate::metrics;
use crate::pool::HandleSlot;
use crate::response::{Response, Status};

/// Route the result of one transfer. `result` is the libcurl outcome, or a
/// synthetic code for forced completions (connect failures, lost handles);
/// cancellation is decided by the slot flag, not the result.
pub(crate) fn complete_transfer(
    shared: &Arc<EngineShared>,
    slot_index: usize,
    result: Result<(), curl::Error>,
) {
    let mut inner = shared.lock_inner();
    if slot_index >= inner.pool.len() || !inner.pool.slot(slot_index).in_use {
        warn!(slot = slot_index, "completion for unknown transfer");
        return;
    }

    let id = inner.pool.slot(slot_index).id;

    if inner.pool.slot(slot_index).cancelled.load(Ordering::Relaxed) {
        let callback = inner.pool.slot_mut(slot_index).callback.take();
        inner.pool.release(slot_index);
        drop(inner);
        metrics::REQUESTS_CANCELLED.increment();
        if let Some(callback) = callback {
            metrics::REQUESTS_COMPLETED.increment();
            callback(Response::new(
                id,
                Status::Failed(ErrorKind::Cancelled),
                "Cancelled",
            ));
        }
        return;
    }

    let Some(callback) = inner.pool.slot_mut(slot_index).callback.take() else {
        debug!(id, "transfer completed without callback");
        inner.pool.release(slot_index);
        return;
    };

    let url = effective_url(inner.pool.slot_mut(slot_index));
    let (status, error) = derive_outcome(inner.pool.slot_mut(slot_index), &result);

    // Failures the server might not repeat consume a retry before they
    // surface.
    if retry_eligible(status) {
        let slot = inner.pool.slot_mut(slot_index);
        if !slot.cancelled.load(Ordering::Relaxed) && slot.retry_count < slot.max_retries {
            slot.retry_count += 1;
            slot.callback = Some(callback);
            if let Some(easy) = slot.easy.as_mut() {
                easy.get_mut().reset_progress();
            }
            debug!(id, url = %url, ?status, error = %error, "retrying transfer");
            metrics::REQUESTS_RETRIED.increment();
            shared.enqueue_locked(&mut inner, Event::Send { slot: slot_index, id });
            return;
        }
    }

    if shared.config.collect_statistics {
        log_statistics(inner.pool.slot_mut(slot_index));
    }
    debug!(id, url = %url, ?status, error = %error, "transfer completed");

    let response = Response::new(id, status, error);
    inner.pool.release(slot_index);
    drop(inner);
    metrics::REQUESTS_COMPLETED.increment();
    callback(response);
}

fn effective_url(slot: &mut HandleSlot) -> String {
    slot.easy
        .as_mut()
        .and_then(|easy| easy.effective_url().ok())
        .flatten()
        .unwrap_or_default()
        .to_string()
}

/// Derive the terminal status and description from the transfer result.
fn derive_outcome(slot: &mut HandleSlot, result: &Result<(), curl::Error>) -> (Status, String) {
    match result {
        Ok(()) => http_outcome(slot, true),
        Err(error) if error.code() == curl_sys::CURLE_HTTP_RETURNED_ERROR => {
            http_outcome(slot, false)
        }
        Err(error) => {
            let mut kind = classify_curl_code(error.code());
            // Some peers drop connections near the deadline instead of
            // timing out cleanly; libcurl reports a partial file. Surface
            // those as timeouts so callers can retry.
            if error.code() == curl_sys::CURLE_PARTIAL_FILE {
                if let Some(easy) = slot.easy.as_mut() {
                    if let Ok(total) = easy.total_time() {
                        if total >= slot.transfer_timeout {
                            kind = ErrorKind::Timeout;
                        }
                    }
                }
            }
            // The transfer library fills its error buffer behind the
            // scenes and hands the content back on the error itself; prefer
            // that detail over the generic text for the code.
            let text = error
                .extra_description()
                .filter(|text| !text.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| error.description().to_string());
            (Status::Failed(kind), text)
        }
    }
}

fn http_outcome(slot: &mut HandleSlot, transfer_ok: bool) -> (Status, String) {
    let offset = slot
        .easy
        .as_ref()
        .map(|easy| easy.get_ref().offset())
        .unwrap_or(0);
    let mut code = slot
        .easy
        .as_mut()
        .and_then(|easy| easy.response_code().ok())
        .unwrap_or(0) as u16;
    // A ranged response consumed from its beginning is a plain success.
    if offset == 0 && code == 206 {
        code = 200;
    }
    // No status line at all (e.g. a file transfer) still counts as success.
    if code == 0 && transfer_ok {
        code = 200;
    }
    (Status::Http(code), http_reason(code).to_string())
}

/// HTTP statuses below 200 or at/above 500 are worth another attempt;
/// low-level failures and everything in between are not.
fn retry_eligible(status: Status) -> bool {
    match status {
        Status::Http(code) => code != 0 && (code < 200 || code >= 500),
        Status::Failed(_) => false,
    }
}

fn log_statistics(slot: &mut HandleSlot) {
    let Some(easy) = slot.easy.as_mut() else {
        return;
    };
    debug!(
        id = slot.id,
        retries = slot.retry_count,
        total = ?easy.total_time().unwrap_or_default(),
        namelookup = ?easy.namelookup_time().unwrap_or_default(),
        connect = ?easy.connect_time().unwrap_or_default(),
        pretransfer = ?easy.pretransfer_time().unwrap_or_default(),
        starttransfer = ?easy.starttransfer_time().unwrap_or_default(),
        redirect = ?easy.redirect_time().unwrap_or_default(),
        "transfer statistics"
    );
}

/// Canonical reason phrase for an HTTP status code.
fn http_reason(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        203 => "Non-Authoritative Information",
        204 => "No Content",
        205 => "Reset Content",
        206 => "Partial Content",
        300 => "Multiple Choices",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        305 => "Use Proxy",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        402 => "Payment Required",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        412 => "Precondition Failed",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        416 => "Range Not Satisfiable",
        417 => "Expectation Failed",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::{Duration, Instant};

    fn bare_slot() -> HandleSlot {
        HandleSlot {
            index: 0,
            in_use: true,
            id: 1,
            cancelled: Arc::new(AtomicBool::new(false)),
            retry_count: 0,
            max_retries: 3,
            transfer_timeout: Duration::from_secs(30),
            send_time: Instant::now(),
            callback: None,
            easy: None,
        }
    }

    #[test]
    fn retry_covers_informational_and_server_errors_only() {
        assert!(retry_eligible(Status::Http(100)));
        assert!(retry_eligible(Status::Http(199)));
        assert!(retry_eligible(Status::Http(500)));
        assert!(retry_eligible(Status::Http(503)));
        assert!(!retry_eligible(Status::Http(0)));
        assert!(!retry_eligible(Status::Http(200)));
        assert!(!retry_eligible(Status::Http(404)));
        assert!(!retry_eligible(Status::Http(499)));
        assert!(!retry_eligible(Status::Failed(ErrorKind::Timeout)));
        assert!(!retry_eligible(Status::Failed(ErrorKind::Io)));
    }

    #[test]
    fn reason_phrases() {
        assert_eq!(http_reason(200), "OK");
        assert_eq!(http_reason(206), "Partial Content");
        assert_eq!(http_reason(404), "Not Found");
        assert_eq!(http_reason(500), "Internal Server Error");
        assert_eq!(http_reason(999), "Unknown");
    }

    #[test]
    fn successful_transfer_without_native_handle_normalizes_to_200() {
        // A handle lost to a failed attach still completes; with no native
        // handle to query, a clean result reads as a status-less success.
        let mut slot = bare_slot();
        let (status, error) = derive_outcome(&mut slot, &Ok(()));
        assert_eq!(status, Status::Http(200));
        assert_eq!(error, "OK");
    }

    #[test]
    fn low_level_failure_maps_through_taxonomy() {
        let mut slot = bare_slot();
        let result = Err(curl::Error::new(curl_sys::CURLE_OPERATION_TIMEDOUT));
        let (status, error) = derive_outcome(&mut slot, &result);
        assert_eq!(status, Status::Failed(ErrorKind::Timeout));
        assert!(!error.is_empty());

        let result = Err(curl::Error::new(curl_sys::CURLE_COULDNT_CONNECT));
        let (status, _) = derive_outcome(&mut slot, &result);
        assert_eq!(status, Status::Failed(ErrorKind::Io));

        let result = Err(curl::Error::new(curl_sys::CURLE_COULDNT_RESOLVE_HOST));
        let (status, _) = derive_outcome(&mut slot, &result);
        assert_eq!(status, Status::Failed(ErrorKind::InvalidUrl));
    }
}
