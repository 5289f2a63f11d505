//! Terminal responses, delivery callbacks, and the payload sink contract.

use std::io::{Seek, Write};

use crate::error::ErrorKind;

/// Identifier of one accepted submission, unique until its terminal callback
/// fires.
pub type RequestId = u64;

/// Smallest request id the engine hands out.
pub const REQUEST_ID_MIN: RequestId = 1;
/// Largest request id; the counter wraps back to [`REQUEST_ID_MIN`] past it.
pub const REQUEST_ID_MAX: RequestId = RequestId::MAX;

/// Terminal callback, invoked exactly once per accepted submission.
pub type Callback = Box<dyn FnOnce(Response) + Send + 'static>;

/// Per-header callback: `(name, value)` for every response header line that
/// carries a `": "` separator.
pub type HeaderCallback = Box<dyn FnMut(&str, &str) + Send + 'static>;

/// Streaming body callback: `(offset, chunk)` where `offset` is the absolute
/// position of the chunk within the (possibly ranged) resource.
pub type DataCallback = Box<dyn FnMut(u64, &[u8]) + Send + 'static>;

/// Byte sink the response body is appended to.
///
/// The engine keeps the sink's write cursor aligned with the number of bytes
/// delivered so far, seeking back if an interleaved consumer moved it.
/// `std::io::Cursor<Vec<u8>>` and `std::fs::File` both qualify.
pub trait Payload: Write + Seek + Send {}

impl<T: Write + Seek + Send> Payload for T {}

/// Outcome class of a terminal response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The transfer produced an HTTP response with this status code.
    Http(u16),
    /// The transfer failed before a usable HTTP response was produced.
    Failed(ErrorKind),
}

impl Status {
    /// True for 2xx and 3xx HTTP outcomes.
    pub fn is_successful(&self) -> bool {
        matches!(self, Status::Http(code) if (200..400).contains(code))
    }

    /// The HTTP status code, if the transfer got that far.
    pub fn http_code(&self) -> Option<u16> {
        match self {
            Status::Http(code) => Some(*code),
            Status::Failed(_) => None,
        }
    }
}

/// Terminal result of one submission, delivered through the
/// [`Callback`]. The response body is not carried here; it streams through
/// the [`Payload`] sink and [`DataCallback`] while the transfer runs.
#[derive(Debug)]
pub struct Response {
    request_id: RequestId,
    status: Status,
    error: String,
}

impl Response {
    pub(crate) fn new(request_id: RequestId, status: Status, error: impl Into<String>) -> Self {
        Response {
            request_id,
            status,
            error: error.into(),
        }
    }

    /// Id returned by [`Engine::send`](crate::Engine::send) for this
    /// submission.
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Outcome class.
    pub fn status(&self) -> Status {
        self.status
    }

    /// Human-readable description: the HTTP reason phrase, the transfer
    /// library's error text, or the engine's own diagnosis.
    pub fn error(&self) -> &str {
        &self.error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successful_statuses() {
        assert!(Status::Http(200).is_successful());
        assert!(Status::Http(304).is_successful());
        assert!(!Status::Http(199).is_successful());
        assert!(!Status::Http(404).is_successful());
        assert!(!Status::Failed(ErrorKind::Timeout).is_successful());
    }

    #[test]
    fn http_code_extraction() {
        assert_eq!(Status::Http(206).http_code(), Some(206));
        assert_eq!(Status::Failed(ErrorKind::Io).http_code(), None);
    }
}
