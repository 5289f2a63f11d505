use std::io;

use thiserror::Error;

/// Errors returned by engine construction and lifecycle operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Wake pipe creation or worker thread spawn failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Invalid engine configuration.
    #[error("configuration: {0}")]
    Config(String),
}

/// Failure classes reported for rejected submissions and failed transfers.
///
/// A terminal [`Response`](crate::Response) carries either an HTTP status or
/// one of these kinds; [`Engine::send`](crate::Engine::send) reports the
/// synchronous rejection kinds (`Offline`, `Overload`, `Io`) directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorKind {
    /// Transport-level failure (connect, read, write, protocol).
    #[error("input/output error")]
    Io,
    /// The remote or an intermediary denied access.
    #[error("authorization failed")]
    Authorization,
    /// The peer could not be authenticated (CA verification).
    #[error("authentication failed")]
    Authentication,
    /// The URL could not be parsed or its host resolved.
    #[error("invalid URL")]
    InvalidUrl,
    /// The transfer exceeded its deadline.
    #[error("operation timed out")]
    Timeout,
    /// All transfer handles are busy.
    #[error("too many requests in flight")]
    Overload,
    /// The engine is not running.
    #[error("network is offline")]
    Offline,
    /// The submission was cancelled before completion.
    #[error("cancelled")]
    Cancelled,
    /// Anything the other kinds do not cover.
    #[error("unknown error")]
    Unknown,
}

/// Classify a libcurl transfer result code into the engine's taxonomy.
///
/// Codes not singled out below all collapse to [`ErrorKind::Io`]; the HTTP
/// status path never reaches this mapping.
pub(crate) fn classify_curl_code(code: curl_sys::CURLcode) -> ErrorKind {
    match code {
        curl_sys::CURLE_REMOTE_ACCESS_DENIED
        | curl_sys::CURLE_SSL_CERTPROBLEM
        | curl_sys::CURLE_SSL_CIPHER
        | curl_sys::CURLE_LOGIN_DENIED => ErrorKind::Authorization,
        curl_sys::CURLE_SSL_CACERT => ErrorKind::Authentication,
        curl_sys::CURLE_UNSUPPORTED_PROTOCOL
        | curl_sys::CURLE_URL_MALFORMAT
        | curl_sys::CURLE_COULDNT_RESOLVE_HOST => ErrorKind::InvalidUrl,
        curl_sys::CURLE_OPERATION_TIMEDOUT => ErrorKind::Timeout,
        _ => ErrorKind::Io,
    }
}
