//! tidepool — pooled, multiplexed HTTP transfer engine built on libcurl.
//!
//! Producers on any thread submit requests into a bounded pool of reusable
//! transfer handles; one dedicated worker thread drives every in-flight
//! transfer over libcurl's multi interface, streams response data through
//! per-request callbacks, and handles retries, cancellation, timeouts, and
//! idle-handle reclamation.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::io::Cursor;
//! use tidepool::{Config, Engine, Request};
//!
//! fn main() -> Result<(), tidepool::Error> {
//!     let engine = Engine::new(Config::default())?;
//!
//!     let id = engine
//!         .send(
//!             Request::new("http://example.com/data"),
//!             Some(Box::new(Cursor::new(Vec::new()))),
//!             Some(Box::new(|response| {
//!                 println!("{}: {:?}", response.request_id(), response.status());
//!             })),
//!             None,
//!             None,
//!         )
//!         .expect("submission rejected");
//!
//!     println!("submitted request {id}");
//!     // ... the terminal callback fires on the worker thread ...
//!     engine.deinitialize();
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! `Engine::send` claims a pool slot, configures its native handle, and
//! posts a send event; the worker attaches the handle to the multi, pumps
//! I/O for all transfers at once, and routes each completion to a retry, a
//! cancellation, or the terminal callback. A condition variable wakes the
//! worker out of idle waits and a non-blocking self-pipe wakes it out of
//! socket waits, so submissions are picked up promptly either way.
//!
//! Pool slots come in two tiers: the first quarter (at least one) keep
//! their native handle for the engine's lifetime, the rest instantiate one
//! on first use and drop it again after two minutes of idleness.
//!
//! # Threading
//!
//! All callbacks — terminal, header, and data — run on the worker thread
//! with no engine lock held. They may call back into the engine, including
//! `send` and `cancel`; a callback that calls `deinitialize` stops the
//! engine without joining it.

pub(crate) mod ca;
pub mod config;
pub(crate) mod completion;
pub mod engine;
pub mod error;
pub(crate) mod event;
pub mod metrics;
pub(crate) mod pool;
pub mod request;
pub mod response;
pub(crate) mod transfer;
pub(crate) mod worker;

pub use config::{Config, ConfigBuilder};
pub use engine::Engine;
pub use error::{Error, ErrorKind};
pub use request::{ProxySettings, ProxyType, Request, RequestSettings, Verb};
pub use response::{
    Callback, DataCallback, HeaderCallback, Payload, Response, RequestId, Status,
    REQUEST_ID_MAX, REQUEST_ID_MIN,
};
