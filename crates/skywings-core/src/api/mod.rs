//! REST API client module for the SkyWings booking services.
//!
//! This module provides the `ApiClient` through which every flight, booking,
//! payment and notification call is made. The client attaches bearer tokens,
//! refreshes them transparently, waits out rate limits, retries transient
//! failures of idempotent calls and classifies everything else into
//! `ApiError`.

pub mod client;
pub mod error;
pub mod request;
pub mod retry;
pub mod transport;

pub use client::ApiClient;
pub use error::{ApiError, ErrorPayload, FieldError};
pub use request::RequestDescriptor;
pub use retry::Backoff;
pub use transport::{HttpResponse, PreparedRequest, ReqwestTransport, Transport, TransportError};
