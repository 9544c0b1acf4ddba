//! HTTP/1.1 types used by the cache server.
//!
//! Only what the cache layers need: [`Method`] decides whether a request may
//! be cached, [`StatusCode`] covers the responses the crate produces, and
//! [`Headers`], [`Request`] and [`Response`] carry the exchange.

use std::fmt;

pub mod headers;
pub mod request;
pub mod response;

pub use headers::Headers;
pub use request::Request;
pub use response::{Body, BodyStream, Response};

/// Status codes this crate writes or expects handlers to return.
///
/// # Examples
///
/// ```
/// use rttp_cache::http::StatusCode;
///
/// assert_eq!(StatusCode::NotModified.as_u16(), 304);
/// assert_eq!(StatusCode::NotModified.canonical_reason(), "Not Modified");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum StatusCode {
    Ok = 200,
    Accepted = 202,
    NotModified = 304,
    BadRequest = 400,
    NotFound = 404,
    PayloadTooLarge = 413,
    InternalServerError = 500,
}

impl StatusCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Reason phrase written on the status line.
    pub fn canonical_reason(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Accepted => "Accepted",
            Self::NotModified => "Not Modified",
            Self::BadRequest => "Bad Request",
            Self::NotFound => "Not Found",
            Self::PayloadTooLarge => "Payload Too Large",
            Self::InternalServerError => "Internal Server Error",
        }
    }
}

/// A request method.
///
/// Only `GET` responses are cached; everything else is carried verbatim in
/// [`Method::Other`] and always bypasses the file cache.
///
/// # Examples
///
/// ```
/// use rttp_cache::http::Method;
///
/// let get: Method = "GET".parse().unwrap();
/// assert!(get.is_cacheable());
///
/// let post: Method = "POST".parse().unwrap();
/// assert_eq!(post.as_str(), "POST");
/// assert!(!post.is_cacheable());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Other(String),
}

impl Method {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Get => "GET",
            Self::Other(method) => method,
        }
    }

    /// Whether a response to this method may be served from or written to the cache.
    pub fn is_cacheable(&self) -> bool {
        matches!(self, Self::Get)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Method {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "GET" => Self::Get,
            other => Self::Other(other.to_owned()),
        })
    }
}
