//! Request description and per-call retry bookkeeping

use reqwest::Method;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

/// Whether a 401 may be answered with refresh-and-retry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Refresh and resend once
    #[default]
    Once,
    /// Surface the 401 as a server error
    Never,
}

#[derive(Debug, Clone, Default)]
pub enum Body {
    #[default]
    Empty,
    Json(serde_json::Value),
    /// Opaque payload (e.g. ciphertext) sent with the given content type
    Raw {
        content_type: String,
        data: Vec<u8>,
    },
}

/// How to send a request. Built with the method constructors and refined
/// with the `with_*` / `json` / `raw` builders.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Body,
    pub retry: RetryPolicy,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self::get()
    }
}

impl RequestOptions {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            headers: HeaderMap::new(),
            body: Body::Empty,
            retry: RetryPolicy::Once,
        }
    }

    pub fn get() -> Self {
        Self::new(Method::GET)
    }

    pub fn post() -> Self {
        Self::new(Method::POST)
    }

    pub fn put() -> Self {
        Self::new(Method::PUT)
    }

    pub fn patch() -> Self {
        Self::new(Method::PATCH)
    }

    pub fn delete() -> Self {
        Self::new(Method::DELETE)
    }

    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.body = Body::Json(body);
        self
    }

    pub fn raw(mut self, content_type: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        self.body = Body::Raw {
            content_type: content_type.into(),
            data: data.into(),
        };
        self
    }

    /// Add a header. An `Authorization` header is replaced by the session's
    /// bearer token whenever one is stored.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// One logical call: the request plus whether it has already been resent.
#[derive(Debug)]
pub struct RequestContext {
    pub request_id: String,
    pub endpoint: String,
    pub options: RequestOptions,
    retried: bool,
}

impl RequestContext {
    pub fn new(endpoint: impl Into<String>, options: RequestOptions) -> Self {
        Self {
            request_id: format!("req_{}", uuid::Uuid::new_v4().as_simple()),
            endpoint: endpoint.into(),
            options,
            retried: false,
        }
    }

    pub fn retried(&self) -> bool {
        self.retried
    }

    /// A 401 on this attempt may be refreshed and resent.
    pub fn can_retry(&self) -> bool {
        !self.retried && self.options.retry == RetryPolicy::Once
    }

    /// Record the resend. Returns false if the call was already resent, in
    /// which case nothing changes.
    pub fn mark_retried(&mut self) -> bool {
        if self.retried {
            return false;
        }
        self.retried = true;
        true
    }
}
