//! Conditional request evaluation
//!
//! Pure decision logic, independent of any I/O: given the request method,
//! its validators and the resource metadata (if the resource exists), decide
//! which response to send.

use crate::models::{truncate_to_seconds, ResourceMeta};
use http::{HeaderMap, Method};
use std::time::SystemTime;

/// Validators carried by a request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validators {
    pub if_none_match: Option<String>,
    pub if_modified_since: Option<String>,
}

impl Validators {
    /// Extract validators from request headers
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim().to_string())
        };

        Validators {
            if_none_match: get("if-none-match"),
            if_modified_since: get("if-modified-since"),
        }
    }
}

/// Outcome of evaluating a request against a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// 200 with headers; the body is attached unless the method is HEAD
    Full { send_body: bool },
    /// 304, headers only
    NotModified,
    /// 404
    NotFound,
    /// 405
    MethodNotAllowed,
}

impl Decision {
    pub fn status(&self) -> u16 {
        match self {
            Decision::Full { .. } => 200,
            Decision::NotModified => 304,
            Decision::NotFound => 404,
            Decision::MethodNotAllowed => 405,
        }
    }
}

/// Whether a method is served at all
pub fn is_supported_method(method: &Method) -> bool {
    *method == Method::GET || *method == Method::HEAD
}

/// Decide the response for a request
///
/// Precedence:
/// 1. Anything but GET/HEAD is 405
/// 2. No resource is 404
/// 3. `If-None-Match` equal to the current ETag is 304 (exact match only)
/// 4. Without `If-None-Match`, an `If-Modified-Since` at or after the
///    resource's last modification (second precision) is 304
/// 5. Otherwise 200
///
/// An `If-None-Match` that does not match disables the date check.
/// An unparseable `If-Modified-Since` is ignored.
pub fn evaluate(
    method: &Method,
    validators: &Validators,
    resource: Option<&ResourceMeta>,
) -> Decision {
    if !is_supported_method(method) {
        return Decision::MethodNotAllowed;
    }

    let Some(resource) = resource else {
        return Decision::NotFound;
    };

    if let Some(if_none_match) = &validators.if_none_match {
        return if *if_none_match == resource.etag {
            Decision::NotModified
        } else {
            full(method)
        };
    }

    if let Some(if_modified_since) = &validators.if_modified_since {
        if not_modified_since(if_modified_since, resource.last_modified) {
            return Decision::NotModified;
        }
    }

    full(method)
}

fn full(method: &Method) -> Decision {
    Decision::Full {
        send_body: *method != Method::HEAD,
    }
}

fn not_modified_since(header: &str, last_modified: SystemTime) -> bool {
    match httpdate::parse_http_date(header) {
        Ok(since) => truncate_to_seconds(last_modified) <= since,
        Err(_) => false,
    }
}
