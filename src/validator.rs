//! Conditional revalidation of stored responses.

use http::header::{ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use http::{request, StatusCode};

use crate::resource::Resource;

/// Outcome of a conditional revalidation round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Validation {
    /// 304: the stored entry is still authoritative.
    NotModified,
    /// A 2xx reply supersedes the stored entry.
    Superseded,
    /// Upstream failed to revalidate; the stored entry cannot be trusted.
    Failed,
}

/// Copies the client request and attaches the stored validators.
pub(crate) fn conditional_parts(parts: &request::Parts, stored: &Resource) -> request::Parts {
    let mut conditional = parts.clone();
    if let Some(etag) = stored.headers.get(ETAG) {
        conditional.headers.insert(IF_NONE_MATCH, etag.clone());
    }
    if let Some(last_modified) = stored.headers.get(LAST_MODIFIED) {
        conditional.headers.insert(IF_MODIFIED_SINCE, last_modified.clone());
    }
    conditional
}

pub(crate) fn classify(status: StatusCode) -> Validation {
    if status == StatusCode::NOT_MODIFIED {
        Validation::NotModified
    } else if status.is_success() {
        Validation::Superseded
    } else {
        Validation::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::{HeaderMap, Request};
    use std::time::SystemTime;

    fn stored(headers: &[(&str, &str)]) -> Resource {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.insert(
                name.parse::<http::HeaderName>().unwrap(),
                value.parse().unwrap(),
            );
        }
        Resource::new(StatusCode::OK, map, Bytes::from("body"), SystemTime::now())
    }

    #[test]
    fn validators_are_copied_onto_the_request() {
        let parts = Request::get("https://example.com/a")
            .body(())
            .unwrap()
            .into_parts()
            .0;
        let res = stored(&[
            ("etag", "\"v1\""),
            ("last-modified", "Sat, 01 Jan 2022 00:00:00 GMT"),
        ]);
        let conditional = conditional_parts(&parts, &res);
        assert_eq!(conditional.headers[IF_NONE_MATCH], "\"v1\"");
        assert_eq!(
            conditional.headers[IF_MODIFIED_SINCE],
            "Sat, 01 Jan 2022 00:00:00 GMT"
        );
    }

    #[test]
    fn requests_without_validators_stay_unconditional() {
        let parts = Request::get("https://example.com/a")
            .body(())
            .unwrap()
            .into_parts()
            .0;
        let conditional = conditional_parts(&parts, &stored(&[]));
        assert!(!conditional.headers.contains_key(IF_NONE_MATCH));
        assert!(!conditional.headers.contains_key(IF_MODIFIED_SINCE));
    }

    #[test]
    fn classification_follows_status_class() {
        assert_eq!(classify(StatusCode::NOT_MODIFIED), Validation::NotModified);
        assert_eq!(classify(StatusCode::OK), Validation::Superseded);
        assert_eq!(classify(StatusCode::NO_CONTENT), Validation::Superseded);
        assert_eq!(classify(StatusCode::BAD_GATEWAY), Validation::Failed);
        assert_eq!(classify(StatusCode::INTERNAL_SERVER_ERROR), Validation::Failed);
        assert_eq!(classify(StatusCode::NOT_FOUND), Validation::Failed);
    }
}
