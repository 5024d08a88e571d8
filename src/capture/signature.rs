//! Dedup signatures
//!
//! A signature identifies one logical request across duplicate terminal
//! events and process restarts. The body hash is a cheap 32-bit rolling hash;
//! two different bodies can collide and the second request is then dropped.

use std::fmt;

use crate::models::{PendingRequest, RequestBody};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestSignature(String);

impl RequestSignature {
    pub fn compute(request: &PendingRequest) -> Self {
        Self(format!(
            "{}|{}|{}|{:08x}",
            request.method,
            request.url,
            request.captured_at,
            body_hash(request.body.as_ref())
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `h = h * 31 + byte` over a canonical rendering of the body; 0 when absent
pub fn body_hash(body: Option<&RequestBody>) -> u32 {
    let mut hash = 0u32;
    let mut feed = |bytes: &[u8]| {
        for b in bytes {
            hash = hash.wrapping_mul(31).wrapping_add(u32::from(*b));
        }
    };
    match body {
        None => {}
        Some(RequestBody::Form(fields)) => {
            for field in fields {
                feed(field.name.as_bytes());
                feed(b"=");
                for (i, value) in field.values.iter().enumerate() {
                    if i > 0 {
                        feed(b",");
                    }
                    feed(value.as_bytes());
                }
                feed(b"&");
            }
        }
        Some(RequestBody::Raw(chunks)) => {
            for chunk in chunks {
                feed(chunk);
            }
        }
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FormField;

    fn request(body: Option<RequestBody>) -> PendingRequest {
        PendingRequest {
            request_id: "1".into(),
            method: "POST".into(),
            url: "https://api.example.com/login".into(),
            body,
            captured_at: 1_700_000_000_000,
            tab_id: 2,
            initiator: None,
            request_headers: None,
        }
    }

    #[test]
    fn signature_ignores_request_id() {
        let a = request(None);
        let mut b = a.clone();
        b.request_id = "2".into();
        assert_eq!(RequestSignature::compute(&a), RequestSignature::compute(&b));
        assert_eq!(
            RequestSignature::compute(&a).as_str(),
            "POST|https://api.example.com/login|1700000000000|00000000"
        );
    }

    #[test]
    fn body_and_timestamp_change_the_signature() {
        let plain = request(None);
        let with_body = request(Some(RequestBody::Raw(vec![b"{}".to_vec()])));
        assert_ne!(
            RequestSignature::compute(&plain),
            RequestSignature::compute(&with_body)
        );

        let mut later = plain.clone();
        later.captured_at += 1;
        assert_ne!(
            RequestSignature::compute(&plain),
            RequestSignature::compute(&later)
        );
    }

    #[test]
    fn hash_is_the_java_style_rolling_hash() {
        // "ab" => 97 * 31 + 98
        assert_eq!(body_hash(Some(&RequestBody::Raw(vec![b"ab".to_vec()]))), 3105);
        let split = RequestBody::Raw(vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(body_hash(Some(&split)), 3105);

        let form = RequestBody::Form(vec![FormField {
            name: "a".into(),
            values: vec!["1".into(), "2".into()],
        }]);
        assert_ne!(body_hash(Some(&form)), 0);
    }
}
