//! API Routes
//!
//! Route handlers organized by functionality.

pub mod events;
pub mod health;
pub mod notify;

use axum::http::HeaderMap;

use crate::api::error::{ApiError, ApiResult};
use crate::events::{RealmId, UserId};

/// Header carrying the authenticated user id
pub const USER_ID_HEADER: &str = "x-user-id";

/// Header carrying the caller's realm; defaults to realm 0
pub const REALM_ID_HEADER: &str = "x-realm-id";

/// The authenticated caller, as asserted by the fronting proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub user_id: UserId,
    pub realm_id: RealmId,
}

impl Caller {
    pub fn from_headers(headers: &HeaderMap) -> ApiResult<Self> {
        let user_id = header_id(headers, USER_ID_HEADER)?
            .ok_or_else(|| ApiError::Unauthenticated(format!("missing {} header", USER_ID_HEADER)))?;
        let realm_id = header_id(headers, REALM_ID_HEADER)?.unwrap_or(0);
        Ok(Self { user_id, realm_id })
    }
}

fn header_id(headers: &HeaderMap, name: &str) -> ApiResult<Option<u64>> {
    let Some(value) = headers.get(name) else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .map(Some)
        .ok_or_else(|| ApiError::Unauthenticated(format!("malformed {} header", name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_caller_from_headers() {
        let mut headers = HeaderMap::new();
        assert!(matches!(
            Caller::from_headers(&headers),
            Err(ApiError::Unauthenticated(_))
        ));

        headers.insert(USER_ID_HEADER, HeaderValue::from_static("42"));
        assert_eq!(
            Caller::from_headers(&headers).unwrap(),
            Caller {
                user_id: 42,
                realm_id: 0
            }
        );

        headers.insert(REALM_ID_HEADER, HeaderValue::from_static("7"));
        assert_eq!(Caller::from_headers(&headers).unwrap().realm_id, 7);

        headers.insert(USER_ID_HEADER, HeaderValue::from_static("abc"));
        assert!(Caller::from_headers(&headers).is_err());
    }
}
