use std::collections::HashMap;

use axum::http::HeaderMap;

use valet_queue::Requester;

/// An authenticated caller as the transport layer sees it.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
    pub email: String,
    pub is_admin: bool,
}

impl AuthUser {
    pub fn requester(&self) -> Requester {
        Requester {
            user_id: self.user_id.clone(),
            is_admin: self.is_admin,
        }
    }
}

/// Real token verification lives outside the core; the plane only needs
/// "token → user or nothing".
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Option<AuthUser>;
}

/// Table-driven verifier for development and tests.
#[derive(Debug, Default)]
pub struct StaticTokenVerifier {
    users: HashMap<String, AuthUser>,
}

impl StaticTokenVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(
        mut self,
        token: impl Into<String>,
        user_id: impl Into<String>,
        email: impl Into<String>,
        is_admin: bool,
    ) -> Self {
        let user_id = user_id.into();
        self.users.insert(
            token.into(),
            AuthUser { user_id, email: email.into(), is_admin },
        );
        self
    }
}

impl TokenVerifier for StaticTokenVerifier {
    fn verify(&self, token: &str) -> Option<AuthUser> {
        self.users.get(token).cloned()
    }
}

/// Pull the bearer token out of an `Authorization` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn verifier() -> StaticTokenVerifier {
        StaticTokenVerifier::new()
            .with_user("mock_token_alice", "alice", "alice@example.com", false)
            .with_user("mock_token_root", "root", "root@example.com", true)
    }

    #[test]
    fn verifies_known_tokens() {
        let v = verifier();
        let alice = v.verify("mock_token_alice").unwrap();
        assert_eq!(alice.user_id, "alice");
        assert!(!alice.is_admin);
        assert!(v.verify("mock_token_root").unwrap().is_admin);
        assert!(v.verify("junk").is_none());
    }

    #[test]
    fn bearer_extraction() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_none());

        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer mock_token_alice"),
        );
        assert_eq!(bearer_token(&headers), Some("mock_token_alice"));

        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Basic xyz"),
        );
        assert!(bearer_token(&headers).is_none());

        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer  "),
        );
        assert!(bearer_token(&headers).is_none());
    }

    #[test]
    fn requester_projection() {
        let v = verifier();
        let requester = v.verify("mock_token_root").unwrap().requester();
        assert_eq!(requester.user_id, "root");
        assert!(requester.is_admin);
    }
}
