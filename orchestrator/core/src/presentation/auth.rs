// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! HTTP Basic authentication against the single farm credential

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use subtle::ConstantTimeEq;

#[derive(Clone)]
pub struct BasicAuth {
    user: String,
    password: String,
}

impl BasicAuth {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }

    /// Check an `Authorization` header value
    pub fn verify(&self, header: Option<&str>) -> bool {
        let Some(encoded) = header.and_then(|h| h.strip_prefix("Basic ")) else {
            return false;
        };
        let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
            return false;
        };
        let Some(split) = decoded.iter().position(|&b| b == b':') else {
            return false;
        };
        let (user, password) = (&decoded[..split], &decoded[split + 1..]);
        let user_ok = user.ct_eq(self.user.as_bytes());
        let password_ok = password.ct_eq(self.password.as_bytes());
        bool::from(user_ok & password_ok)
    }

    /// Header value a client sends for this credential
    pub fn header_value(&self) -> String {
        format!(
            "Basic {}",
            STANDARD.encode(format!("{}:{}", self.user, self.password))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify() {
        let auth = BasicAuth::new("farm", "s3cret:with-colon");
        assert!(auth.verify(Some(&auth.header_value())));
        assert!(!auth.verify(None));
        assert!(!auth.verify(Some("Bearer abc")));
        assert!(!auth.verify(Some("Basic !!!")));

        let wrong = BasicAuth::new("farm", "nope");
        assert!(!auth.verify(Some(&wrong.header_value())));
        let wrong_user = BasicAuth::new("farmer", "s3cret:with-colon");
        assert!(!auth.verify(Some(&wrong_user.header_value())));
    }
}
