//! Username/password authentication
//!
//! Method 2. Credentials arrive in the request's authentication data option
//! using the RFC 1929 sub-negotiation layout:
//!
//! ```text
//! +-----+------+----------+------+----------+
//! | VER | ULEN |  UNAME   | PLEN |  PASSWD  |
//! +-----+------+----------+------+----------+
//! |  1  |  1   | 1 to 255 |  1   | 1 to 255 |
//! +-----+------+----------+------+----------+
//! ```

use super::{new_session_id, AuthContinuation, AuthMethod, AuthResult};
use async_trait::async_trait;
use tracing::debug;

const CREDENTIAL_VERSION: u8 = 0x01;

/// Method 2: username/password against a single configured credential pair
pub struct PasswordMethod {
    username: String,
    password: String,
}

impl PasswordMethod {
    /// Create the method with the expected credentials
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        PasswordMethod {
            username: username.into(),
            password: password.into(),
        }
    }

    fn parse_credentials(data: &[u8]) -> Option<(&[u8], &[u8])> {
        if data.len() < 2 || data[0] != CREDENTIAL_VERSION {
            return None;
        }
        let ulen = data[1] as usize;
        if data.len() < 2 + ulen + 1 {
            return None;
        }
        let username = &data[2..2 + ulen];
        let plen = data[2 + ulen] as usize;
        if data.len() != 2 + ulen + 1 + plen {
            return None;
        }
        let password = &data[3 + ulen..];
        Some((username, password))
    }
}

#[async_trait]
impl AuthMethod for PasswordMethod {
    fn id(&self) -> u8 {
        2
    }

    async fn authenticate(&self, data: Option<&[u8]>) -> (AuthResult, Option<AuthContinuation>) {
        let Some(data) = data else {
            debug!("password method selected but no credentials carried");
            return (AuthResult::failure(), None);
        };
        let Some((username, password)) = Self::parse_credentials(data) else {
            debug!("malformed credential payload");
            return (AuthResult::failure(), None);
        };

        if username == self.username.as_bytes() && password == self.password.as_bytes() {
            let mut result = AuthResult::success(new_session_id(), self.id());
            result.client_name = self.username.clone();
            (result, None)
        } else {
            debug!("credential mismatch");
            (AuthResult::failure(), None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials(username: &str, password: &str) -> Vec<u8> {
        let mut data = vec![CREDENTIAL_VERSION, username.len() as u8];
        data.extend_from_slice(username.as_bytes());
        data.push(password.len() as u8);
        data.extend_from_slice(password.as_bytes());
        data
    }

    #[tokio::test]
    async fn test_correct_credentials() {
        let method = PasswordMethod::new("user", "hunter2");
        let data = credentials("user", "hunter2");

        let (result, _) = method.authenticate(Some(&data)).await;
        assert!(result.success);
        assert_eq!(result.selected_method, 2);
        assert_eq!(result.client_name, "user");
    }

    #[tokio::test]
    async fn test_wrong_password() {
        let method = PasswordMethod::new("user", "hunter2");
        let data = credentials("user", "wrong");

        let (result, _) = method.authenticate(Some(&data)).await;
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_missing_credentials() {
        let method = PasswordMethod::new("user", "hunter2");
        let (result, _) = method.authenticate(None).await;
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_malformed_payloads() {
        let method = PasswordMethod::new("user", "hunter2");

        for bad in [
            vec![],
            vec![0x02, 0],
            vec![CREDENTIAL_VERSION, 200, b'a'],
            credentials("user", "hunter2")[..5].to_vec(),
        ] {
            let (result, _) = method.authenticate(Some(&bad)).await;
            assert!(!result.success, "payload {:?} must be rejected", bad);
        }
    }

    #[test]
    fn test_parse_credentials_exact_bounds() {
        let data = credentials("ab", "cd");
        let (u, p) = PasswordMethod::parse_credentials(&data).unwrap();
        assert_eq!(u, b"ab");
        assert_eq!(p, b"cd");

        // trailing byte makes the payload invalid
        let mut long = data.clone();
        long.push(0);
        assert!(PasswordMethod::parse_credentials(&long).is_none());
    }
}
