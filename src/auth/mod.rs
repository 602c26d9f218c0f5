//! Server-side authentication
//!
//! The handshake driver only talks to the [`ServerAuthenticator`] trait; the
//! default [`Authenticator`] implementation selects among registered
//! [`AuthMethod`]s based on what the client advertised. Two-stage methods
//! hand back an opaque [`AuthContinuation`] the driver cashes in after the
//! interim reply.

mod none;
mod password;

pub use none::NoneMethod;
pub use password::PasswordMethod;

use crate::helper::AsyncStream;
use crate::message::Request;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{oneshot, RwLock};
use tracing::debug;

/// Method id meaning "no acceptable method"
pub const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;

/// Outcome of an authentication attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResult {
    /// Authentication succeeded
    pub success: bool,
    /// A second stage is required before success can be decided
    pub continue_required: bool,
    /// Session the connection belongs to
    pub session_id: Vec<u8>,
    /// Authenticated client name, empty for anonymous methods
    pub client_name: String,
    /// Method that produced this result
    pub selected_method: u8,
    /// Method-specific data to echo back to the client
    pub method_data: Option<Vec<u8>>,
}

impl AuthResult {
    /// Successful one-stage result
    pub fn success(session_id: Vec<u8>, selected_method: u8) -> Self {
        AuthResult {
            success: true,
            continue_required: false,
            session_id,
            client_name: String::new(),
            selected_method,
            method_data: None,
        }
    }

    /// Definitive failure
    pub fn failure() -> Self {
        AuthResult {
            success: false,
            continue_required: false,
            session_id: Vec::new(),
            client_name: String::new(),
            selected_method: METHOD_NONE_ACCEPTABLE,
            method_data: None,
        }
    }

    /// Interim result: stage two pending for `selected_method`
    pub fn pending(selected_method: u8) -> Self {
        AuthResult {
            success: false,
            continue_required: true,
            session_id: Vec::new(),
            client_name: String::new(),
            selected_method,
            method_data: None,
        }
    }
}

/// Opaque handle for the second authentication stage.
///
/// The server core treats it as a one-shot task: submit, then await the
/// outcome. No protocol knowledge leaks through it.
pub struct AuthContinuation {
    go: oneshot::Sender<()>,
    outcome: oneshot::Receiver<Result<AuthResult>>,
}

/// Method-side counterpart of an [`AuthContinuation`]
pub struct AuthContinuationDriver {
    go: oneshot::Receiver<()>,
    outcome: oneshot::Sender<Result<AuthResult>>,
}

impl AuthContinuation {
    /// Create a continuation and its driver half
    pub fn channel() -> (AuthContinuation, AuthContinuationDriver) {
        let (go_tx, go_rx) = oneshot::channel();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        (
            AuthContinuation {
                go: go_tx,
                outcome: outcome_rx,
            },
            AuthContinuationDriver {
                go: go_rx,
                outcome: outcome_tx,
            },
        )
    }

    /// Kick off stage two and await its outcome
    pub async fn run(self) -> Result<AuthResult> {
        let _ = self.go.send(());
        self.outcome
            .await
            .map_err(|_| anyhow!("authentication continuation dropped"))?
    }
}

impl AuthContinuationDriver {
    /// Wait for the core to request stage two, then run it and report back.
    pub async fn serve<F, Fut>(self, stage_two: F)
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<AuthResult>> + Send,
    {
        if self.go.await.is_ok() {
            let _ = self.outcome.send(stage_two().await);
        }
    }
}

/// Contract between the handshake driver and any authenticator
#[async_trait]
pub trait ServerAuthenticator: Send + Sync {
    /// Run the first authentication stage against the parsed request.
    ///
    /// A result with `continue_required` set must come with a continuation.
    async fn authenticate(
        &self,
        stream: &mut dyn AsyncStream,
        request: &Request,
    ) -> (AuthResult, Option<AuthContinuation>);

    /// Run the second stage behind the continuation
    async fn continue_authenticate(
        &self,
        continuation: AuthContinuation,
        request: &Request,
    ) -> Result<AuthResult>;

    /// Notify that a connection belonging to `session_id` has closed.
    ///
    /// Called exactly once per accepted connection that authenticated.
    async fn session_conn_close(&self, session_id: &[u8]);
}

/// One pluggable authentication method inside the default [`Authenticator`]
#[async_trait]
pub trait AuthMethod: Send + Sync {
    /// Wire id of the method
    fn id(&self) -> u8;

    /// Authenticate from the method data carried in the request options
    async fn authenticate(&self, data: Option<&[u8]>) -> (AuthResult, Option<AuthContinuation>);
}

/// Default authenticator: a registry of methods plus session bookkeeping
pub struct Authenticator {
    methods: Vec<Arc<dyn AuthMethod>>,
    sessions: RwLock<HashMap<Vec<u8>, u32>>,
}

impl Authenticator {
    /// Authenticator with the anonymous method registered
    pub fn new() -> Self {
        let mut a = Authenticator::empty();
        a.add_method(Arc::new(NoneMethod));
        a
    }

    /// Authenticator with no methods; every attempt fails until one is added
    pub fn empty() -> Self {
        Authenticator {
            methods: Vec::new(),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Register a method; earlier registrations win ties
    pub fn add_method(&mut self, method: Arc<dyn AuthMethod>) {
        self.methods.push(method);
    }

    /// Number of connections currently open on `session_id`
    pub async fn session_conn_count(&self, session_id: &[u8]) -> u32 {
        self.sessions
            .read()
            .await
            .get(session_id)
            .copied()
            .unwrap_or(0)
    }

    async fn register_session(&self, session_id: &[u8]) {
        if session_id.is_empty() {
            return;
        }
        let mut sessions = self.sessions.write().await;
        *sessions.entry(session_id.to_vec()).or_insert(0) += 1;
    }
}

impl Default for Authenticator {
    fn default() -> Self {
        Authenticator::new()
    }
}

#[async_trait]
impl ServerAuthenticator for Authenticator {
    async fn authenticate(
        &self,
        _stream: &mut dyn AsyncStream,
        request: &Request,
    ) -> (AuthResult, Option<AuthContinuation>) {
        let advertised = request
            .options
            .method_advertisement()
            .map(|a| a.methods)
            .unwrap_or_default();

        for method in &self.methods {
            // The anonymous method needs no advertisement.
            if method.id() != 0 && !advertised.contains(&method.id()) {
                continue;
            }
            let data = request.options.auth_data(method.id());
            let (result, continuation) = method.authenticate(data).await;
            debug!(
                method = method.id(),
                success = result.success,
                pending = result.continue_required,
                "authentication method ran"
            );
            if result.success {
                self.register_session(&result.session_id).await;
            }
            return (result, continuation);
        }

        (AuthResult::failure(), None)
    }

    async fn continue_authenticate(
        &self,
        continuation: AuthContinuation,
        _request: &Request,
    ) -> Result<AuthResult> {
        let result = continuation.run().await?;
        if result.success {
            self.register_session(&result.session_id).await;
        }
        Ok(result)
    }

    async fn session_conn_close(&self, session_id: &[u8]) {
        let mut sessions = self.sessions.write().await;
        if let Some(count) = sessions.get_mut(session_id) {
            *count -= 1;
            if *count == 0 {
                sessions.remove(session_id);
                debug!("session closed");
            }
        }
    }
}

/// Fresh random 8-byte session id
pub(crate) fn new_session_id() -> Vec<u8> {
    rand::thread_rng().gen::<[u8; 8]>().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{CommandCode, SocksAddr};

    fn request_with_methods(methods: &[u8]) -> Request {
        let mut req = Request::new(CommandCode::Connect, SocksAddr::unspecified());
        req.options.add_method_advertisement(0, methods);
        req
    }

    async fn run_auth(auth: &Authenticator, req: &Request) -> (AuthResult, Option<AuthContinuation>) {
        let (mut a, _b) = tokio::io::duplex(64);
        auth.authenticate(&mut a, req).await
    }

    #[tokio::test]
    async fn test_default_authenticator_accepts_anonymous() {
        let auth = Authenticator::new();
        let req = Request::new(CommandCode::Connect, SocksAddr::unspecified());

        let (result, cont) = run_auth(&auth, &req).await;
        assert!(result.success);
        assert_eq!(result.selected_method, 0);
        assert!(result.session_id.is_empty());
        assert!(cont.is_none());
    }

    #[tokio::test]
    async fn test_empty_authenticator_rejects() {
        let auth = Authenticator::empty();
        let req = request_with_methods(&[0, 2]);

        let (result, _) = run_auth(&auth, &req).await;
        assert!(!result.success);
        assert_eq!(result.selected_method, METHOD_NONE_ACCEPTABLE);
    }

    #[tokio::test]
    async fn test_session_bookkeeping() {
        let mut auth = Authenticator::empty();
        auth.add_method(Arc::new(PasswordMethod::new("user", "pass")));

        let mut req = Request::new(CommandCode::Connect, SocksAddr::unspecified());
        req.options.add_method_advertisement(0, &[2]);
        let mut creds = vec![1u8, 4];
        creds.extend_from_slice(b"user");
        creds.push(4);
        creds.extend_from_slice(b"pass");
        req.options.add_auth_data(2, &creds);

        let (result, _) = run_auth(&auth, &req).await;
        assert!(result.success);
        assert_eq!(result.session_id.len(), 8);
        assert_eq!(auth.session_conn_count(&result.session_id).await, 1);

        auth.session_conn_close(&result.session_id).await;
        assert_eq!(auth.session_conn_count(&result.session_id).await, 0);
    }

    #[tokio::test]
    async fn test_continuation_round_trip() {
        let (cont, driver) = AuthContinuation::channel();

        let task = tokio::spawn(async move {
            driver
                .serve(|| async { Ok(AuthResult::success(vec![1, 2], 9)) })
                .await;
        });

        let result = cont.run().await.unwrap();
        assert!(result.success);
        assert_eq!(result.selected_method, 9);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_continuation_dropped_driver_errors() {
        let (cont, driver) = AuthContinuation::channel();
        drop(driver);
        assert!(cont.run().await.is_err());
    }

    #[tokio::test]
    async fn test_continue_authenticate_registers_session() {
        let auth = Authenticator::new();
        let req = Request::new(CommandCode::Connect, SocksAddr::unspecified());

        let (cont, driver) = AuthContinuation::channel();
        tokio::spawn(async move {
            driver
                .serve(|| async { Ok(AuthResult::success(vec![7; 8], 2)) })
                .await;
        });

        let result = auth.continue_authenticate(cont, &req).await.unwrap();
        assert!(result.success);
        assert_eq!(auth.session_conn_count(&[7; 8]).await, 1);
    }

    #[test]
    fn test_new_session_id_length() {
        let a = new_session_id();
        let b = new_session_id();
        assert_eq!(a.len(), 8);
        // Two consecutive ids colliding means the RNG is broken.
        assert_ne!(a, b);
    }

    #[test]
    fn test_auth_result_constructors() {
        assert!(AuthResult::success(vec![1], 0).success);
        assert!(!AuthResult::failure().success);
        let pending = AuthResult::pending(2);
        assert!(pending.continue_required);
        assert!(!pending.success);
    }
}
