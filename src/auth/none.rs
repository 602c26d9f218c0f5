//! Anonymous authentication

use super::{AuthContinuation, AuthMethod, AuthResult};
use async_trait::async_trait;

/// Method 0: no authentication required.
///
/// Always succeeds. Anonymous connections share the empty session, which is
/// what lets successive BIND calls from one client find their backlog
/// worker again.
pub struct NoneMethod;

#[async_trait]
impl AuthMethod for NoneMethod {
    fn id(&self) -> u8 {
        0
    }

    async fn authenticate(&self, _data: Option<&[u8]>) -> (AuthResult, Option<AuthContinuation>) {
        (AuthResult::success(Vec::new(), 0), None)
    }
}
