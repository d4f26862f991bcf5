use super::{Interceptor, Outcome};
use crate::auth::TokenRefreshCoordinator;
use crate::error::Result;
use crate::request::Request;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Attaches the bearer token and schedules a refresh when a call comes back 401.
///
/// The refresh is fire-and-forget; retrying the rejected call is left to the
/// pipeline.
pub struct TokenRefreshInterceptor {
    coordinator: Arc<TokenRefreshCoordinator>,
}

impl TokenRefreshInterceptor {
    pub fn new(coordinator: Arc<TokenRefreshCoordinator>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl Interceptor for TokenRefreshInterceptor {
    fn name(&self) -> &str {
        "token-refresh"
    }

    async fn adapt(&self, request: Request) -> Result<Request> {
        let (token, generation) = self.coordinator.current();
        let request = request.with_token_generation(generation);
        Ok(match token {
            Some(token) => request.with_header("Authorization", format!("Bearer {}", token)),
            None => request,
        })
    }

    async fn observe(&self, request: &Request, outcome: Outcome<'_>) -> Result<()> {
        let unauthorized = matches!(outcome, Ok(response) if response.status == 401);
        if !unauthorized || request.is_auth_retry() {
            return Ok(());
        }

        debug!("{} {} returned 401, scheduling token refresh", request.method(), request.path());
        match request.token_generation() {
            Some(seen) => self.coordinator.trigger_refresh_since(seen),
            None => self.coordinator.trigger_refresh(),
        };
        Ok(())
    }
}
