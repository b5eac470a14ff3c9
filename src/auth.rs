use async_trait::async_trait;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};

use crate::{errors::AppError, user_context::UserContext, AppState};

/// Turns a raw credential into the identity a session is bound to.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(&self, credential: &str) -> Result<UserContext, AppError>;
}

/// Accepts a single configured token and maps it to a fixed identity.
#[derive(Debug, Clone)]
pub struct StaticTokenResolver {
    token: String,
    user_id: String,
    username: String,
    email: Option<String>,
}

impl StaticTokenResolver {
    pub fn new(
        token: impl Into<String>,
        user_id: impl Into<String>,
        username: impl Into<String>,
        email: Option<String>,
    ) -> Self {
        Self {
            token: token.into(),
            user_id: user_id.into(),
            username: username.into(),
            email,
        }
    }
}

#[async_trait]
impl CredentialResolver for StaticTokenResolver {
    async fn resolve(&self, credential: &str) -> Result<UserContext, AppError> {
        if credential != self.token {
            return Err(AppError::unauthorized(
                "invalid_token",
                "invalid bearer token",
            ));
        }

        Ok(UserContext::new(
            self.user_id.clone(),
            self.username.clone(),
            self.email.clone(),
            credential,
        ))
    }
}

/// Resolves the bearer credential before any session is looked up or created, and makes
/// the resulting [`UserContext`] available to handlers as a request extension.
pub async fn require_user_context(
    State(state): State<AppState>,
    auth_header: Option<TypedHeader<Authorization<Bearer>>>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let Some(TypedHeader(auth)) = auth_header else {
        return Err(AppError::unauthorized(
            "missing_token",
            "missing authorization header",
        ));
    };

    let user = state.resolver.resolve(auth.token()).await?;
    request.extensions_mut().insert(user);

    Ok(next.run(request).await)
}
