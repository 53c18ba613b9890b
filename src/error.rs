use axum::{
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
};
use tracing::error;
use uuid::Uuid;

/// Failure at the persistence seam.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unique constraint violated")]
    Conflict,
    #[error("store did not answer in time")]
    Unavailable,
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("username already registered")]
    DuplicateUsername,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("account not verified")]
    NotVerified,
    #[error("invalid or expired verification token")]
    InvalidOrExpiredToken,
    #[error("not authenticated")]
    Unauthenticated,
    #[error("verification email for user {user_id} could not be delivered")]
    NotificationFailed { user_id: Uuid },
    #[error("store unavailable")]
    StoreUnavailable,
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("identity already linked to another account")]
    AlreadyLinked,
    #[error("identity provider unavailable")]
    ProviderUnavailable,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<StoreError> for AuthError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable => AuthError::StoreUnavailable,
            StoreError::Conflict => AuthError::Internal(anyhow::anyhow!("unexpected store conflict")),
            StoreError::Backend(e) => AuthError::Internal(e),
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AuthError::Unauthenticated => return Redirect::to("/login").into_response(),
            AuthError::DuplicateUsername => (StatusCode::CONFLICT, "Username already registered"),
            AuthError::InvalidCredentials => {
                (StatusCode::UNAUTHORIZED, "Invalid username or password")
            }
            AuthError::NotVerified => (
                StatusCode::FORBIDDEN,
                "Please verify your email address before logging in",
            ),
            AuthError::InvalidOrExpiredToken => {
                (StatusCode::BAD_REQUEST, "Invalid or expired verification link")
            }
            AuthError::NotificationFailed { .. } => (
                StatusCode::ACCEPTED,
                "Account created, but the verification email could not be sent. Request a new one to finish signing up",
            ),
            AuthError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, *msg),
            AuthError::AlreadyLinked => (
                StatusCode::CONFLICT,
                "This identity is already linked to another account",
            ),
            AuthError::ProviderUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Sign-in provider unavailable, try again later",
            ),
            AuthError::StoreUnavailable => {
                error!("store unavailable");
                (StatusCode::SERVICE_UNAVAILABLE, "Service busy, try again")
            }
            AuthError::Internal(e) => {
                error!(error = %e, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "Something went wrong, try again")
            }
        };
        (status, message.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthenticated_redirects_to_login() {
        let res = AuthError::Unauthenticated.into_response();
        assert_eq!(res.status(), StatusCode::SEE_OTHER);
        assert_eq!(res.headers()[axum::http::header::LOCATION], "/login");
    }

    #[test]
    fn store_errors_map_to_taxonomy() {
        assert!(matches!(
            AuthError::from(StoreError::Unavailable),
            AuthError::StoreUnavailable
        ));
        assert!(matches!(
            AuthError::from(StoreError::Backend(anyhow::anyhow!("boom"))),
            AuthError::Internal(_)
        ));
    }

    #[test]
    fn internal_errors_do_not_leak_detail() {
        let res = AuthError::Internal(anyhow::anyhow!("password=hunter2")).into_response();
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
