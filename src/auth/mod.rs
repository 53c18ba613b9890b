use crate::state::AppState;
use axum::Router;

mod dto;
pub mod federated;
pub mod handlers;
pub mod local;
pub mod password;
pub mod session;
pub mod token;
pub mod verification;

pub use federated::{FederatedAuthenticator, GoogleProvider, IdentityProvider};
pub use local::LocalAuthenticator;
pub use session::{Principal, SessionManager};
pub use verification::VerificationManager;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(handlers::auth_routes())
        .merge(handlers::me_routes())
}
