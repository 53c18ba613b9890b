mod dto;
pub mod handlers;
pub mod service;

pub use service::ListService;

use crate::state::AppState;
use axum::Router;

pub fn router() -> Router<AppState> {
    handlers::list_routes()
}
