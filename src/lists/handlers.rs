use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use tracing::instrument;

use super::dto::{ItemRequest, ListView, ListsView, NewListRequest};
use crate::{auth::Principal, error::AuthError, state::AppState};

pub fn list_routes() -> Router<AppState> {
    Router::new()
        .route("/lists", get(show_lists).post(add_list))
        .route("/lists/:name", get(show_list).delete(remove_list))
        .route("/lists/:name/items", post(add_item))
        .route("/lists/:name/items/remove", post(remove_item))
}

fn required(value: &str, what: &'static str) -> Result<String, AuthError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(AuthError::InvalidInput(what));
    }
    Ok(trimmed.to_string())
}

async fn lists_view(state: &AppState, who: &Principal) -> Result<Json<ListsView>, AuthError> {
    Ok(Json(ListsView {
        lists: state.lists.list_names(who).await?,
    }))
}

async fn list_view(
    state: &AppState,
    who: &Principal,
    name: String,
) -> Result<Json<ListView>, AuthError> {
    let items = state.lists.list_items(who, &name).await?;
    Ok(Json(ListView { name, items }))
}

#[instrument(skip_all, fields(user_id = %who.id()))]
pub async fn show_lists(
    State(state): State<AppState>,
    who: Principal,
) -> Result<Json<ListsView>, AuthError> {
    lists_view(&state, &who).await
}

#[instrument(skip(state, who, payload), fields(user_id = %who.id()))]
pub async fn add_list(
    State(state): State<AppState>,
    who: Principal,
    Json(payload): Json<NewListRequest>,
) -> Result<Json<ListsView>, AuthError> {
    let name = required(&payload.name, "List name is required")?;
    state.lists.add_list(&who, &name).await?;
    lists_view(&state, &who).await
}

#[instrument(skip(state, who), fields(user_id = %who.id()))]
pub async fn remove_list(
    State(state): State<AppState>,
    who: Principal,
    Path(name): Path<String>,
) -> Result<Json<ListsView>, AuthError> {
    state.lists.remove_list(&who, &name).await?;
    lists_view(&state, &who).await
}

#[instrument(skip(state, who), fields(user_id = %who.id()))]
pub async fn show_list(
    State(state): State<AppState>,
    who: Principal,
    Path(name): Path<String>,
) -> Result<Json<ListView>, AuthError> {
    list_view(&state, &who, name).await
}

#[instrument(skip(state, who, payload), fields(user_id = %who.id()))]
pub async fn add_item(
    State(state): State<AppState>,
    who: Principal,
    Path(name): Path<String>,
    Json(payload): Json<ItemRequest>,
) -> Result<Json<ListView>, AuthError> {
    let item = required(&payload.item, "Item is required")?;
    state.lists.add_item(&who, &name, &item).await?;
    list_view(&state, &who, name).await
}

#[instrument(skip(state, who, payload), fields(user_id = %who.id()))]
pub async fn remove_item(
    State(state): State<AppState>,
    who: Principal,
    Path(name): Path<String>,
    Json(payload): Json<ItemRequest>,
) -> Result<Json<ListView>, AuthError> {
    state.lists.remove_item(&who, &name, payload.item.trim()).await?;
    list_view(&state, &who, name).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_trims_and_rejects_blank() {
        assert_eq!(required("  milk ", "x").unwrap(), "milk");
        assert!(matches!(
            required("   ", "x"),
            Err(AuthError::InvalidInput("x"))
        ));
    }
}
