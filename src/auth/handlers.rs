use axum::{
    extract::{Query, State},
    http::{
        header::{HeaderMap, SET_COOKIE},
        HeaderValue, StatusCode,
    },
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use tracing::{error, info, instrument, warn};

use crate::{
    auth::{
        dto::{
            CallbackQuery, LoginRequest, PublicUser, RegisterRequest, RegisterResponse,
            ResendRequest, VerifyQuery,
        },
        session::{read_cookie, Principal, SESSION_COOKIE},
        token::{constant_time_eq, generate_token},
    },
    error::AuthError,
    state::AppState,
};

const OAUTH_STATE_COOKIE: &str = "listify_oauth_state";

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/logout", post(logout))
        .route("/auth/verify", get(verify_email))
        .route("/auth/resend-verification", post(resend_verification))
        .route("/auth/google", get(google_start))
        .route("/auth/google/callback", get(google_callback))
}

pub fn me_routes() -> Router<AppState> {
    Router::new().route("/me", get(get_me))
}

fn cookie_headers(cookies: impl IntoIterator<Item = String>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for cookie in cookies {
        match HeaderValue::from_str(&cookie) {
            Ok(value) => {
                headers.append(SET_COOKIE, value);
            }
            Err(e) => error!(error = %e, "invalid cookie header"),
        }
    }
    headers
}

#[instrument(skip(state, payload))]
pub async fn register(
    State(state): State<AppState>,
    Json(payload): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<RegisterResponse>), AuthError> {
    let user = state
        .local
        .register(&payload.username, payload.name.as_deref(), &payload.password)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            user: PublicUser::from(&user),
            verification: "pending",
        }),
    ))
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> Result<(HeaderMap, Json<PublicUser>), AuthError> {
    let auth = state
        .local
        .authenticate(&payload.username, &payload.password)
        .await?;
    let headers = cookie_headers([state.sessions.session_cookie(&auth.session)]);
    Ok((headers, Json(PublicUser::from(&auth.user))))
}

#[instrument(skip_all)]
pub async fn logout(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    if let Some(token) = read_cookie(&headers, SESSION_COOKIE) {
        if let Err(e) = state.sessions.terminate(&token).await {
            error!(error = %e, "failed to delete session");
        }
    }
    // The cookie is cleared even when the server-side record was already gone.
    (
        StatusCode::NO_CONTENT,
        cookie_headers([state.sessions.clear_cookie()]),
    )
}

#[instrument(skip_all)]
pub async fn verify_email(
    State(state): State<AppState>,
    Query(query): Query<VerifyQuery>,
) -> Result<Redirect, AuthError> {
    state.verification.redeem(&query.token).await?;
    Ok(Redirect::to("/login?verified=1"))
}

/// Always 204 so the endpoint cannot be used to discover accounts.
#[instrument(skip(state, payload))]
pub async fn resend_verification(
    State(state): State<AppState>,
    Json(payload): Json<ResendRequest>,
) -> StatusCode {
    if let Err(e) = state.verification.resend(&payload.username).await {
        warn!(error = %e, "resend verification failed");
    }
    StatusCode::NO_CONTENT
}

#[instrument(skip_all)]
pub async fn google_start(State(state): State<AppState>) -> Result<Response, AuthError> {
    let provider = state.provider.clone().ok_or(AuthError::ProviderUnavailable)?;
    let oauth_state = generate_token();
    let cookie = format!(
        "{OAUTH_STATE_COOKIE}={oauth_state}; Path=/auth/google; HttpOnly; SameSite=Lax; Max-Age=600"
    );
    Ok((
        cookie_headers([cookie]),
        Redirect::to(&provider.authorize_url(&oauth_state)),
    )
        .into_response())
}

#[instrument(skip_all)]
pub async fn google_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    principal: Option<Principal>,
    Query(query): Query<CallbackQuery>,
) -> Result<Response, AuthError> {
    let to_login = || Ok(Redirect::to("/login").into_response());
    let Some(provider) = state.provider.clone() else {
        return to_login();
    };
    if let Some(err) = query.error.as_deref() {
        warn!(error = err, "provider denied sign-in");
        return to_login();
    }
    let expected = read_cookie(&headers, OAUTH_STATE_COOKIE);
    let (Some(code), Some(got), Some(expected)) = (query.code, query.state, expected) else {
        warn!("oauth callback missing code or state");
        return to_login();
    };
    if !constant_time_eq(&got, &expected) {
        warn!("oauth state mismatch");
        return to_login();
    }

    let profile = match provider.exchange(&code).await {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, "oauth code exchange failed");
            return to_login();
        }
    };

    let clear_state =
        format!("{OAUTH_STATE_COOKIE}=; Path=/auth/google; HttpOnly; SameSite=Lax; Max-Age=0");

    if let Some(principal) = principal {
        state.federated.link(&principal, &profile.id).await?;
        return Ok((cookie_headers([clear_state]), Redirect::to("/lists")).into_response());
    }

    let user = state
        .federated
        .resolve_or_create(&profile.id, profile.first_name().as_deref())
        .await?;
    let session = state.sessions.establish(user.id).await?;
    info!(user_id = %user.id, "federated login");
    Ok((
        cookie_headers([clear_state, state.sessions.session_cookie(&session)]),
        Redirect::to("/lists"),
    )
        .into_response())
}

#[instrument(skip_all)]
pub async fn get_me(principal: Principal) -> Json<PublicUser> {
    Json(PublicUser::from(principal.user()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::User;

    #[test]
    fn public_user_hides_credentials() {
        let user = User::new_local(
            "test@example.com".into(),
            Some("Test".into()),
            "$argon2id$v=19$secret".into(),
        );
        let json = serde_json::to_string(&PublicUser::from(&user)).unwrap();
        assert!(json.contains("test@example.com"));
        assert!(json.contains("\"federated\":false"));
        assert!(!json.contains("argon2"));
    }

    #[test]
    fn cookie_headers_keeps_every_cookie() {
        let headers = cookie_headers(["a=1".to_string(), "b=2".to_string()]);
        assert_eq!(headers.get_all(SET_COOKIE).iter().count(), 2);
    }
}
