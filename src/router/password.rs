//! Forgot/reset-password routes.

use axum::{Json, extract::State};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::AppState;
use crate::error::Result;
use crate::router::Valid;

/// Fixed answer for `/forgot-password`, whether or not the address matched.
const FORGOT_MESSAGE: &str =
    "If the email exists, reset instructions have been queued.";
const RESET_MESSAGE: &str = "Password has been reset. Please sign in.";

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct ForgotBody {
    #[validate(email(message = "Email must be formatted."))]
    pub email: String,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct ResetBody {
    #[validate(length(min = 1, message = "Reset token is required."))]
    pub token: String,
    #[validate(length(
        min = 6,
        max = 255,
        message = "Password must contain at least 6 characters."
    ))]
    pub password: String,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub message: String,
}

/// Handler to issue a reset token and queue the notification.
pub async fn forgot(
    State(state): State<AppState>,
    Valid(body): Valid<ForgotBody>,
) -> Result<Json<Response>> {
    state.reset_manager().request(body.email.trim()).await?;

    Ok(Json(Response {
        message: FORGOT_MESSAGE.to_owned(),
    }))
}

/// Handler to consume a reset token and rotate the credential.
pub async fn reset(
    State(state): State<AppState>,
    Valid(body): Valid<ResetBody>,
) -> Result<Json<Response>> {
    state
        .reset_manager()
        .consume(body.token.trim(), &body.password)
        .await?;

    Ok(Json(Response {
        message: RESET_MESSAGE.to_owned(),
    }))
}

#[cfg(test)]
pub(super) mod tests {
    use super::*;
    use crate::*;
    use axum::http::{Method, StatusCode};
    use serde_json::json;
    use sqlx::{Pool, Postgres};

    #[sqlx::test]
    async fn test_forgot_with_malformed_email(pool: Pool<Postgres>) {
        let app = app(router::state(pool));

        let response = make_request(
            app,
            Method::POST,
            "/forgot-password",
            json!({"email": "not-an-address"}).to_string(),
        )
        .await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[sqlx::test]
    async fn test_reset_requires_token_and_password(pool: Pool<Postgres>) {
        let app1 = app(router::state(pool.clone()));
        let response = make_request(
            app1,
            Method::POST,
            "/reset-password",
            json!({"token": "", "password": "s3cret1"}).to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let app = app(router::state(pool));
        let response = make_request(
            app,
            Method::POST,
            "/reset-password",
            json!({"token": "deadbeef", "password": "short"}).to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
