use axum::{Json, extract::State, http::StatusCode};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::AppState;
use crate::error::Result;
use crate::router::Valid;
use crate::user::RegistrationInput;

#[derive(Debug, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct Body {
    #[validate(length(min = 1, max = 64, message = "First name is required."))]
    pub first_name: String,
    #[validate(length(min = 1, max = 64, message = "Last name is required."))]
    pub last_name: String,
    #[validate(length(
        min = 3,
        max = 64,
        message = "Display name must be 3 to 64 characters."
    ))]
    pub display_name: String,
    #[validate(
        length(min = 3, max = 32),
        custom(
            function = "crate::router::validate_username",
            message = "Username must be alphanumeric."
        )
    )]
    pub username: String,
    #[validate(email(message = "Email must be formatted."))]
    pub email: String,
    #[validate(length(
        min = 6,
        max = 255,
        message = "Password must contain at least 6 characters."
    ))]
    pub password: String,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub username: String,
}

/// Handler to provision a user in both stores.
pub async fn handler(
    State(state): State<AppState>,
    Valid(body): Valid<Body>,
) -> Result<(StatusCode, Json<Response>)> {
    let input = RegistrationInput {
        first_name: body.first_name.trim().to_owned(),
        last_name: body.last_name.trim().to_owned(),
        display_name: body.display_name.trim().to_owned(),
        username: body.username.trim().to_owned(),
        email: body.email.trim().to_owned(),
        password: body.password,
    };

    let record = state.registrar().register(&input).await?;

    Ok((
        StatusCode::CREATED,
        Json(Response {
            username: record.ldap_uid,
        }),
    ))
}

#[cfg(test)]
pub(super) mod tests {
    use super::*;
    use crate::*;
    use axum::http::StatusCode;
    use serde_json::json;
    use sqlx::{Pool, Postgres};

    fn valid_body() -> serde_json::Value {
        json!({
            "firstName": "Alice",
            "lastName": "Archer",
            "displayName": "Alice A",
            "username": "alice",
            "email": "alice@example.com",
            "password": "s3cret1",
        })
    }

    #[sqlx::test]
    async fn test_register_with_short_password(pool: Pool<Postgres>) {
        let app = app(router::state(pool));

        let mut body = valid_body();
        body["password"] = json!("s3crt");
        let response =
            make_request(app, Method::POST, "/register", body.to_string())
                .await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[sqlx::test]
    async fn test_register_with_malformed_email(pool: Pool<Postgres>) {
        let app = app(router::state(pool));

        let mut body = valid_body();
        body["email"] = json!("not-an-address");
        let response =
            make_request(app, Method::POST, "/register", body.to_string())
                .await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[sqlx::test]
    async fn test_register_with_unsafe_username(pool: Pool<Postgres>) {
        let app = app(router::state(pool));

        let mut body = valid_body();
        body["username"] = json!("uid=admin,dc=example");
        let response =
            make_request(app, Method::POST, "/register", body.to_string())
                .await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[sqlx::test]
    async fn test_register_rejects_missing_fields(pool: Pool<Postgres>) {
        let app = app(router::state(pool));

        let response = make_request(
            app,
            Method::POST,
            "/register",
            json!({"username": "alice"}).to_string(),
        )
        .await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
