//! Error handler for bindery.

use axum::extract::rejection::JsonRejection;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use ldap3::LdapError;
use serde::Serialize;
use sqlx::{Error as SQLxError, postgres::PgDatabaseError};
use thiserror::Error;
use validator::ValidationErrors;

pub type Result<T> = std::result::Result<T, ServerError>;

/// Enum representing server-side errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("validation error occurred")]
    Validation(#[from] ValidationErrors),

    #[error(transparent)]
    Axum(#[from] JsonRejection),

    #[error("SQL request failed: {0}")]
    Sql(#[from] SQLxError),

    #[error("directory request failed: {0}")]
    Ldap(#[from] LdapError),

    #[error("mail queue request failed: {0}")]
    Lapin(#[from] lapin::Error),

    #[error("URL is invalid: {0}")]
    Url(#[from] url::ParseError),

    #[error("invalid amqp scheme")]
    InvalidScheme,

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Crypto(#[from] crate::crypto::CryptoError),

    #[error("directory bind credentials are not configured")]
    MissingBindCredentials,

    /// Uniqueness re-check failed; every violated constraint is carried.
    #[error("uniqueness constraints violated")]
    Conflict { fields: Vec<Conflict> },

    /// A directory step failed after the relational draft was written.
    #[error("account could not be provisioned")]
    Provisioning,

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("invalid or expired token")]
    InvalidToken,

    #[error("internal server error, {details}")]
    Internal {
        details: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// A uniqueness constraint violated during registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conflict {
    Username,
    Email,
}

impl Conflict {
    fn field(self) -> &'static str {
        match self {
            Conflict::Username => "username",
            Conflict::Email => "email",
        }
    }

    fn message(self) -> &'static str {
        match self {
            Conflict::Username => "Username already exists.",
            Conflict::Email => "Email already registered.",
        }
    }
}

/// Structure for detailed error responses.
#[derive(Debug, Serialize)]
pub struct ResponseError {
    r#type: Option<String>,
    title: String,
    status: u16,
    detail: String,
    instance: Option<String>,
    errors: Option<Vec<FieldError>>,
}

impl ResponseError {
    /// Update error status code.
    pub fn status(mut self, code: StatusCode) -> Self {
        self.status = code.as_u16();
        self
    }

    /// Update `title` field.
    pub fn title(mut self, title: &str) -> Self {
        self.title = title.into();
        self
    }

    /// Add detailed error.
    pub fn details(mut self, description: &str) -> Self {
        self.detail = description.into();
        self
    }

    /// Automatically add errors field.
    pub fn errors(mut self, errors: &ValidationErrors) -> Self {
        self.errors = Some(parse_validation_errors(errors));
        self
    }

    /// Add one field error per violated uniqueness constraint.
    pub fn conflicts(mut self, fields: &[Conflict]) -> Self {
        self.errors = Some(
            fields
                .iter()
                .map(|conflict| FieldError {
                    field: conflict.field().to_owned(),
                    message: conflict.message().to_owned(),
                })
                .collect(),
        );
        self
    }

    /// Transform [`ResponseError`] into axum [`Response`].
    pub fn into_response(
        self,
    ) -> std::result::Result<Response, axum::http::Error> {
        if let Ok(body) = serde_json::to_string(&self) {
            Response::builder()
                .status(self.status)
                .header(header::CONTENT_TYPE, "application/json")
                .body(body.into())
        } else {
            Ok(internal_server_error())
        }
    }
}

impl Default for ResponseError {
    fn default() -> Self {
        Self {
            r#type: None,
            title: "Internal server error.".to_owned(),
            status: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
            detail: String::default(),
            instance: None,
            errors: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct FieldError {
    field: String,
    message: String,
}

fn parse_validation_errors(errors: &ValidationErrors) -> Vec<FieldError> {
    errors
        .field_errors()
        .iter()
        .flat_map(|(field, issues)| {
            issues.iter().map(move |issue| FieldError {
                field: field.to_string(),
                message: issue.to_string(),
            })
        })
        .collect()
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let response = ResponseError::default()
            .title("There were validation errors with your request.")
            .details(&self.to_string())
            .status(StatusCode::BAD_REQUEST);

        let response = match &self {
            ServerError::Validation(validation_errors) => {
                response.errors(validation_errors)
            },

            ServerError::Conflict { fields } => response
                .title("Account details are already in use.")
                .details("One or more identifiers are already registered.")
                .conflicts(fields)
                .status(StatusCode::CONFLICT),

            // Resolution misses, bind failures and wrong passwords all land
            // here with one fixed message.
            ServerError::InvalidCredentials => response
                .title("Invalid credentials.")
                .details("Invalid credentials.")
                .status(StatusCode::UNAUTHORIZED),

            // Unknown, expired and already-consumed tokens are
            // indistinguishable.
            ServerError::InvalidToken => response
                .title("Invalid or expired token.")
                .details("Invalid or expired token."),

            ServerError::Provisioning => {
                tracing::error!("registration failed after relational draft");

                ResponseError::default()
                    .title("Account could not be provisioned.")
                    .details("Please try again later.")
            },

            ServerError::Sql(err) => {
                tracing::error!(error = %err, "relational store failure");

                ResponseError::default().details(
                    err.as_database_error()
                        .and_then(|e| {
                            e.downcast_ref::<PgDatabaseError>().detail()
                        })
                        .unwrap_or("The relational store is unavailable."),
                )
            },

            ServerError::Ldap(err) => {
                tracing::error!(error = %err, "directory failure");

                ResponseError::default()
                    .details("The directory is unavailable.")
            },

            ServerError::MissingBindCredentials => {
                tracing::error!("service bind attempted without credentials");

                ResponseError::default()
            },

            ServerError::Internal { details, source } => {
                tracing::error!(?source, %details, "server returned 500 status");

                ResponseError::default()
            },

            ServerError::Lapin(_)
            | ServerError::Url(_)
            | ServerError::InvalidScheme
            | ServerError::Json(_)
            | ServerError::Crypto(_) => {
                tracing::error!(error = %self, "server returned 500 status");

                ResponseError::default()
            },

            _ => response,
        };

        response
            .into_response()
            .unwrap_or_else(|_| internal_server_error())
    }
}

fn internal_server_error() -> Response {
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header(header::CONTENT_TYPE, "application/json")
        .body(
            serde_json::json!({
                "type": null,
                "title": "Internal server error.",
                "status": StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
                "detail": null,
                "instance": null,
                "errors": null,
            })
            .to_string()
            .into(),
        )
        .unwrap_or_else(|_| Response::new("Internal server error".into()))
}
