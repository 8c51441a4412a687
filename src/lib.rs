//! Bindery is an identity provisioning coordinator for deployments that
//! split accounts between a relational store and an LDAP directory.

#[forbid(unsafe_code)]
#[deny(missing_docs, unused_mut)]
mod crypto;
mod database;
mod ldap;
mod mail;
mod router;
mod user;

pub mod config;
pub mod error;
pub mod telemetry;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::http::{Method, StatusCode, header};
use axum::routing::{get, post};
use axum::{Router, middleware as AxumMiddleware};
use tower::ServiceBuilder;
use tower_http::LatencyUnit;
use tower_http::cors::{Any, CorsLayer};
use tower_http::sensitive_headers::SetSensitiveHeadersLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{
    DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer,
};

/// MUST NEVER be used in production.
#[cfg(test)]
pub async fn make_request(
    app: Router,
    method: Method,
    path: &str,
    body: String,
) -> axum::http::Response<axum::body::Body> {
    use axum::extract::Request;
    use tower::util::ServiceExt;

    app.oneshot(
        Request::builder()
            .method(method)
            .uri(path)
            .header(header::CONTENT_TYPE, "application/json")
            .body(axum::body::Body::from(body))
            .unwrap(),
    )
    .await
    .unwrap()
}

/// State sharing between routes.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<config::Configuration>,
    pub db: database::Database,
    pub ldap: ldap::Ldap,
    pub crypto: Arc<crypto::CredentialHasher>,
    pub mail: mail::MailManager,
}

impl AppState {
    pub(crate) fn repository(&self) -> user::UserRepository {
        user::UserRepository::new(
            self.db.postgres.clone(),
            self.config.tables.clone(),
        )
    }

    pub(crate) fn registrar(&self) -> user::IdentityRegistrar {
        user::IdentityRegistrar::new(
            self.repository(),
            self.ldap.clone(),
            Arc::clone(&self.crypto),
        )
    }

    pub(crate) fn authenticator(&self) -> user::Authenticator {
        user::Authenticator::new(self.repository(), self.ldap.clone())
    }

    pub(crate) fn reset_manager(&self) -> user::ResetTokenManager {
        let reset = self.config.reset.as_ref();
        let base_url = reset
            .and_then(|r| r.base_url.clone())
            .unwrap_or_else(|| self.config.url.clone());
        let ttl = chrono::Duration::seconds(
            reset.and_then(|r| r.token_ttl_secs).unwrap_or(3600),
        );

        user::ResetTokenManager::new(
            self.repository(),
            self.ldap.clone(),
            Arc::clone(&self.crypto),
            self.mail.clone(),
            base_url,
            ttl,
        )
    }
}

/// Create router.
pub fn app(state: AppState) -> Router {
    let middleware = ServiceBuilder::new()
        // Add high level tracing/logging to all requests.
        .layer(
            TraceLayer::new_for_http()
                .on_body_chunk(|chunk: &Bytes, latency: Duration, _span: &tracing::Span| {
                    tracing::trace!(size_bytes = chunk.len(), latency = ?latency, "sending body chunk")
                })
                .make_span_with(DefaultMakeSpan::new().include_headers(true).level(tracing::Level::INFO))
                .on_request(DefaultOnRequest::new())
                .on_response(DefaultOnResponse::new().include_headers(true).latency_unit(LatencyUnit::Micros)),
        )
        // Set a timeout.
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, Duration::from_secs(10)))
        // Remove senstive headers from trace.
        .layer(SetSensitiveHeadersLayer::new([header::AUTHORIZATION, header::COOKIE]))
        // Add CORS preflight support.
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers(Any)
                .vary([header::AUTHORIZATION]),
        );

    Router::new()
        // `GET /status.json` goes to `status`.
        .route("/status.json", get(router::status::status))
        // `POST /register` goes to `register`.
        .route("/register", post(router::register::handler))
        // `POST /login` goes to `login`.
        .route("/login", post(router::login::handler))
        // `POST /forgot-password` issues a reset token.
        .route("/forgot-password", post(router::password::forgot))
        // `POST /reset-password` consumes a reset token.
        .route("/reset-password", post(router::password::reset))
        // `GET /users` lists directory users.
        .route("/users", get(router::users::handler))
        .with_state(state)
        .route_layer(AxumMiddleware::from_fn(telemetry::track))
        .layer(middleware)
}

/// Initialize the application state.
pub async fn initialize_state() -> Result<AppState, Box<dyn std::error::Error>>
{
    // read configuration file. let it in memory.
    let config = config::Configuration::default().read()?;

    // the directory is authoritative for credentials; refuse to start
    // without it.
    let Some(ldap_config) = &config.ldap else {
        tracing::error!("missing `ldap` entry on `config.yaml` file");
        std::process::exit(0);
    };
    let ldap = ldap::Ldap::new(ldap::LdapConfig::from(ldap_config));

    let db = match config.postgres {
        Some(ref config) => {
            database::Database::new(
                &config.address,
                &config
                    .username
                    .clone()
                    .unwrap_or(database::DEFAULT_CREDENTIALS.into()),
                &config
                    .password
                    .clone()
                    .unwrap_or(database::DEFAULT_CREDENTIALS.into()),
                &config
                    .database
                    .clone()
                    .unwrap_or(database::DEFAULT_DATABASE_NAME.into()),
                config.pool_size.unwrap_or(database::DEFAULT_POOL_SIZE),
            )
            .await?
        },
        None => {
            // user records and the reset ledger live in PostgreSQL.
            tracing::error!("missing `postgres` entry on `config.yaml` file");
            std::process::exit(0);
        },
    };

    // execute migrations scripts on start.
    sqlx::migrate!().run(&db.postgres).await?;

    let crypto = Arc::new(crypto::CredentialHasher::new(config.argon2.clone())?);

    // handle mail sender.
    let mail = if let Some(cfg) = &config.mail {
        mail::MailManager::new(cfg).await?
    } else {
        mail::MailManager::default()
    };

    Ok(AppState {
        config,
        db,
        ldap,
        crypto,
        mail,
    })
}
