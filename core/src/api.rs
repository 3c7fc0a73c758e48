// III-IV
// Copyright 2023 Julio Merino
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not
// use this file except in compliance with the License.  You may obtain a copy
// of the License at:
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.  See the
// License for the specific language governing permissions and limitations
// under the License.

//! Bootstrapping of HTTP API servers.
//!
//! Services provide their own `axum::Router` and a settings type that embeds `ApiConfig`.  The
//! launcher then calls `init_logging`, `configure_app` and `run_server` in that order.

use crate::config::{Field, Kind, Schema, Settings, in_range, one_of, starts_with};
use crate::storage::StorageError;
use axum::Json;
use axum::Router;
use axum::http::{HeaderName, HeaderValue, Method};
use axum::response::IntoResponse;
use log::info;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};

/// Accepted values for the `log_level` setting.
const LOG_LEVELS: &[&str] = &["critical", "error", "warning", "info", "debug", "trace"];

/// Wildcard value for the CORS settings.
const ANY: &str = "*";

/// Verbosity of the service logs.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only critical failures.  Equivalent to `Error` as the `log` facade has no higher level.
    Critical,

    /// Errors.
    Error,

    /// Warnings and errors.
    Warning,

    /// Informational messages.
    Info,

    /// Debugging messages.
    Debug,

    /// Everything.
    Trace,
}

impl From<LogLevel> for log::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Critical | LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warning => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

/// Settings for an HTTP API server.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ApiConfig {
    /// Address to bind to.
    pub host: String,

    /// Port to listen on.
    pub port: u16,

    /// Verbosity of the logs.
    pub log_level: LogLevel,

    /// Path under which all routes are served.
    pub api_root_path: String,

    /// Origins allowed to make cross-origin requests, or `*` for any.
    pub cors_allowed_origins: Option<Vec<String>>,

    /// Whether cross-origin requests may carry credentials.
    pub cors_allow_credentials: Option<bool>,

    /// Methods allowed in cross-origin requests, or `*` for any.
    pub cors_allowed_methods: Option<Vec<String>>,

    /// Headers allowed in cross-origin requests, or `*` for any.
    pub cors_allowed_headers: Option<Vec<String>>,
}

impl Settings for ApiConfig {
    fn schema() -> Schema {
        Schema::new()
            .field(
                Field::with_default("host", Kind::String, "127.0.0.1")
                    .describe("Address to bind to"),
            )
            .field(
                Field::with_default("port", Kind::Integer, 8080)
                    .describe("Port to listen on")
                    .check(in_range(1, 65535)),
            )
            .field(
                Field::with_default("log_level", Kind::String, "info")
                    .describe("Verbosity of the logs")
                    .check(one_of(LOG_LEVELS)),
            )
            .field(
                Field::with_default("api_root_path", Kind::String, "/")
                    .describe("Path under which all routes are served")
                    .check(starts_with("/")),
            )
            .field(
                Field::optional("cors_allowed_origins", Kind::list_of(Kind::String))
                    .describe("Origins allowed to make cross-origin requests"),
            )
            .field(
                Field::optional("cors_allow_credentials", Kind::Boolean)
                    .describe("Whether cross-origin requests may carry credentials"),
            )
            .field(
                Field::optional("cors_allowed_methods", Kind::list_of(Kind::String))
                    .describe("Methods allowed in cross-origin requests"),
            )
            .field(
                Field::optional("cors_allowed_headers", Kind::list_of(Kind::String))
                    .describe("Headers allowed in cross-origin requests"),
            )
    }
}

/// Errors while setting up or running the server.
#[derive(Debug, PartialEq, thiserror::Error)]
pub enum ServerError {
    /// Indicates that a CORS setting contains an unusable value.
    #[error("Invalid value '{value}' in {field}")]
    InvalidCors {
        /// Name of the offending setting.
        field: &'static str,

        /// The value that could not be parsed.
        value: String,
    },

    /// Indicates a failure while binding to or serving on the socket.
    #[error("Server I/O error: {0}")]
    Io(String),
}

/// Result type for server bootstrapping operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Initializes logging at the level configured in `config`.
///
/// `RUST_LOG` can refine the configured level.  Calling this more than once has no effect.
pub fn init_logging(config: &ApiConfig) {
    let _can_fail = env_logger::Builder::new()
        .filter_level(config.log_level.into())
        .parse_default_env()
        .try_init();
}

/// Parses the `values` of the CORS setting `field` into typed values.
fn parse_cors_values<T, F>(
    field: &'static str,
    values: &[String],
    parse: F,
) -> ServerResult<Vec<T>>
where
    F: Fn(&str) -> Option<T>,
{
    values
        .iter()
        .map(|v| parse(v).ok_or_else(|| ServerError::InvalidCors { field, value: v.clone() }))
        .collect()
}

/// Builds the CORS layer described by `config`.
///
/// Wildcards combined with credentials mirror the request's values, as the CORS protocol does not
/// allow a literal `*` in that case.
fn cors_layer(config: &ApiConfig) -> ServerResult<CorsLayer> {
    let credentials = config.cors_allow_credentials.unwrap_or(false);
    let mut layer = CorsLayer::new().allow_credentials(credentials);

    if let Some(origins) = &config.cors_allowed_origins {
        layer = if origins.iter().any(|o| o == ANY) {
            if credentials {
                layer.allow_origin(AllowOrigin::mirror_request())
            } else {
                layer.allow_origin(AllowOrigin::any())
            }
        } else {
            let origins = parse_cors_values("cors_allowed_origins", origins, |v| {
                HeaderValue::from_str(v).ok()
            })?;
            layer.allow_origin(origins)
        };
    }

    let methods = match &config.cors_allowed_methods {
        Some(methods) => methods.clone(),
        None => vec![Method::GET.to_string()],
    };
    layer = if methods.iter().any(|m| m == ANY) {
        if credentials {
            layer.allow_methods(AllowMethods::mirror_request())
        } else {
            layer.allow_methods(AllowMethods::any())
        }
    } else {
        let methods = parse_cors_values("cors_allowed_methods", &methods, |v| {
            Method::from_bytes(v.to_ascii_uppercase().as_bytes()).ok()
        })?;
        layer.allow_methods(methods)
    };

    if let Some(headers) = &config.cors_allowed_headers {
        layer = if headers.iter().any(|h| h == ANY) {
            if credentials {
                layer.allow_headers(AllowHeaders::mirror_request())
            } else {
                layer.allow_headers(AllowHeaders::any())
            }
        } else {
            let headers = parse_cors_values("cors_allowed_headers", headers, |v| {
                HeaderName::from_bytes(v.as_bytes()).ok()
            })?;
            layer.allow_headers(headers)
        };
    }

    Ok(layer)
}

/// Wraps the service's `app` with the settings in `config`.
///
/// The app is nested under `api_root_path` unless that is `/`, and a CORS layer built from the
/// `cors_*` settings is applied to all routes.
pub fn configure_app(app: Router, config: &ApiConfig) -> ServerResult<Router> {
    let root = config.api_root_path.trim_end_matches('/');
    let app = if root.is_empty() { app } else { Router::new().nest(root, app) };
    Ok(app.layer(cors_layer(config)?))
}

/// Binds to the address configured in `config`.
pub async fn bind(config: &ApiConfig) -> ServerResult<TcpListener> {
    let listener = TcpListener::bind((config.host.as_str(), config.port)).await.map_err(|e| {
        ServerError::Io(format!("Cannot bind to {}:{}: {}", config.host, config.port, e))
    })?;
    if let Ok(addr) = listener.local_addr() {
        info!("Listening on {}", addr);
    }
    Ok(listener)
}

/// Serves `app` on an already-bound `listener` until an I/O error occurs.
pub async fn serve(listener: TcpListener, app: Router) -> ServerResult<()> {
    axum::serve(listener, app).await.map_err(|e| ServerError::Io(e.to_string()))
}

/// Serves `app` on the address configured in `config` until an I/O error occurs.
pub async fn run_server(app: Router, config: &ApiConfig) -> ServerResult<()> {
    let listener = bind(config).await?;
    serve(listener, app).await
}

/// Frontend errors.  These are the errors that are visible to the user on failed requests.
#[derive(Debug, PartialEq, thiserror::Error)]
pub enum RestError {
    /// Catch-all error type for all unexpected errors.
    #[error("{0}")]
    InternalError(String),

    /// Indicates an error in the contents of the request.
    #[error("{0}")]
    InvalidRequest(String),

    /// Indicates that the request conflicts with the current state of an entity.
    #[error("{0}")]
    Conflict(String),

    /// Indicates that a requested entity does not exist.
    #[error("{0}")]
    NotFound(String),
}

impl From<serde_json::Error> for RestError {
    fn from(e: serde_json::Error) -> Self {
        RestError::InvalidRequest(e.to_string())
    }
}

impl From<StorageError> for RestError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::BucketNotFound(_)
            | StorageError::ObjectNotFound { .. }
            | StorageError::MultiPartUploadNotFound { .. } => RestError::NotFound(e.to_string()),
            StorageError::BucketAlreadyExists(_)
            | StorageError::BucketNotEmpty(_)
            | StorageError::ObjectAlreadyExists { .. } => RestError::Conflict(e.to_string()),
            StorageError::InvalidBucketId { .. }
            | StorageError::InvalidObjectId { .. }
            | StorageError::MultiPartUploadConfirm(_) => RestError::InvalidRequest(e.to_string()),
            StorageError::Bucket(_) | StorageError::Object(_) | StorageError::Backend(_) => {
                RestError::InternalError(e.to_string())
            }
        }
    }
}

impl IntoResponse for RestError {
    fn into_response(self) -> axum::response::Response {
        let status = match self {
            RestError::InternalError(_) => http::StatusCode::INTERNAL_SERVER_ERROR,
            RestError::InvalidRequest(_) => http::StatusCode::BAD_REQUEST,
            RestError::Conflict(_) => http::StatusCode::CONFLICT,
            RestError::NotFound(_) => http::StatusCode::NOT_FOUND,
        };

        let response = ErrorResponse { message: self.to_string() };

        (status, Json(response)).into_response()
    }
}

/// Result type for REST handlers.
pub type RestResult<T> = Result<T, RestError>;

/// Representation of the details of an error response.
#[derive(Debug, Deserialize, Serialize)]
pub(crate) struct ErrorResponse {
    /// Textual representation of the error message.
    pub(crate) message: String,
}

/// Common test code for API servers.
#[cfg(any(test, feature = "testutils"))]
pub mod testutils {
    use super::*;
    use axum::extract::Request;
    use axum::http;
    use serde::de::DeserializeOwned;
    use tower::util::ServiceExt;

    /// Maximum body size for testing purposes.
    const MAX_BODY_SIZE: usize = 1024;

    /// Builder for a single request to the API server.
    #[must_use]
    pub struct OneShotBuilder {
        /// The router for the app being tested.
        app: Router,

        /// Builder for the request that will be sent to the app.
        builder: http::request::Builder,
    }

    impl OneShotBuilder {
        /// Creates a new request against a given `method`/`uri` pair served by an `app` router.
        pub fn new<U: AsRef<str>>(app: Router, (method, uri): (Method, U)) -> Self {
            let builder = Request::builder().method(method).uri(uri.as_ref());
            Self { app, builder }
        }

        /// Sets the header `name` to `value` in the outgoing request.
        pub fn with_header<K, V>(mut self, name: K, value: V) -> Self
        where
            HeaderName: TryFrom<K>,
            <HeaderName as TryFrom<K>>::Error: Into<http::Error>,
            HeaderValue: TryFrom<V>,
            <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
        {
            self.builder = self.builder.header(name, value);
            self
        }

        /// Finishes building the request and sends it with an empty payload.
        pub async fn send_empty(self) -> ResponseChecker {
            let request = self.builder.body(axum::body::Body::empty()).unwrap();
            ResponseChecker::from(self.app.oneshot(request).await.unwrap())
        }
    }

    /// Type alias for the complex type returned by the `oneshot` function.
    type HttpResponse = hyper::Response<axum::body::Body>;

    /// Validator for the outcome of a request sent by a `OneShotBuilder`.
    #[must_use]
    pub struct ResponseChecker {
        /// Actual response that we received from the app.
        response: HttpResponse,

        /// Expected HTTP status code in the response above.
        exp_status: http::StatusCode,
    }

    impl From<HttpResponse> for ResponseChecker {
        fn from(response: HttpResponse) -> Self {
            Self { response, exp_status: http::StatusCode::OK }
        }
    }

    impl ResponseChecker {
        /// Sets the expected exit HTTP status to `status`.
        pub fn expect_status(mut self, status: http::StatusCode) -> Self {
            self.exp_status = status;
            self
        }

        /// Performs common validation operations on the response.
        pub fn verify(&self) {
            assert_eq!(self.exp_status, self.response.status());
        }

        /// Finishes checking the response and expects its body to be an `ErrorResponse` that
        /// matches `exp_re`.
        pub async fn expect_error(self, exp_re: &str) {
            self.verify();

            let body =
                axum::body::to_bytes(self.response.into_body(), MAX_BODY_SIZE).await.unwrap();
            let response: ErrorResponse = match serde_json::from_slice(&body) {
                Ok(response) => response,
                Err(e) => {
                    let body = String::from_utf8(body.to_vec()).unwrap();
                    panic!("Invalid error response due to {}; content was {}", e, body);
                }
            };
            let re = regex::Regex::new(exp_re).unwrap();
            assert!(
                re.is_match(&response.message),
                "Response content '{:?}' does not match re '{}'",
                response,
                exp_re
            );
        }

        /// Finishes checking the response and expects it to contain a valid JSON object of
        /// type `T`.
        pub async fn expect_json<T: DeserializeOwned>(self) -> T {
            self.verify();

            let body =
                axum::body::to_bytes(self.response.into_body(), MAX_BODY_SIZE).await.unwrap();
            serde_json::from_slice::<T>(&body).unwrap()
        }

        /// Finishes checking the response and expects its body to be valid UTF-8 and to match
        /// `exp_re`.
        pub async fn expect_text(self, exp_re: &str) {
            self.verify();

            let body =
                axum::body::to_bytes(self.response.into_body(), MAX_BODY_SIZE).await.unwrap();
            let body = String::from_utf8(body.to_vec()).unwrap();
            let re = regex::Regex::new(exp_re).unwrap();
            assert!(re.is_match(&body), "Body content '{}' does not match re '{}'", body, exp_re);
        }

        /// Finishes checking the response and returns the response itself for out of band
        /// validation of properties not supported by the `ResponseChecker`.
        pub async fn take_response(self) -> HttpResponse {
            self.verify();

            self.response
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutils::*;
    use super::*;
    use crate::config::ConfigLoader;
    use axum::routing::get;
    use serde_test::{Token, assert_de_tokens, assert_de_tokens_error};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Loads an `ApiConfig` with only the defaults and the given `overrides`.
    fn config_with(overrides: &[(&str, serde_json::Value)]) -> ApiConfig {
        let mut loader = ConfigLoader::new("api_test").with_search_dirs(vec![]);
        for (key, value) in overrides {
            loader = loader.with_override(*key, value.clone());
        }
        loader.load().unwrap()
    }

    /// Creates a trivial app with a greeting route and a route that always fails.
    fn app() -> Router {
        Router::new().route("/", get(|| async { "Hello" })).route(
            "/missing",
            get(|| async { Err::<(), RestError>(RestError::NotFound("No such thing".to_owned())) }),
        )
    }

    #[test]
    fn test_log_level_de() {
        assert_de_tokens(
            &LogLevel::Warning,
            &[Token::UnitVariant { name: "LogLevel", variant: "warning" }],
        );
        assert_de_tokens_error::<LogLevel>(
            &[Token::UnitVariant { name: "LogLevel", variant: "verbose" }],
            "unknown variant `verbose`, expected one of \
             `critical`, `error`, `warning`, `info`, `debug`, `trace`",
        );
        assert_eq!(log::LevelFilter::Error, log::LevelFilter::from(LogLevel::Critical));
        assert_eq!(log::LevelFilter::Warn, log::LevelFilter::from(LogLevel::Warning));
    }

    #[test]
    fn test_api_config_defaults() {
        temp_env::with_var_unset("API_TEST_PORT", || {
            assert_eq!(
                ApiConfig {
                    host: "127.0.0.1".to_owned(),
                    port: 8080,
                    log_level: LogLevel::Info,
                    api_root_path: "/".to_owned(),
                    cors_allowed_origins: None,
                    cors_allow_credentials: None,
                    cors_allowed_methods: None,
                    cors_allowed_headers: None,
                },
                config_with(&[])
            );
        });
    }

    #[test]
    fn test_api_config_from_env() {
        temp_env::with_vars(
            [
                ("API_ENV_PORT", Some("9090")),
                ("API_ENV_LOG_LEVEL", Some("debug")),
                ("API_ENV_CORS_ALLOWED_ORIGINS", Some(r#"["https://example.com"]"#)),
            ],
            || {
                let config: ApiConfig =
                    ConfigLoader::new("api_env").with_search_dirs(vec![]).load().unwrap();
                assert_eq!(9090, config.port);
                assert_eq!(LogLevel::Debug, config.log_level);
                let origins = Some(vec!["https://example.com".to_owned()]);
                assert_eq!(origins, config.cors_allowed_origins);
            },
        );
    }

    #[test]
    fn test_api_config_invalid() {
        let vars = [("API_BAD_PORT", Some("0")), ("API_BAD_LOG_LEVEL", Some("loud"))];
        temp_env::with_vars(vars, || {
            let loader = ConfigLoader::new("api_bad").with_search_dirs(vec![]);
            let err = loader.load::<ApiConfig>().unwrap_err();
            let fields = err.field_errors().iter().map(|e| e.field()).collect::<Vec<&str>>();
            assert_eq!(vec!["port", "log_level"], fields);
        });
    }

    #[tokio::test]
    async fn test_configure_app_default() {
        let app = configure_app(app(), &config_with(&[])).unwrap();
        OneShotBuilder::new(app.clone(), (http::Method::GET, "/"))
            .send_empty()
            .await
            .expect_text("Hello")
            .await;
        OneShotBuilder::new(app, (http::Method::GET, "/missing"))
            .send_empty()
            .await
            .expect_status(http::StatusCode::NOT_FOUND)
            .expect_error("No such thing")
            .await;
    }

    #[tokio::test]
    async fn test_configure_app_root_path() {
        let config = config_with(&[("api_root_path", serde_json::json!("/api/v1/"))]);
        let app = configure_app(app(), &config).unwrap();
        OneShotBuilder::new(app.clone(), (http::Method::GET, "/api/v1"))
            .send_empty()
            .await
            .expect_text("Hello")
            .await;
        OneShotBuilder::new(app, (http::Method::GET, "/"))
            .send_empty()
            .await
            .expect_status(http::StatusCode::NOT_FOUND)
            .take_response()
            .await;
    }

    #[tokio::test]
    async fn test_configure_app_cors_origins() {
        let config = config_with(&[
            ("cors_allowed_origins", serde_json::json!(["https://allowed.example.com"])),
            ("cors_allowed_methods", serde_json::json!(["get", "POST"])),
        ]);
        let app = configure_app(app(), &config).unwrap();

        let response = OneShotBuilder::new(app.clone(), (http::Method::GET, "/"))
            .with_header(http::header::ORIGIN, "https://allowed.example.com")
            .send_empty()
            .await
            .take_response()
            .await;
        assert_eq!(
            "https://allowed.example.com",
            response.headers().get(http::header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap()
        );

        let response = OneShotBuilder::new(app, (http::Method::GET, "/"))
            .with_header(http::header::ORIGIN, "https://other.example.com")
            .send_empty()
            .await
            .take_response()
            .await;
        assert!(response.headers().get(http::header::ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
    }

    #[tokio::test]
    async fn test_configure_app_cors_wildcard_with_credentials() {
        let config = config_with(&[
            ("cors_allowed_origins", serde_json::json!(["*"])),
            ("cors_allow_credentials", serde_json::json!(true)),
            ("cors_allowed_headers", serde_json::json!(["*"])),
        ]);
        let app = configure_app(app(), &config).unwrap();

        let response = OneShotBuilder::new(app, (http::Method::GET, "/"))
            .with_header(http::header::ORIGIN, "https://any.example.com")
            .send_empty()
            .await
            .take_response()
            .await;
        let headers = response.headers();
        assert_eq!(
            "https://any.example.com",
            headers.get(http::header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap()
        );
        assert_eq!("true", headers.get(http::header::ACCESS_CONTROL_ALLOW_CREDENTIALS).unwrap());
    }

    #[test]
    fn test_configure_app_invalid_cors() {
        let config =
            config_with(&[("cors_allowed_methods", serde_json::json!(["GET", "NOT A METHOD"]))]);
        assert_eq!(
            ServerError::InvalidCors {
                field: "cors_allowed_methods",
                value: "NOT A METHOD".to_owned()
            },
            configure_app(app(), &config).unwrap_err()
        );
    }

    #[test]
    fn test_rest_error_from_storage_error() {
        assert_eq!(
            RestError::NotFound("Bucket not found: b".to_owned()),
            RestError::from(StorageError::BucketNotFound("b".to_owned()))
        );
        match RestError::from(StorageError::Backend("boom".to_owned())) {
            RestError::InternalError(_) => (),
            e => panic!("Unexpected error {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_serve_on_listener() {
        let config = ApiConfig { port: 0, ..config_with(&[]) };
        let listener = bind(&config).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = configure_app(app(), &config).unwrap();
        tokio::spawn(serve(listener, app));

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"), "Got {}", response);
        assert!(response.ends_with("Hello"), "Got {}", response);
    }
}
