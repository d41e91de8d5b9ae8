use crate::{
    error_page::render_error_page,
    mailer::{DispatchError, Mailer, DEFAULT_SUBJECT},
    origin::AllowedOrigins,
    spam_log::{SpamLog, SpamRecord, StorageError},
    submission::{Classification, ContactFormMessage, HONEYPOT_REASON},
    token::TokenSecret,
};
use axum::{
    body::Bytes,
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};
use std::{net::SocketAddr, sync::Arc};
use thiserror::Error;
use tracing::{error, info, warn};

pub const SERVICE_NAME: &str = "contact-form-backend";
const SUCCESS_MESSAGE: &str = "Thanks! Your message was sent.";
const UNKNOWN_CLIENT: &str = "unknown";

pub fn router(handler: ContactFormMessageHandler) -> Router {
    Router::new()
        .route("/f/contact", any(contact_form))
        .route("/form-token.js", get(form_token_script))
        .route("/health", get(health))
        .with_state(Arc::new(handler))
}

async fn contact_form(
    State(handler): State<Arc<ContactFormMessageHandler>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let peer = connect_info.map(|ConnectInfo(address)| address);
    handler.handle(&method, &headers, peer, &body).await
}

async fn form_token_script(
    State(handler): State<Arc<ContactFormMessageHandler>>,
) -> impl IntoResponse {
    (
        [
            (header::CONTENT_TYPE, "application/javascript"),
            (header::CACHE_CONTROL, "no-store"),
        ],
        handler.form_token_script(Utc::now().timestamp()),
    )
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    }))
}

/// Everything needed to judge and forward a contact form submission.
pub struct ContactFormMessageHandler {
    secret: TokenSecret,
    origins: AllowedOrigins,
    mailer: Mailer,
    spam_log: SpamLog,
}

impl ContactFormMessageHandler {
    pub fn new(
        secret: TokenSecret,
        origins: AllowedOrigins,
        mailer: Mailer,
        spam_log: SpamLog,
    ) -> Self {
        Self {
            secret,
            origins,
            mailer,
            spam_log,
        }
    }

    pub async fn handle(
        &self,
        method: &Method,
        headers: &HeaderMap,
        peer: Option<SocketAddr>,
        body: &[u8],
    ) -> Response {
        let ip = client_ip(headers, peer);
        let declared_origin = headers.get(header::ORIGIN);
        let decision = self.origins.evaluate(declared_origin);
        let result = if decision.allowed {
            self.process_message(method, body, &ip).await
        } else {
            Err(ContactFormError::ForbiddenOrigin(
                declared_origin
                    .map(|origin| String::from_utf8_lossy(origin.as_bytes()).into_owned())
                    .unwrap_or_default(),
            ))
        };
        let mut response = match result {
            Ok(response) => response,
            Err(error) => {
                error.log(&ip);
                error.into_response()
            }
        };
        response.headers_mut().extend(decision.headers);
        response
    }

    async fn process_message(
        &self,
        method: &Method,
        body: &[u8],
        ip: &str,
    ) -> Result<Response, ContactFormError> {
        if method == Method::OPTIONS {
            return Ok(StatusCode::NO_CONTENT.into_response());
        }
        if method != Method::POST {
            return Err(ContactFormError::MethodNotAllowed(method.clone()));
        }

        let message: ContactFormMessage = serde_urlencoded::from_bytes(body)?;
        let now = Utc::now();
        let validated = match message.validate(&self.secret, now.timestamp(), ip) {
            Ok(validated) => validated,
            Err(Classification::Honeypot { field }) => {
                let record = SpamRecord::new(
                    now,
                    message.email.as_deref().unwrap_or_default(),
                    message.subject.as_deref().unwrap_or_default(),
                    message.message.as_deref().unwrap_or_default(),
                    HONEYPOT_REASON,
                    ip,
                );
                self.spam_log.append(&record).await?;
                info!(%ip, field, "Honeypot field triggered, likely a bot");
                return Ok(StatusCode::OK.into_response());
            }
            Err(Classification::InvalidToken) => return Err(ContactFormError::InvalidToken),
            Err(Classification::MissingFields) => return Err(ContactFormError::MissingFields),
        };

        info!(ip = validated.client_ip, "Form submission received");
        if let Err(error) = self.mailer.send_submission(&validated).await {
            return Err(ContactFormError::Dispatch {
                error,
                subject: validated.subject.unwrap_or(DEFAULT_SUBJECT).into(),
                message: validated.message.into(),
            });
        }
        info!(ip = validated.client_ip, "Message forwarded");

        let Some(next) = validated.next else {
            return Ok((StatusCode::OK, SUCCESS_MESSAGE).into_response());
        };
        match HeaderValue::from_str(next) {
            Ok(location) => Ok((StatusCode::SEE_OTHER, [(header::LOCATION, location)]).into_response()),
            Err(_) => {
                warn!(%ip, "Ignoring _next which is not a valid Location");
                Ok((StatusCode::OK, SUCCESS_MESSAGE).into_response())
            }
        }
    }

    /// Script which adds a freshly issued token as a hidden `_ts_token` input to every form on
    /// the page.
    pub fn form_token_script(&self, now: i64) -> String {
        let token = self.secret.issue(now);
        format!(
            r#"(function () {{
	const token = "{token}";
	const input = document.createElement("input");
	input.type = "hidden";
	input.name = "_ts_token";
	input.value = token;
	const forms = document.querySelectorAll("form");
	forms.forEach(form => form.appendChild(input.cloneNode(true)));
}})();"#
        )
    }
}

/// First `X-Forwarded-For` entry, then `X-Real-IP`, then the peer address.
fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(String::from)
    };
    let forwarded = header_value("x-forwarded-for").and_then(|value| {
        value
            .split(',')
            .next()
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
            .map(String::from)
    });
    let real_ip = header_value("x-real-ip")
        .map(|value| value.trim().to_string())
        .filter(|ip| !ip.is_empty());
    forwarded
        .or(real_ip)
        .or_else(|| peer.map(|address| address.ip().to_string()))
        .unwrap_or_else(|| UNKNOWN_CLIENT.into())
}

#[derive(Debug, Error)]
enum ContactFormError {
    #[error("Origin {0:?} is not allowed")]
    ForbiddenOrigin(String),
    #[error("Method {0} is not allowed")]
    MethodNotAllowed(Method),
    #[error("Malformed form body: {0}")]
    MalformedBody(#[from] serde_urlencoded::de::Error),
    #[error("Invalid or missing form token")]
    InvalidToken,
    #[error("Missing required fields")]
    MissingFields,
    #[error("{error}")]
    Dispatch {
        error: DispatchError,
        subject: String,
        message: String,
    },
    #[error("Failed to record spam: {0}")]
    Storage(#[from] StorageError),
}

impl ContactFormError {
    fn log(&self, ip: &str) {
        match self {
            ContactFormError::Dispatch { .. } | ContactFormError::Storage(_) => {
                error!(%ip, error = %self, "Internal error handling contact form");
            }
            _ => warn!(%ip, error = %self, "Rejected contact form request"),
        }
    }
}

impl IntoResponse for ContactFormError {
    fn into_response(self) -> Response {
        match self {
            ContactFormError::ForbiddenOrigin(_) => {
                (StatusCode::FORBIDDEN, "Forbidden").into_response()
            }
            ContactFormError::MethodNotAllowed(_) => {
                (StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed").into_response()
            }
            ContactFormError::MalformedBody(_) => {
                (StatusCode::BAD_REQUEST, "Bad Request").into_response()
            }
            ContactFormError::InvalidToken => {
                (StatusCode::BAD_REQUEST, "Invalid token").into_response()
            }
            ContactFormError::MissingFields => {
                (StatusCode::BAD_REQUEST, "Missing required fields").into_response()
            }
            ContactFormError::Dispatch {
                subject, message, ..
            } => match render_error_page(&subject, &message) {
                Ok(page) => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
                    page,
                )
                    .into_response(),
                Err(error) => {
                    error!(%error, "Could not render error page");
                    (StatusCode::INTERNAL_SERVER_ERROR, "Failed to send message").into_response()
                }
            },
            ContactFormError::Storage(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{client_ip, router, ContactFormMessageHandler};
    use crate::{
        mailer::Mailer,
        origin::AllowedOrigins,
        settings::{tests::fake_smtp_mail_settings, SpamLogSettings},
        spam_log::{SpamLog, SpamRecord},
        token::TokenSecret,
    };
    use axum::{
        body::{to_bytes, Body},
        http::{header, HeaderMap, HeaderValue, Method, Request},
        response::Response,
        Router,
    };
    use chrono::Utc;
    use googletest::prelude::*;
    use serial_test::serial;
    use std::{net::SocketAddr, time::Duration};
    use tempfile::{tempdir, TempDir};
    use test_support::{
        fake_smtp::{fake_smtp, start_poisoned_smtp_server, POISONED_SMTP_PORT, SMTP_PORT},
        setup_logging,
    };
    use tokio::time::timeout;
    use tower::ServiceExt;

    const ALLOWED_ORIGIN: &str = "https://site.example";
    const HOUR: Duration = Duration::from_secs(60 * 60);

    struct Fixture {
        _dir: TempDir,
        secret: TokenSecret,
        spam_log: SpamLog,
        router: Router,
    }

    impl Fixture {
        fn new(smtp_port: u16) -> Self {
            setup_logging();
            let dir = tempdir().unwrap();
            let secret = TokenSecret::from_configured("router test secret value").unwrap();
            let spam_log = SpamLog::new(SpamLogSettings {
                dir: dir.path().join("spam"),
                ..Default::default()
            });
            let handler = ContactFormMessageHandler::new(
                secret.clone(),
                AllowedOrigins::parse(ALLOWED_ORIGIN),
                Mailer::new(fake_smtp_mail_settings(smtp_port)),
                spam_log.clone(),
            );
            Self {
                _dir: dir,
                secret,
                spam_log,
                router: router(handler),
            }
        }

        fn fresh_token(&self) -> String {
            self.secret.issue(Utc::now().timestamp() - 10)
        }

        fn form(&self, extra: &[(&str, &str)]) -> Vec<(String, String)> {
            let token = self.fresh_token();
            let mut fields: Vec<(String, String)> = [
                ("name", "Arbitrary sender"),
                ("email", "email@example.com"),
                ("subject", "Test"),
                ("message", "Test message"),
                ("_ts_token", token.as_str()),
            ]
            .into_iter()
            .chain(extra.iter().copied())
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
            // Later entries replace earlier ones so that tests can override defaults.
            let mut seen = std::collections::HashSet::new();
            fields.reverse();
            fields.retain(|(key, _)| seen.insert(key.clone()));
            fields.reverse();
            fields
        }

        async fn send(&self, request: Request<Body>) -> Response {
            self.router.clone().oneshot(request).await.unwrap()
        }

        async fn post(&self, fields: &[(String, String)]) -> Response {
            self.send(form_request(fields, None)).await
        }

        async fn spam_records(&self) -> Vec<SpamRecord> {
            self.spam_log.query(HOUR).await.unwrap()
        }
    }

    fn form_request(fields: &[(String, String)], origin: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri("/f/contact")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header("X-Forwarded-For", "203.0.113.7, 10.0.0.1");
        if let Some(origin) = origin {
            builder = builder.header(header::ORIGIN, origin);
        }
        builder
            .body(Body::from(serde_urlencoded::to_string(fields).unwrap()))
            .unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[googletest::test]
    #[tokio::test]
    #[serial]
    async fn forwards_clean_submission() {
        fake_smtp().flush().await;
        let fixture = Fixture::new(SMTP_PORT);

        let response = fixture.post(&fixture.form(&[])).await;

        expect_that!(response.status().as_u16(), eq(200));
        expect_that!(body_text(response).await, eq("Thanks! Your message was sent."));
        expect_that!(
            timeout(Duration::from_secs(1), fake_smtp().last_mail_content()).await,
            ok(ok(contains_substring("Test message")))
        );
        expect_that!(fake_smtp().received_mails(), len(eq(1)));
        expect_that!(fixture.spam_records().await, empty());
    }

    #[googletest::test]
    #[tokio::test]
    #[serial]
    async fn redirects_to_next_after_sending() {
        fake_smtp().flush().await;
        let fixture = Fixture::new(SMTP_PORT);

        let response = fixture
            .post(&fixture.form(&[("_next", "https://site.example/thanks")]))
            .await;

        expect_that!(response.status().as_u16(), eq(303));
        expect_that!(
            response.headers().get(header::LOCATION),
            some(eq("https://site.example/thanks"))
        );
        expect_that!(
            timeout(Duration::from_secs(1), fake_smtp().last_mail_content()).await,
            ok(ok(anything()))
        );
    }

    #[googletest::test]
    #[tokio::test]
    #[serial]
    async fn records_honeypot_submission_as_spam_without_sending() {
        fake_smtp().flush().await;
        let fixture = Fixture::new(SMTP_PORT);

        let response = fixture
            .post(&fixture.form(&[("_gotcha", "http://spam.example")]))
            .await;

        expect_that!(response.status().as_u16(), eq(200));
        expect_that!(body_text(response).await, eq(""));
        expect_that!(
            fixture.spam_records().await,
            elements_are![matches_pattern!(SpamRecord {
                sender_email: eq("email@example.com"),
                subject: eq("Test"),
                message: eq("Test message"),
                reason: eq("honeypot triggered"),
                client_ip: eq("203.0.113.7"),
            })]
        );
        expect_that!(
            timeout(Duration::from_millis(200), fake_smtp().last_mail_content()).await,
            err(anything())
        );
        expect_that!(fake_smtp().received_mails(), empty());
    }

    #[googletest::test]
    #[tokio::test]
    #[serial]
    async fn nickname_honeypot_also_counts_as_spam() {
        fake_smtp().flush().await;
        let fixture = Fixture::new(SMTP_PORT);

        let response = fixture.post(&fixture.form(&[("nickname", "bot")])).await;

        expect_that!(response.status().as_u16(), eq(200));
        expect_that!(fixture.spam_records().await, len(eq(1)));
        expect_that!(fake_smtp().received_mails(), empty());
    }

    #[googletest::test]
    #[tokio::test]
    #[serial]
    async fn rejects_invalid_token_without_recording_spam() {
        fake_smtp().flush().await;
        let fixture = Fixture::new(SMTP_PORT);
        let stale = fixture.secret.issue(Utc::now().timestamp() - 3600);

        let response = fixture
            .post(&fixture.form(&[("_ts_token", stale.as_str()), ("_gotcha", "bot")]))
            .await;

        expect_that!(response.status().as_u16(), eq(400));
        expect_that!(body_text(response).await, eq("Invalid token"));
        expect_that!(fixture.spam_records().await, empty());
        expect_that!(fake_smtp().received_mails(), empty());
    }

    #[googletest::test]
    #[tokio::test]
    #[serial]
    async fn rejects_missing_fields() {
        fake_smtp().flush().await;
        let fixture = Fixture::new(SMTP_PORT);

        let response = fixture.post(&fixture.form(&[("email", "  ")])).await;

        expect_that!(response.status().as_u16(), eq(400));
        expect_that!(body_text(response).await, eq("Missing required fields"));
        expect_that!(fake_smtp().received_mails(), empty());
    }

    #[tokio::test]
    async fn rejects_malformed_body() -> Result<()> {
        let fixture = Fixture::new(SMTP_PORT);
        let request = Request::builder()
            .method(Method::POST)
            .uri("/f/contact")
            .body(Body::from("name=a&name=b"))
            .unwrap();

        let response = fixture.send(request).await;

        verify_that!(response.status().as_u16(), eq(400))
    }

    #[googletest::test]
    #[tokio::test]
    #[serial]
    async fn renders_error_page_when_mail_cannot_be_sent() {
        start_poisoned_smtp_server();
        let fixture = Fixture::new(POISONED_SMTP_PORT);

        let response = fixture
            .post(&fixture.form(&[("message", "Hello <b>there</b>")]))
            .await;

        expect_that!(response.status().as_u16(), eq(500));
        expect_that!(
            response.headers().get(header::CONTENT_TYPE),
            some(eq("text/html; charset=utf-8"))
        );
        expect_that!(
            body_text(response).await,
            all!(
                contains_substring("Something went wrong"),
                contains_substring("<h2>Test</h2>"),
                contains_substring("Hello &lt;b&gt;there&lt;/b&gt;")
            )
        );
    }

    #[googletest::test]
    #[tokio::test]
    async fn rejects_disallowed_origin() {
        let fixture = Fixture::new(SMTP_PORT);

        let response = fixture
            .send(form_request(&fixture.form(&[]), Some("https://evil.example")))
            .await;

        expect_that!(response.status().as_u16(), eq(403));
        expect_that!(
            response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN),
            none()
        );
        expect_that!(body_text(response).await, eq("Forbidden"));
    }

    #[googletest::test]
    #[tokio::test]
    async fn answers_preflight_for_allowed_origin() {
        let fixture = Fixture::new(SMTP_PORT);
        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/f/contact")
            .header(header::ORIGIN, ALLOWED_ORIGIN)
            .body(Body::empty())
            .unwrap();

        let response = fixture.send(request).await;

        expect_that!(response.status().as_u16(), eq(204));
        expect_that!(
            response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN),
            some(eq(ALLOWED_ORIGIN))
        );
        expect_that!(
            response.headers().get(header::ACCESS_CONTROL_ALLOW_METHODS),
            some(eq("POST, OPTIONS"))
        );
    }

    #[googletest::test]
    #[tokio::test]
    #[serial]
    async fn adds_cors_headers_to_allowed_submission() {
        fake_smtp().flush().await;
        let fixture = Fixture::new(SMTP_PORT);

        let response = fixture
            .send(form_request(&fixture.form(&[]), Some(ALLOWED_ORIGIN)))
            .await;

        expect_that!(response.status().as_u16(), eq(200));
        expect_that!(
            response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN),
            some(eq(ALLOWED_ORIGIN))
        );
        expect_that!(
            timeout(Duration::from_secs(1), fake_smtp().last_mail_content()).await,
            ok(ok(anything()))
        );
    }

    #[tokio::test]
    async fn rejects_other_methods() -> Result<()> {
        let fixture = Fixture::new(SMTP_PORT);
        let request = Request::builder()
            .method(Method::GET)
            .uri("/f/contact")
            .body(Body::empty())
            .unwrap();

        let response = fixture.send(request).await;

        verify_that!(response.status().as_u16(), eq(405))
    }

    #[googletest::test]
    #[tokio::test]
    async fn serves_token_script() {
        let fixture = Fixture::new(SMTP_PORT);
        let request = Request::builder()
            .uri("/form-token.js")
            .body(Body::empty())
            .unwrap();

        let response = fixture.send(request).await;

        expect_that!(response.status().as_u16(), eq(200));
        expect_that!(
            response.headers().get(header::CONTENT_TYPE),
            some(eq("application/javascript"))
        );
        expect_that!(
            response.headers().get(header::CACHE_CONTROL),
            some(eq("no-store"))
        );
        let script = body_text(response).await;
        expect_that!(script, contains_substring(r#"input.name = "_ts_token";"#));
        let token = script
            .split_once(r#"const token = ""#)
            .and_then(|(_, rest)| rest.split_once('"'))
            .map(|(token, _)| token.to_string())
            .unwrap();
        expect_that!(
            fixture.secret.validate(&token, Utc::now().timestamp() + 10),
            eq(true)
        );
    }

    #[googletest::test]
    #[tokio::test]
    async fn reports_health() {
        let fixture = Fixture::new(SMTP_PORT);
        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();

        let response = fixture.send(request).await;

        expect_that!(response.status().as_u16(), eq(200));
        let health: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        expect_that!(health["status"].as_str(), some(eq("healthy")));
        expect_that!(health["service"].as_str(), some(eq("contact-form-backend")));
        expect_that!(
            health["timestamp"]
                .as_str()
                .map(chrono::DateTime::parse_from_rfc3339),
            some(ok(anything()))
        );
    }

    #[test]
    fn client_ip_prefers_first_forwarded_address() -> Result<()> {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static(" 198.51.100.2 , 10.0.0.1"));
        headers.insert("x-real-ip", HeaderValue::from_static("10.0.0.2"));

        verify_that!(client_ip(&headers, None), eq("198.51.100.2"))
    }

    #[test]
    fn client_ip_falls_back_to_real_ip_then_peer() -> Result<()> {
        let peer: SocketAddr = "192.0.2.9:51234".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("10.0.0.2"));

        verify_that!(client_ip(&headers, Some(peer)), eq("10.0.0.2"))?;
        verify_that!(client_ip(&HeaderMap::new(), Some(peer)), eq("192.0.2.9"))?;
        verify_that!(client_ip(&HeaderMap::new(), None), eq("unknown"))
    }
}
