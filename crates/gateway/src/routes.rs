//! Gateway HTTP surface.
//!
//! `/health`, the OIDC login pair (`/login`, `/callback`), the WebSocket
//! terminal endpoint (`/ws`), and a catch-all reverse proxy for the
//! terminal's plain-HTTP assets. Bearer tokens are taken from the
//! `Authorization` header, then the session cookie, then the `?token=`
//! query parameter; the query fallback exists because the browser WebSocket
//! API cannot set request headers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::auth::TokenValidator;
use crate::lifecycle::WorkspaceLifecycle;
use crate::oidc::AuthCodeFlow;
use crate::proxy;

/// CSRF nonce cookie set by `/login` and consumed by `/callback`.
const STATE_COOKIE: &str = "devplane_state";

/// Session cookie carrying the OIDC id token.
const TOKEN_COOKIE: &str = "devplane_token";

/// CSRF cookie lifetime.
const STATE_COOKIE_MAX_AGE: u64 = 600;

/// Session lifetime when the provider does not report one.
const FALLBACK_SESSION_AGE: Duration = Duration::from_secs(3600);

/// Minimum spacing between `lastAccessed` updates per connection.
const ACTIVITY_INTERVAL: Duration = Duration::from_secs(60);

/// Shared handler state. The validator, flow, and lifecycle are dynamic so
/// handler tests can substitute doubles.
pub struct AppState {
    pub validator: Arc<dyn TokenValidator>,
    pub oidc: Arc<dyn AuthCodeFlow>,
    pub lifecycle: Arc<dyn WorkspaceLifecycle>,
    pub http: reqwest::Client,
    pub namespace: String,
    pub cookie_secure: bool,
}

/// Builds the gateway router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/login", get(login))
        .route("/callback", get(callback))
        .route("/ws", get(serve_terminal))
        .fallback(proxy_http)
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

/// Starts the OIDC authorization-code flow: set the CSRF cookie and send
/// the browser to the identity provider.
async fn login(State(state): State<Arc<AppState>>) -> Response {
    let nonce = random_nonce();
    let url = state.oidc.authorize_url(nonce.clone());

    Response::builder()
        .status(StatusCode::FOUND)
        .header(header::LOCATION, url)
        .header(
            header::SET_COOKIE,
            set_cookie(STATE_COOKIE, &nonce, STATE_COOKIE_MAX_AGE, state.cookie_secure),
        )
        .body(Body::empty())
        .unwrap()
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    #[serde(default)]
    code: String,
    #[serde(default)]
    state: String,
}

/// Completes the login flow: check the CSRF state, exchange the code,
/// validate the id token, set the session cookie, and land on `/`.
async fn callback(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<CallbackQuery>,
) -> Response {
    let Some(cookie_state) = cookie_value(&headers, STATE_COOKIE) else {
        return text_response(StatusCode::BAD_REQUEST, "Missing state cookie");
    };
    if query.state.is_empty() || query.state != cookie_state {
        return text_response(StatusCode::BAD_REQUEST, "State mismatch");
    }

    let (raw_id_token, expires_in) = match state.oidc.exchange_code(query.code).await {
        Ok(exchange) => exchange,
        Err(error) => {
            error!(%error, "Token exchange failed");
            return text_response(StatusCode::BAD_GATEWAY, "Token exchange failed");
        }
    };

    if let Err(error) = state.validator.validate(&raw_id_token).await {
        warn!(%error, "Rejected id token from callback");
        return text_response(StatusCode::UNAUTHORIZED, "Invalid ID token");
    }

    let session_age = expires_in.unwrap_or(FALLBACK_SESSION_AGE).as_secs();
    Response::builder()
        .status(StatusCode::FOUND)
        .header(header::LOCATION, "/")
        .header(
            header::SET_COOKIE,
            set_cookie(TOKEN_COOKIE, &raw_id_token, session_age, state.cookie_secure),
        )
        .header(
            header::SET_COOKIE,
            clear_cookie(STATE_COOKIE, state.cookie_secure),
        )
        .body(Body::empty())
        .unwrap()
}

/// The terminal endpoint: authenticate, provision, then relay WebSocket
/// frames between the browser and the workspace pod.
async fn serve_terminal(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let Some(token) = extract_token(&headers, &query) else {
        info!("Missing token on /ws");
        return text_response(StatusCode::UNAUTHORIZED, "Unauthorized");
    };
    let claims = match state.validator.validate(&token).await {
        Ok(claims) => claims,
        Err(error) => {
            info!(%error, "Invalid token on /ws");
            return text_response(StatusCode::UNAUTHORIZED, "Unauthorized");
        }
    };

    let workspace = match state
        .lifecycle
        .ensure_workspace(&state.namespace, &claims)
        .await
    {
        Ok(workspace) => workspace,
        Err(error) => {
            error!(user = %claims.user_id, %error, "EnsureWorkspace failed");
            return text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to provision workspace",
            );
        }
    };

    let endpoint = workspace
        .status
        .as_ref()
        .and_then(|status| status.service_endpoint.clone())
        .unwrap_or_default();
    let backend_url = proxy::backend_ws_url(&endpoint);
    info!(user = %claims.user_id, backend = %backend_url, "Proxying WebSocket");

    // Update lastAccessed at most once per minute per connection, so the
    // idle-eviction check sees genuine activity rather than the connect
    // timestamp alone.
    let last_touch: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));
    let activity_state = state.clone();
    let activity_workspace = workspace.clone();
    let on_activity: proxy::ActivityFn = Arc::new(move || {
        let mut last = last_touch.lock();
        if last.is_some_and(|touched| touched.elapsed() < ACTIVITY_INTERVAL) {
            return;
        }
        *last = Some(Instant::now());
        let state = activity_state.clone();
        let workspace = activity_workspace.clone();
        tokio::spawn(async move {
            state.lifecycle.touch_last_accessed(&workspace).await;
        });
    });

    let user_id = claims.user_id;
    let handshake_started = Instant::now();
    upgrade.on_upgrade(move |socket| async move {
        // The upgraded socket arrives only once the protocol switch
        // completes; a client that stalled the handshake past the deadline
        // is dropped instead of being given a relay.
        if proxy::handshake_expired(handshake_started, Instant::now()) {
            warn!(user = %user_id, "WebSocket handshake exceeded deadline; dropping connection");
            return;
        }
        if let Err(error) = proxy::serve_ws(socket, &backend_url, Some(on_activity)).await {
            info!(user = %user_id, %error, "WebSocket session ended");
        }
    })
}

/// Catch-all: authenticated plain-HTTP requests (the terminal's web UI) are
/// reverse-proxied to the workspace pod; everything else bounces to login.
async fn proxy_http(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
    request: Request,
) -> Response {
    let headers = request.headers().clone();
    let Some(token) = extract_token(&headers, &query) else {
        return redirect_to_login(&state, false);
    };
    let claims = match state.validator.validate(&token).await {
        Ok(claims) => claims,
        // Clear the stale session cookie on the way to login.
        Err(_) => return redirect_to_login(&state, true),
    };

    let workspace = match state
        .lifecycle
        .ensure_workspace(&state.namespace, &claims)
        .await
    {
        Ok(workspace) => workspace,
        Err(error) => {
            error!(user = %claims.user_id, %error, "EnsureWorkspace failed");
            return text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to provision workspace",
            );
        }
    };

    let endpoint = workspace
        .status
        .as_ref()
        .and_then(|status| status.service_endpoint.clone())
        .unwrap_or_default();

    forward_request(&state, &endpoint, request).await
}

/// Forwards one plain-HTTP request to the workspace and relays the response.
async fn forward_request(state: &AppState, endpoint: &str, request: Request) -> Response {
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let url = format!("{}{path_and_query}", proxy::backend_http_url(endpoint));

    let method = reqwest::Method::from_bytes(request.method().as_str().as_bytes())
        .unwrap_or(reqwest::Method::GET);
    let headers = request.headers().clone();

    let body = match axum::body::to_bytes(request.into_body(), usize::MAX).await {
        Ok(bytes) => bytes,
        Err(error) => {
            warn!(%error, "Failed to read proxied request body");
            return text_response(StatusCode::BAD_REQUEST, "Bad request");
        }
    };

    let mut upstream = state.http.request(method, &url).body(body.to_vec());
    for (name, value) in &headers {
        let name = name.as_str();
        if matches!(name, "host" | "connection" | "content-length") {
            continue;
        }
        upstream = upstream.header(name, value.as_bytes());
    }

    let response = match upstream.send().await {
        Ok(response) => response,
        Err(error) => {
            warn!(%error, backend = url, "Backend request failed");
            return text_response(StatusCode::BAD_GATEWAY, "Workspace unreachable");
        }
    };

    let status =
        StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    for (name, value) in response.headers() {
        let name = name.as_str();
        if matches!(name, "connection" | "transfer-encoding") {
            continue;
        }
        builder = builder.header(name, value.as_bytes());
    }
    let bytes = response.bytes().await.unwrap_or_default();
    builder
        .body(Body::from(bytes))
        .unwrap_or_else(|_| text_response(StatusCode::BAD_GATEWAY, "Bad backend response"))
}

/// Bearer token extraction: `Authorization` header, then session cookie,
/// then `?token=`. First match wins.
fn extract_token(headers: &HeaderMap, query: &HashMap<String, String>) -> Option<String> {
    if let Some(auth) = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
    {
        if let Some(token) = auth.strip_prefix("Bearer ") {
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    if let Some(token) = cookie_value(headers, TOKEN_COOKIE) {
        if !token.is_empty() {
            return Some(token);
        }
    }
    query.get("token").filter(|token| !token.is_empty()).cloned()
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|cookie| {
        let (cookie_name, value) = cookie.trim().split_once('=')?;
        (cookie_name == name).then(|| value.to_string())
    })
}

fn set_cookie(name: &str, value: &str, max_age: u64, secure: bool) -> String {
    format!(
        "{name}={value}; Max-Age={max_age}; Path=/; HttpOnly; {}SameSite=Lax",
        if secure { "Secure; " } else { "" }
    )
}

fn clear_cookie(name: &str, secure: bool) -> String {
    set_cookie(name, "", 0, secure)
}

fn redirect_to_login(state: &AppState, clear_session: bool) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::FOUND)
        .header(header::LOCATION, "/login");
    if clear_session {
        builder = builder.header(
            header::SET_COOKIE,
            clear_cookie(TOKEN_COOKIE, state.cookie_secure),
        );
    }
    builder.body(Body::empty()).unwrap()
}

fn text_response(status: StatusCode, body: &'static str) -> Response {
    (status, body).into_response()
}

fn random_nonce() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn header_map(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.append(
                axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        headers
    }

    #[test]
    fn test_extract_token_priority_order() {
        let headers = header_map(&[
            ("authorization", "Bearer header-token"),
            ("cookie", "devplane_token=cookie-token"),
        ]);
        let query = HashMap::from([("token".to_string(), "query-token".to_string())]);
        assert_eq!(
            extract_token(&headers, &query).as_deref(),
            Some("header-token")
        );

        let headers = header_map(&[("cookie", "devplane_token=cookie-token")]);
        assert_eq!(
            extract_token(&headers, &query).as_deref(),
            Some("cookie-token")
        );

        let headers = header_map(&[]);
        assert_eq!(
            extract_token(&headers, &query).as_deref(),
            Some("query-token")
        );

        assert_eq!(extract_token(&headers, &HashMap::new()), None);
    }

    #[test]
    fn test_extract_token_ignores_non_bearer_auth() {
        let headers = header_map(&[("authorization", "Basic dXNlcjpwYXNz")]);
        assert_eq!(extract_token(&headers, &HashMap::new()), None);
    }

    #[test]
    fn test_cookie_value_parses_multiple_cookies() {
        let headers = header_map(&[(
            "cookie",
            "other=1; devplane_token=abc.def.ghi; devplane_state=s1",
        )]);
        assert_eq!(
            cookie_value(&headers, "devplane_token").as_deref(),
            Some("abc.def.ghi")
        );
        assert_eq!(cookie_value(&headers, "devplane_state").as_deref(), Some("s1"));
        assert_eq!(cookie_value(&headers, "missing"), None);
    }

    #[test]
    fn test_cookie_attributes() {
        let cookie = set_cookie("devplane_state", "nonce", 600, true);
        assert!(cookie.contains("devplane_state=nonce"));
        assert!(cookie.contains("Max-Age=600"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("Secure; "));
        assert!(cookie.contains("SameSite=Lax"));

        let insecure = set_cookie("devplane_state", "nonce", 600, false);
        assert!(!insecure.contains("Secure"));

        let cleared = clear_cookie("devplane_token", false);
        assert!(cleared.contains("devplane_token=;"));
        assert!(cleared.contains("Max-Age=0"));
    }

    #[test]
    fn test_random_nonce_is_unique_and_url_safe() {
        let a = random_nonce();
        let b = random_nonce();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    mod handlers {
        use super::*;
        use crate::auth::{AuthError, Claims};
        use crate::lifecycle::LifecycleError;
        use crate::oidc::OidcError;
        use devplane_api::{
            AiConfig, PersistenceConfig, UserInfo, Workspace, WorkspacePhase, WorkspaceResources,
            WorkspaceSpec, WorkspaceStatus,
        };
        use std::time::Duration;

        struct StubValidator;

        #[async_trait::async_trait]
        impl crate::auth::TokenValidator for StubValidator {
            async fn validate(&self, raw_token: &str) -> Result<Claims, AuthError> {
                match raw_token {
                    "good-token" => Ok(Claims {
                        sub: "auth0|12345".to_string(),
                        email: "john@example.com".to_string(),
                        user_id: "auth0-12345".to_string(),
                    }),
                    // A user whose workspace never becomes serviceable.
                    "stuck-token" => Ok(Claims {
                        sub: "auth0|99999".to_string(),
                        email: "stuck@example.com".to_string(),
                        user_id: "auth0-99999".to_string(),
                    }),
                    _ => Err(AuthError::InvalidToken("unknown token".to_string())),
                }
            }
        }

        struct StubFlow;

        #[async_trait::async_trait]
        impl crate::oidc::AuthCodeFlow for StubFlow {
            fn authorize_url(&self, state: String) -> String {
                format!("https://idp.example.com/authorize?state={state}")
            }

            async fn exchange_code(
                &self,
                code: String,
            ) -> Result<(String, Option<Duration>), OidcError> {
                if code == "abc" {
                    Ok(("good-token".to_string(), Some(Duration::from_secs(600))))
                } else {
                    Err(OidcError::ExchangeFailed("bad code".to_string()))
                }
            }
        }

        /// Provisions `auth0-12345` successfully and times out for everyone
        /// else.
        struct StubLifecycle;

        fn stub_workspace(endpoint: Option<&str>) -> Workspace {
            let mut workspace = Workspace::new(
                "auth0-12345",
                WorkspaceSpec {
                    user: UserInfo {
                        id: "auth0-12345".to_string(),
                        email: "john@example.com".to_string(),
                    },
                    resources: WorkspaceResources::default(),
                    ai_config: AiConfig::default(),
                    persistence: PersistenceConfig::default(),
                    tls: None,
                },
            );
            workspace.status = Some(WorkspaceStatus {
                phase: Some(WorkspacePhase::Running),
                service_endpoint: endpoint.map(str::to_string),
                ..Default::default()
            });
            workspace
        }

        #[async_trait::async_trait]
        impl crate::lifecycle::WorkspaceLifecycle for StubLifecycle {
            async fn ensure_workspace(
                &self,
                _namespace: &str,
                claims: &Claims,
            ) -> Result<Workspace, LifecycleError> {
                if claims.user_id != "auth0-12345" {
                    return Err(LifecycleError::NotReady(
                        claims.user_id.clone(),
                        Duration::from_secs(60),
                    ));
                }
                Ok(stub_workspace(Some(
                    "auth0-12345-workspace-svc.default.svc.cluster.local",
                )))
            }

            async fn ensure_exists(
                &self,
                _namespace: &str,
                _claims: &Claims,
            ) -> Result<Workspace, LifecycleError> {
                Ok(stub_workspace(None))
            }

            async fn touch_last_accessed(&self, _workspace: &Workspace) {}
        }

        fn test_state() -> Arc<AppState> {
            Arc::new(AppState {
                validator: Arc::new(StubValidator),
                oidc: Arc::new(StubFlow),
                lifecycle: Arc::new(StubLifecycle),
                http: reqwest::Client::new(),
                namespace: "default".to_string(),
                cookie_secure: false,
            })
        }

        fn set_cookies(response: &Response) -> Vec<String> {
            response
                .headers()
                .get_all(header::SET_COOKIE)
                .iter()
                .map(|value| value.to_str().unwrap().to_string())
                .collect()
        }

        fn location(response: &Response) -> String {
            response
                .headers()
                .get(header::LOCATION)
                .unwrap()
                .to_str()
                .unwrap()
                .to_string()
        }

        #[tokio::test]
        async fn test_login_sets_state_cookie_and_redirects() {
            let response = login(State(test_state())).await;
            assert_eq!(response.status(), StatusCode::FOUND);

            let target = location(&response);
            assert!(target.starts_with("https://idp.example.com/authorize?state="));

            let cookies = set_cookies(&response);
            assert_eq!(cookies.len(), 1);
            assert!(cookies[0].starts_with("devplane_state="));
            assert!(cookies[0].contains("Max-Age=600"));
            assert!(cookies[0].contains("HttpOnly"));

            // The cookie value is the state carried to the provider.
            let nonce = cookies[0]
                .split_once('=')
                .unwrap()
                .1
                .split(';')
                .next()
                .unwrap();
            assert!(target.ends_with(nonce));
        }

        #[tokio::test]
        async fn test_callback_requires_state_cookie() {
            let response = callback(
                State(test_state()),
                HeaderMap::new(),
                Query(CallbackQuery {
                    code: "abc".to_string(),
                    state: "s1".to_string(),
                }),
            )
            .await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }

        #[tokio::test]
        async fn test_callback_rejects_state_mismatch() {
            let headers = header_map(&[("cookie", "devplane_state=s1")]);
            let response = callback(
                State(test_state()),
                headers,
                Query(CallbackQuery {
                    code: "abc".to_string(),
                    state: "other".to_string(),
                }),
            )
            .await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }

        #[tokio::test]
        async fn test_callback_sets_session_and_clears_state() {
            let headers = header_map(&[("cookie", "devplane_state=s1")]);
            let response = callback(
                State(test_state()),
                headers,
                Query(CallbackQuery {
                    code: "abc".to_string(),
                    state: "s1".to_string(),
                }),
            )
            .await;

            assert_eq!(response.status(), StatusCode::FOUND);
            assert_eq!(location(&response), "/");

            let cookies = set_cookies(&response);
            assert!(cookies
                .iter()
                .any(|c| c.starts_with("devplane_token=good-token") && c.contains("Max-Age=600")));
            assert!(cookies
                .iter()
                .any(|c| c.starts_with("devplane_state=;") && c.contains("Max-Age=0")));
        }

        #[tokio::test]
        async fn test_callback_exchange_failure_is_bad_gateway() {
            let headers = header_map(&[("cookie", "devplane_state=s1")]);
            let response = callback(
                State(test_state()),
                headers,
                Query(CallbackQuery {
                    code: "wrong".to_string(),
                    state: "s1".to_string(),
                }),
            )
            .await;
            assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        }

        #[tokio::test]
        async fn test_proxy_without_token_redirects_to_login() {
            let request = Request::builder()
                .uri("/terminal.css")
                .body(Body::empty())
                .unwrap();
            let response = proxy_http(State(test_state()), Query(HashMap::new()), request).await;

            assert_eq!(response.status(), StatusCode::FOUND);
            assert_eq!(location(&response), "/login");
            assert!(set_cookies(&response).is_empty());
        }

        #[tokio::test]
        async fn test_proxy_with_stale_token_clears_cookie() {
            let request = Request::builder()
                .uri("/")
                .header(header::COOKIE, "devplane_token=expired")
                .body(Body::empty())
                .unwrap();
            let response = proxy_http(State(test_state()), Query(HashMap::new()), request).await;

            assert_eq!(response.status(), StatusCode::FOUND);
            assert_eq!(location(&response), "/login");
            let cookies = set_cookies(&response);
            assert!(cookies.iter().any(|c| c.starts_with("devplane_token=;")));
        }

        #[tokio::test]
        async fn test_proxy_provisioning_timeout_is_internal_error() {
            // The catch-all blocks on the same EnsureWorkspace as /ws; a
            // workspace that never reaches Running surfaces as a 500.
            let request = Request::builder()
                .uri("/")
                .header(header::AUTHORIZATION, "Bearer stuck-token")
                .body(Body::empty())
                .unwrap();
            let response = proxy_http(State(test_state()), Query(HashMap::new()), request).await;

            assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        }
    }
}
