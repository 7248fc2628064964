//! HTTP surface tests against the assembled router.

mod common;

use axum::http::{HeaderValue, StatusCode, header};
use axum_test::{TestResponse, TestServer};
use base64::Engine;
use common::{Harness, consent_id_in, query_param, session_cookie};
use consent_engine::api;
use serde_json::{Value, json};

fn server(h: &Harness) -> TestServer {
    TestServer::new(api::app(h.state.clone(), h.resources())).expect("create test server")
}

fn location(response: &TestResponse) -> String {
    response
        .headers()
        .get(header::LOCATION)
        .expect("location header")
        .to_str()
        .expect("ascii location")
        .to_string()
}

fn cookie(username: &str) -> HeaderValue {
    HeaderValue::from_str(&session_cookie(username)).expect("cookie header")
}

fn basic(client_id: &str, secret: &str) -> HeaderValue {
    let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{client_id}:{secret}"));
    HeaderValue::from_str(&format!("Basic {encoded}")).expect("authorization header")
}

#[tokio::test]
async fn health_check() {
    let h = Harness::new().await;
    let response = server(&h).get("/healthz").await;
    response.assert_status_ok();
    response.assert_text("ok");
}

#[tokio::test]
async fn api_docs_are_served() {
    let h = Harness::new().await;
    server(&h).get("/api-docs").await.assert_status_ok();
}

#[tokio::test]
async fn unknown_client_is_not_redirected() {
    let h = Harness::new().await;
    let response = server(&h)
        .get("/api/oidc/authorization")
        .add_query_param("response_type", "code")
        .add_query_param("client_id", "nonexistent-client")
        .add_query_param("redirect_uri", "https://app.example.com/cb")
        .await;

    response.assert_status(StatusCode::UNAUTHORIZED);
    let body: Value = response.json();
    assert_eq!(body["error"], "invalid_client");
}

#[tokio::test]
async fn unregistered_redirect_uri_is_not_redirected() {
    let h = Harness::new().await;
    let response = server(&h)
        .get("/api/oidc/authorization")
        .add_query_param("response_type", "code")
        .add_query_param("client_id", "explicit-app")
        .add_query_param("redirect_uri", "https://evil.example.com/cb")
        .add_query_param("state", "xyz")
        .await;

    response.assert_status_bad_request();
    let body: Value = response.json();
    assert_eq!(body["error"], "invalid_request");
}

#[tokio::test]
async fn unsupported_response_type_is_redirected() {
    let h = Harness::new().await;
    let response = server(&h)
        .get("/api/oidc/authorization")
        .add_query_param("response_type", "token")
        .add_query_param("client_id", "explicit-app")
        .add_query_param("redirect_uri", "https://app.example.com/cb")
        .add_query_param("state", "xyz")
        .await;

    response.assert_status_see_other();
    let location = location(&response);
    assert!(location.starts_with("https://app.example.com/cb?"));
    assert_eq!(
        query_param(&location, "error").as_deref(),
        Some("unsupported_response_type")
    );
    assert_eq!(query_param(&location, "state").as_deref(), Some("xyz"));
}

#[tokio::test]
async fn anonymous_browser_is_sent_to_login() {
    let h = Harness::new().await;
    let response = server(&h)
        .get("/api/oidc/authorization")
        .add_query_param("response_type", "code")
        .add_query_param("client_id", "implicit-app")
        .add_query_param("redirect_uri", "https://implicit.example.com/cb")
        .add_query_param("scope", "openid")
        .await;

    response.assert_status_see_other();
    let location = location(&response);
    assert!(location.starts_with("https://login.example.com/?rd="));
    let challenge = consent_id_in(&location);
    assert!(h.consent_session(challenge).await.subject.is_none());
}

#[tokio::test]
async fn forged_session_cookie_reads_as_anonymous() {
    let h = Harness::new().await;
    let response = server(&h)
        .get("/api/oidc/authorization")
        .add_header(header::COOKIE, HeaderValue::from_static("authn_session=not-a-jwt"))
        .add_query_param("response_type", "code")
        .add_query_param("client_id", "implicit-app")
        .add_query_param("redirect_uri", "https://implicit.example.com/cb")
        .add_query_param("scope", "openid")
        .await;

    response.assert_status_see_other();
    assert!(location(&response).starts_with("https://login.example.com/?rd="));
}

#[tokio::test]
async fn session_cookie_yields_a_code() {
    let h = Harness::new().await;
    let response = server(&h)
        .get("/api/oidc/authorization")
        .add_header(header::COOKIE, cookie("john"))
        .add_query_param("response_type", "code")
        .add_query_param("client_id", "implicit-app")
        .add_query_param("redirect_uri", "https://implicit.example.com/cb")
        .add_query_param("scope", "openid profile")
        .add_query_param("state", "abc")
        .add_query_param("code_challenge", "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM")
        .add_query_param("code_challenge_method", "S256")
        .await;

    response.assert_status_see_other();
    let location = location(&response);
    assert!(location.starts_with("https://implicit.example.com/cb?code="));
    assert_eq!(query_param(&location, "state").as_deref(), Some("abc"));
}

#[tokio::test]
async fn form_post_authorization() {
    let h = Harness::new().await;
    let response = server(&h)
        .post("/api/oidc/authorization")
        .add_header(header::COOKIE, cookie("john"))
        .form(&[
            ("response_type", "code"),
            ("client_id", "implicit-app"),
            ("redirect_uri", "https://implicit.example.com/cb"),
            ("scope", "openid"),
        ])
        .await;

    response.assert_status_see_other();
    assert!(location(&response).starts_with("https://implicit.example.com/cb?code="));
}

#[tokio::test]
async fn pushed_request_is_single_use() {
    let h = Harness::new().await;
    let server = server(&h);

    let response = server
        .post("/api/oidc/pushed-authorization-request")
        .add_header(header::AUTHORIZATION, basic("implicit-app", "implicit-secret"))
        .form(&[
            ("response_type", "code"),
            ("client_id", "implicit-app"),
            ("redirect_uri", "https://implicit.example.com/cb"),
            ("scope", "openid"),
            ("state", "pushed"),
        ])
        .await;
    response.assert_status(StatusCode::CREATED);
    let body: Value = response.json();
    let request_uri = body["request_uri"].as_str().unwrap().to_string();
    assert!(request_uri.starts_with("urn:ietf:params:oauth:request_uri:"));
    assert!(body["expires_in"].as_i64().unwrap() > 0);

    let response = server
        .get("/api/oidc/authorization")
        .add_header(header::COOKIE, cookie("john"))
        .add_query_param("client_id", "implicit-app")
        .add_query_param("request_uri", &request_uri)
        .await;
    response.assert_status_see_other();
    let location = location(&response);
    assert!(location.starts_with("https://implicit.example.com/cb?code="));
    assert_eq!(query_param(&location, "state").as_deref(), Some("pushed"));

    let response = server
        .get("/api/oidc/authorization")
        .add_header(header::COOKIE, cookie("john"))
        .add_query_param("client_id", "implicit-app")
        .add_query_param("request_uri", &request_uri)
        .await;
    response.assert_status_bad_request();
    let body: Value = response.json();
    assert_eq!(body["error"], "invalid_request_uri");
}

#[tokio::test]
async fn pushed_request_with_wrong_secret() {
    let h = Harness::new().await;
    let response = server(&h)
        .post("/api/oidc/pushed-authorization-request")
        .form(&[
            ("response_type", "code"),
            ("client_id", "implicit-app"),
            ("client_secret", "wrong"),
            ("redirect_uri", "https://implicit.example.com/cb"),
            ("scope", "openid"),
        ])
        .await;

    response.assert_status(StatusCode::UNAUTHORIZED);
    let body: Value = response.json();
    assert_eq!(body["error"], "invalid_client");
}

#[tokio::test]
async fn consent_details_need_a_session() {
    let h = Harness::new().await;
    let response = server(&h)
        .get("/api/oidc/consent")
        .add_query_param("consent_id", uuid::Uuid::new_v4())
        .await;

    response.assert_status_bad_request();
    let body: Value = response.json();
    assert_eq!(body["error"], "login_required");
}

#[tokio::test]
async fn explicit_consent_over_http() {
    let h = Harness::new().await;
    let server = server(&h);

    let response = server
        .get("/api/oidc/authorization")
        .add_header(header::COOKIE, cookie("john"))
        .add_query_param("response_type", "code")
        .add_query_param("client_id", "explicit-app")
        .add_query_param("redirect_uri", "https://app.example.com/cb")
        .add_query_param("scope", "openid email")
        .add_query_param("state", "xyz")
        .await;
    response.assert_status_see_other();
    let consent_page = location(&response);
    assert!(consent_page.starts_with("https://login.example.com/consent?consent_id="));
    let challenge = consent_id_in(&consent_page);

    let details: Value = server
        .get("/api/oidc/consent")
        .add_header(header::COOKIE, cookie("john"))
        .add_query_param("consent_id", challenge)
        .await
        .json();
    assert_eq!(details["client_id"], "explicit-app");
    assert_eq!(details["scopes"], json!(["email", "openid"]));

    // someone else cannot answer it
    server
        .post("/api/oidc/consent")
        .add_header(header::COOKIE, cookie("mallory"))
        .json(&json!({"consent_id": challenge, "consent": true}))
        .await
        .assert_status_bad_request();

    let response = server
        .post("/api/oidc/consent")
        .add_header(header::COOKIE, cookie("john"))
        .json(&json!({"consent_id": challenge, "consent": true}))
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["approved"], true);
    let continuation = body["redirect_uri"].as_str().unwrap().to_string();
    let (_, query) = continuation.split_once('?').unwrap();
    assert!(continuation.starts_with("https://auth.example.com/api/oidc/authorization?"));

    let response = server
        .get(&format!("/api/oidc/authorization?{query}"))
        .add_header(header::COOKIE, cookie("john"))
        .await;
    response.assert_status_see_other();
    let location = location(&response);
    assert!(location.starts_with("https://app.example.com/cb?code="));
    assert_eq!(query_param(&location, "state").as_deref(), Some("xyz"));
}

#[tokio::test]
async fn device_flow_over_http() {
    let h = Harness::new().await;
    let server = server(&h);

    let response = server
        .post("/api/oidc/device-authorization")
        .form(&[("client_id", "tv"), ("scope", "openid profile")])
        .await;
    response.assert_status_ok();
    let device: Value = response.json();
    let user_code = device["user_code"].as_str().unwrap().to_string();
    assert_eq!(user_code.len(), 9);
    assert_eq!(device["verification_uri"], "https://login.example.com/device");

    // without a session the browser logs in first
    let body: Value = server
        .put("/api/oidc/device-authorization")
        .json(&json!({"client_id": "tv", "user_code": user_code}))
        .await
        .json();
    assert_eq!(body["approved"], false);
    assert!(
        body["redirect_uri"]
            .as_str()
            .unwrap()
            .starts_with("https://login.example.com/?rd=")
    );

    let body: Value = server
        .put("/api/oidc/device-authorization")
        .add_header(header::COOKIE, cookie("john"))
        .json(&json!({"client_id": "tv", "user_code": user_code}))
        .await
        .json();
    assert_eq!(body["approved"], false);
    let challenge = consent_id_in(body["redirect_uri"].as_str().unwrap());

    let body: Value = server
        .post("/api/oidc/consent")
        .add_header(header::COOKIE, cookie("john"))
        .json(&json!({"consent_id": challenge, "consent": true}))
        .await
        .json();
    assert_eq!(
        body["redirect_uri"],
        format!("https://login.example.com/device?consent_id={challenge}")
    );

    let response = server
        .put("/api/oidc/device-authorization")
        .add_header(header::COOKIE, cookie("john"))
        .json(&json!({"client_id": "tv", "consent_id": challenge}))
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["approved"], true);
    assert!(body.get("redirect_uri").is_none());

    let response = server
        .put("/api/oidc/device-authorization")
        .add_header(header::COOKIE, cookie("john"))
        .json(&json!({"client_id": "tv", "user_code": user_code}))
        .await;
    response.assert_status_bad_request();
    let body: Value = response.json();
    assert_eq!(body["error"], "invalid_grant");
}

#[tokio::test]
async fn device_authorization_requires_a_known_client() {
    let h = Harness::new().await;
    let response = server(&h)
        .post("/api/oidc/device-authorization")
        .form(&[("client_id", "nobody"), ("scope", "openid")])
        .await;

    response.assert_status(StatusCode::UNAUTHORIZED);
}
