use axum::{
    extract::Path,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
    Form, Json, Router,
};
use callbridge_telephony::{
    CallGateway, OutboundCall, TelephonyError, TwilioConfig, TwilioGateway,
};
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::net::TcpListener;

// base64("AC123:secret")
const EXPECTED_AUTH: &str = "Basic QUMxMjM6c2VjcmV0";

async fn create_call(
    Path(account): Path<String>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> impl IntoResponse {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if auth != EXPECTED_AUTH {
        return (StatusCode::UNAUTHORIZED, Json(json!({"code": 20003, "message": "Authenticate"})));
    }
    assert_eq!(account, "AC123");

    if form.get("To").map(String::as_str) == Some("+15550000000") {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "code": 21211,
                "message": "The 'To' number +15550000000 is not a valid phone number.",
                "status": 400
            })),
        );
    }

    assert_eq!(form.get("From").map(String::as_str), Some("+15551112222"));
    assert_eq!(
        form.get("Url").map(String::as_str),
        Some("https://bridge.example/twiml-media?name=Dana")
    );
    assert_eq!(form.get("Record").map(String::as_str), Some("true"));

    (
        StatusCode::CREATED,
        Json(json!({"sid": "CA0001", "status": "queued", "to": form["To"]})),
    )
}

async fn spawn_mock() -> SocketAddr {
    let app = Router::new().route(
        "/2010-04-01/Accounts/{account}/Calls.json",
        post(create_call),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn gateway(addr: SocketAddr, token: &str) -> TwilioGateway {
    let mut config = TwilioConfig::new("AC123", token, "+15551112222");
    config.api_base = format!("http://{}/2010-04-01", addr);
    TwilioGateway::new(config).unwrap()
}

fn call(to: &str) -> OutboundCall {
    OutboundCall {
        to: to.to_string(),
        from: "+15551112222".to_string(),
        callback_url: "https://bridge.example/twiml-media?name=Dana".to_string(),
        record: true,
    }
}

#[tokio::test]
async fn places_call_and_returns_sid() {
    let addr = spawn_mock().await;
    let placed = gateway(addr, "secret")
        .initiate_call(&call("+15553334444"))
        .await
        .expect("call should be placed");

    assert_eq!(placed.sid, "CA0001");
    assert_eq!(placed.status.as_deref(), Some("queued"));
}

#[tokio::test]
async fn provider_rejection_carries_code_and_message() {
    let addr = spawn_mock().await;
    let err = gateway(addr, "secret")
        .initiate_call(&call("+15550000000"))
        .await
        .unwrap_err();

    match err {
        TelephonyError::Provider {
            status,
            code,
            message,
        } => {
            assert_eq!(status, 400);
            assert_eq!(code, Some(21211));
            assert!(message.contains("not a valid phone number"));
        }
        other => panic!("expected provider error, got {:?}", other),
    }
}

#[tokio::test]
async fn bad_credentials_are_provider_errors() {
    let addr = spawn_mock().await;
    let err = gateway(addr, "wrong")
        .initiate_call(&call("+15553334444"))
        .await
        .unwrap_err();
    assert!(matches!(err, TelephonyError::Provider { status: 401, .. }));
}

#[test]
fn empty_account_sid_is_rejected() {
    let err = TwilioGateway::new(TwilioConfig::default()).unwrap_err();
    assert!(matches!(err, TelephonyError::Config(_)));
}

#[test]
fn default_origin_is_configured_number() {
    let gw = TwilioGateway::new(TwilioConfig::new("AC1", "t", "+15551112222")).unwrap();
    assert_eq!(gw.default_origin(), "+15551112222");
}
