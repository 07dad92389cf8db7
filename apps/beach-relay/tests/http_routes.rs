use axum::body::{self, Body};
use axum::extract::ws::Message;
use axum::http::{header, Request, StatusCode};
use beach_relay::config::RelayConfig;
use beach_relay::connection::{Connection, Outbound};
use beach_relay::routes;
use beach_relay::state::AppState;
use relay_proto::{ClientMetadata, Envelope};
use serde_json::{json, Value};
use tower::util::ServiceExt;

type TestResult = Result<(), Box<dyn std::error::Error>>;

const SECRET: &str = "tok";

fn connect_peer(state: &AppState, id: &str) -> Outbound {
    let (connection, outbound) = Connection::open(None);
    let metadata = ClientMetadata {
        world_title: Some("Shattered Isles".into()),
        ..ClientMetadata::default()
    };
    state
        .registry
        .add_client(connection, id.into(), SECRET.into(), metadata)
        .unwrap();
    outbound
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_is_public() -> TestResult {
    let state = AppState::build(RelayConfig::local(SECRET), None);
    let response = routes::router(state)
        .oneshot(Request::builder().uri("/health").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "ok");
    Ok(())
}

#[tokio::test]
async fn api_key_is_required() -> TestResult {
    let state = AppState::build(RelayConfig::local(SECRET), None);
    let app = routes::router(state);

    let missing = app
        .clone()
        .oneshot(Request::builder().uri("/clients").body(Body::empty())?)
        .await?;
    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

    let wrong = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/search?clientId=c1")
                .header("x-api-key", "nope")
                .body(Body::from("{}"))?,
        )
        .await?;
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn lists_connected_clients_with_metadata() -> TestResult {
    let state = AppState::build(RelayConfig::local(SECRET), None);
    let _outbound = connect_peer(&state, "c1");

    let response = routes::router(state)
        .oneshot(
            Request::builder()
                .uri("/clients")
                .header("x-api-key", SECRET)
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["clients"][0]["id"], "c1");
    assert_eq!(body["clients"][0]["worldTitle"], "Shattered Isles");
    Ok(())
}

#[tokio::test]
async fn call_errors_map_to_statuses() -> TestResult {
    let state = AppState::build(RelayConfig::local(SECRET), None);
    let app = routes::router(state);

    let unknown_client = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/search?clientId=ghost")
                .header("x-api-key", SECRET)
                .body(Body::from(r#"{"query":"goblin"}"#))?,
        )
        .await?;
    assert_eq!(unknown_client.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(unknown_client).await["reason"], "unknown_client");

    let unknown_type = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/teleport?clientId=ghost")
                .header("x-api-key", SECRET)
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(unknown_type.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn raw_download_is_streamed_back_as_bytes() -> TestResult {
    let state = AppState::build(RelayConfig::local(SECRET), None);
    let mut outbound = connect_peer(&state, "c1");
    let app = routes::router(state.clone());

    let request = tokio::spawn(app.oneshot(
        Request::builder()
            .method("POST")
            .uri("/api/download-file?clientId=c1&encoding=raw&filename=note.txt")
            .header("x-api-key", SECRET)
            .body(Body::from(r#"{"path":"worlds/isles/note.txt"}"#))?,
    ));

    let forwarded: Envelope = match outbound.recv().await {
        Some(Message::Text(text)) => serde_json::from_str(&text)?,
        other => panic!("expected request frame, got {other:?}"),
    };
    assert_eq!(forwarded.kind, "download-file");
    assert_eq!(forwarded.get("path"), Some(&json!("worlds/isles/note.txt")));

    let result: Envelope = serde_json::from_value(json!({
        "type": "download-file-result",
        "requestId": forwarded.request_id,
        "data": "aGVsbG8=",
        "mimeType": "text/plain"
    }))?;
    state.registry.handle_incoming_message("c1", result);

    let response = request.await??;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
    let bytes = body::to_bytes(response.into_body(), usize::MAX).await?;
    assert_eq!(&bytes[..], b"hello");
    Ok(())
}
