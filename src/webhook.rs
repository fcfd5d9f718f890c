//! Inbound HTTP surface: health check and the CRM outgoing-webhook endpoint.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use crate::notifications::{EventName, EventRouter, WebhookEvent};
use crate::traits::FieldBag;

#[derive(Clone)]
pub struct WebhookState {
    pub router: Arc<EventRouter>,
    /// Expected `auth[application_token]`; `None` accepts any caller.
    pub application_token: Option<String>,
}

pub fn build_router(state: WebhookState, webhook_path: &str) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(webhook_path, post(webhook_handler))
        .with_state(state)
}

/// Serve until the listener fails.
pub async fn start_webhook_server(
    state: WebhookState,
    bind_addr: &str,
    port: u16,
    webhook_path: &str,
) -> anyhow::Result<()> {
    let app = build_router(state, webhook_path);

    let ip: std::net::IpAddr = bind_addr
        .parse()
        .unwrap_or_else(|_| std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED));
    let addr = std::net::SocketAddr::new(ip, port);
    info!("Webhook server listening on http://{}{}", addr, webhook_path);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_handler() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn webhook_handler(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let payload = match decode_body(content_type, &body) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("Rejecting undecodable webhook body: {}", e);
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"status": "error", "error": "invalid body"})),
            );
        }
    };

    if let Some(expected) = state.application_token.as_deref() {
        let supplied = payload["auth"]["application_token"].as_str().unwrap_or("");
        if !constant_time_eq(supplied.as_bytes(), expected.as_bytes()) {
            warn!("Webhook application token mismatch");
            return (
                StatusCode::FORBIDDEN,
                Json(json!({"status": "error", "error": "forbidden"})),
            );
        }
    }

    let event = normalize_event(&payload);
    info!(event = %event.event_name, "Webhook event accepted");

    let router = state.router.clone();
    tokio::spawn(async move {
        let name = event.event_name.clone();
        match router.handle(event).await {
            Ok(outcome) => debug!(event = %name, ?outcome, "Webhook event processed"),
            Err(e) => error!(event = %name, "Webhook event processing failed: {}", e),
        }
    });

    (StatusCode::OK, Json(json!({"status": "accepted"})))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Decode a JSON or form-encoded webhook body into one JSON value.
pub fn decode_body(content_type: &str, body: &[u8]) -> anyhow::Result<Value> {
    let looks_like_json = body
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|b| *b == b'{');
    if content_type.contains("json") || looks_like_json {
        let value: Value = serde_json::from_slice(body)?;
        if !value.is_object() {
            anyhow::bail!("JSON body is not an object");
        }
        return Ok(value);
    }
    Ok(decode_form(body))
}

/// Decode `a[b][c]=v` pairs into nested objects. An empty segment (`a[]`)
/// appends to an array.
pub fn decode_form(body: &[u8]) -> Value {
    let mut root = Value::Object(Map::new());
    for (key, value) in url::form_urlencoded::parse(body) {
        let path = bracket_path(&key);
        if path.is_empty() {
            continue;
        }
        insert_path(&mut root, &path, Value::String(value.into_owned()));
    }
    root
}

fn bracket_path(key: &str) -> Vec<String> {
    let Some(open) = key.find('[') else {
        return vec![key.to_string()];
    };
    let mut path = vec![key[..open].to_string()];
    let mut rest = &key[open..];
    while let Some(stripped) = rest.strip_prefix('[') {
        let Some(close) = stripped.find(']') else {
            break;
        };
        path.push(stripped[..close].to_string());
        rest = &stripped[close + 1..];
    }
    path
}

fn insert_path(node: &mut Value, path: &[String], leaf: Value) {
    let (head, tail) = (&path[0], &path[1..]);
    if head.is_empty() {
        if !node.is_array() {
            *node = Value::Array(Vec::new());
        }
        if let Value::Array(items) = node {
            if tail.is_empty() {
                items.push(leaf);
            } else {
                let mut child = Value::Object(Map::new());
                insert_path(&mut child, tail, leaf);
                items.push(child);
            }
        }
        return;
    }
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    if let Value::Object(map) = node {
        if tail.is_empty() {
            map.insert(head.clone(), leaf);
        } else {
            let child = map
                .entry(head.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            insert_path(child, tail, leaf);
        }
    }
}

fn object(value: &Value) -> Option<FieldBag> {
    value.as_object().filter(|m| !m.is_empty()).cloned()
}

/// Map a decoded CRM webhook body onto the router's event shape.
pub fn normalize_event(payload: &Value) -> WebhookEvent {
    let event_name = payload["event"].as_str().unwrap_or("").trim().to_string();
    let data = &payload["data"];
    let after = object(&data["FIELDS_AFTER"]);
    let before = object(&data["FIELDS_BEFORE"]);
    let is_comment = EventName::parse(&event_name).is_some_and(|n| n.is_comment());

    if is_comment {
        return WebhookEvent {
            event_name,
            task_fields: FieldBag::new(),
            before_fields: None,
            after_fields: None,
            comment_fields: after.or(before),
        };
    }

    let task_fields = after
        .clone()
        .or_else(|| before.clone())
        .unwrap_or_default();
    WebhookEvent {
        event_name,
        task_fields,
        before_fields: before,
        after_fields: after,
        comment_fields: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::setup_test_engine;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn app(token: Option<&str>) -> Router {
        let harness = setup_test_engine();
        let state = WebhookState {
            router: Arc::new(harness.router),
            application_token: token.map(str::to_string),
        };
        build_router(state, "/bitrix/webhook")
    }

    fn form_request(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/bitrix/webhook")
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[test]
    fn form_bodies_decode_into_nested_objects() {
        let body = b"event=ONTASKUPDATE&data%5BFIELDS_AFTER%5D%5BID%5D=41127\
&data[FIELDS_BEFORE][ID]=41127&auth[application_token]=tok&tags[]=a&tags[]=b";
        let value = decode_form(body);
        assert_eq!(value["event"], "ONTASKUPDATE");
        assert_eq!(value["data"]["FIELDS_AFTER"]["ID"], "41127");
        assert_eq!(value["data"]["FIELDS_BEFORE"]["ID"], "41127");
        assert_eq!(value["auth"]["application_token"], "tok");
        assert_eq!(value["tags"], json!(["a", "b"]));
    }

    #[test]
    fn json_bodies_are_detected_without_content_type() {
        let value = decode_body("", br#" {"event": "ONTASKDELETE"}"#).unwrap();
        assert_eq!(value["event"], "ONTASKDELETE");
        assert!(decode_body("application/json", b"[1,2]").is_err());
    }

    #[test]
    fn task_events_normalize_payload_pairs() {
        let payload = json!({
            "event": "ONTASKUPDATE",
            "data": {
                "FIELDS_AFTER": {"ID": "5", "DEADLINE": "2025-01-12T18:00:00+03:00"},
                "FIELDS_BEFORE": {"ID": "5", "DEADLINE": "2025-01-10T18:00:00+03:00"}
            }
        });
        let event = normalize_event(&payload);
        assert_eq!(event.event_name, "ONTASKUPDATE");
        assert_eq!(event.task_fields["DEADLINE"], "2025-01-12T18:00:00+03:00");
        assert!(event.before_fields.is_some());
        assert!(event.comment_fields.is_none());
    }

    #[test]
    fn comment_events_carry_comment_fields() {
        let payload = json!({
            "event": "ONTASKCOMMENTADD",
            "data": {"FIELDS_AFTER": {"ID": "8812", "TASK_ID": "5"}}
        });
        let event = normalize_event(&payload);
        assert!(event.task_fields.is_empty());
        assert_eq!(event.comment_fields.unwrap()["TASK_ID"], "5");
        assert!(event.after_fields.is_none());
    }

    #[tokio::test]
    async fn health_endpoint() {
        let resp = app(None)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn token_mismatch_is_forbidden() {
        let resp = app(Some("secret"))
            .oneshot(form_request(
                "event=ONTASKUPDATE&data[FIELDS_AFTER][ID]=1&auth[application_token]=wrong",
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn valid_event_is_accepted() {
        let resp = app(Some("secret"))
            .oneshot(form_request(
                "event=ONTASKUPDATE&data[FIELDS_AFTER][ID]=1&auth[application_token]=secret",
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_events_are_acknowledged() {
        let resp = app(None)
            .oneshot(form_request("event=ONCRMDEALADD&data[FIELDS][ID]=3"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn malformed_json_is_rejected() {
        let req = Request::builder()
            .method("POST")
            .uri("/bitrix/webhook")
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let resp = app(None).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
