use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures::future::join_all;
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use minbar_engine::{AskEvent, AskRequest};

use crate::server::AppState;

/// Probes must answer well under a second or the worker counts as down.
const PROBE_TIMEOUT: Duration = Duration::from_millis(750);

#[derive(Debug, Deserialize)]
pub struct AskBody {
    pub user_id: Uuid,
    pub session_id: Uuid,
    pub prompt: String,
}

/// `POST /v1/ask`. Streams the answer as SSE: a `ready` event, `token`
/// events, at most one `error`, then `done`. Client disconnect cancels
/// the in-flight ask through a drop guard.
pub async fn ask_handler(
    State(state): State<AppState>,
    Json(body): Json<AskBody>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!(user_id = %body.user_id, session_id = %body.session_id, "ask received");
    let request = AskRequest {
        user_id: body.user_id,
        session_id: body.session_id,
        prompt: body.prompt,
    };

    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let events = state.ask.ask(request, cancel);

    let stream = events.map(move |event| {
        let _ = &guard;
        Ok(sse_event(event))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn sse_event(event: AskEvent) -> Event {
    match event {
        AskEvent::Ready => Event::default().event("ready").data("{}"),
        AskEvent::Token(text) => Event::default()
            .event("token")
            .data(json!({ "text": text }).to_string()),
        AskEvent::Error(e) => Event::default()
            .event("error")
            .data(json!({ "kind": e.kind(), "message": e.to_string() }).to_string()),
        AskEvent::Done => Event::default().event("done").data("{}"),
    }
}

/// `GET /health`. Process liveness only.
pub async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// `GET /ready`. Pings every worker probe concurrently; any failure
/// turns the whole response 503 so orchestration stops routing here.
pub async fn ready_handler(State(state): State<AppState>) -> impl IntoResponse {
    let pings = state
        .probes
        .iter()
        .map(|probe| async move { (probe.worker(), probe.ping(PROBE_TIMEOUT).await) });
    let results = join_all(pings).await;

    let mut workers = serde_json::Map::new();
    let mut all_ok = true;
    for (worker, result) in results {
        match result {
            Ok(()) => {
                workers.insert(worker.into(), json!("ok"));
            }
            Err(e) => {
                all_ok = false;
                workers.insert(worker.into(), json!(e.to_string()));
            }
        }
    }

    let status = if all_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = json!({
        "status": if all_ok { "ready" } else { "degraded" },
        "workers": workers,
    });
    (status, Json(body))
}
