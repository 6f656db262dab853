use crate::config::RelayConfig;
use crate::server::RelayState;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::post;
use axum::{Extension, Json};
use futures_util::{Stream, StreamExt, stream};
use relay_llm::{CanonicalEvent, ChatRequest, EventStream, Provider};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_util::sync::DropGuard;

/// A canonical request plus an optional provider pin.
#[derive(Debug, Deserialize)]
struct StreamChatRequest {
    #[serde(default)]
    provider: Option<Provider>,
    #[serde(flatten)]
    request: ChatRequest,
}

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/chat/stream", post(stream_chat))
}

#[tracing::instrument(level = "info", skip_all)]
async fn stream_chat(
    Extension(state): Extension<Arc<RelayState>>,
    Json(body): Json<StreamChatRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (provider, request) = resolve_request(&state.config, body);
    tracing::info!(%provider, model = %request.model, "relaying chat stream");

    // Dropped with the response body when the client disconnects.
    let cancel = state.shutdown.child_token();
    let guard = cancel.clone().drop_guard();
    let events = state.client(provider).chat_stream(request, cancel);

    Sse::new(sse_frames(events, guard)).keep_alive(KeepAlive::default())
}

fn resolve_request(cfg: &RelayConfig, body: StreamChatRequest) -> (Provider, ChatRequest) {
    let mut request = body.request;
    if request.model.trim().is_empty() {
        request.model = cfg.general.model.clone();
    }
    let provider = match body.provider {
        Some(p) => p,
        None if request.model == cfg.general.model => cfg.default_provider(),
        None => Provider::detect(&request.model),
    };
    (provider, request)
}

fn sse_frames(
    events: EventStream,
    guard: DropGuard,
) -> impl Stream<Item = Result<Event, Infallible>> {
    events
        .map(move |event| {
            let _run = &guard;
            Ok(to_frame(&event))
        })
        .chain(stream::once(async { Ok(Event::default().data("[DONE]")) }))
}

fn to_frame(event: &CanonicalEvent) -> Event {
    Event::default().json_data(event).unwrap_or_else(|e| {
        tracing::warn!(error = %e, kind = event.kind(), "failed to encode canonical event");
        Event::default().comment("unencodable event")
    })
}
