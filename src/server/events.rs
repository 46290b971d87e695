//! Progress streaming: SSE and WebSocket views over job row mutations.
//!
//! Both channels poll the job row every 500 ms and emit only when
//! `updated_at` strictly changed; SSE frames carry the new `updated_at` as
//! the event id so clients can resume with Last-Event-ID semantics.

use crate::app::AppContext;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub(super) async fn job_events(
    State(ctx): State<Arc<AppContext>>,
    Path(job_id): Path<String>,
) -> Response {
    struct StreamState {
        ctx: Arc<AppContext>,
        job_id: String,
        last_updated_at: Option<String>,
        first: bool,
        finished: bool,
    }

    let stream = futures::stream::unfold(
        StreamState {
            ctx,
            job_id,
            last_updated_at: None,
            first: true,
            finished: false,
        },
        |mut st| async move {
            if st.finished {
                return None;
            }
            if st.first {
                st.first = false;
            } else {
                tokio::time::sleep(POLL_INTERVAL).await;
            }

            let event = match st.ctx.store.get_job(&st.job_id) {
                Ok(Some(job)) => {
                    let updated_at = job.updated_at.clone();
                    if !updated_at.is_empty()
                        && st.last_updated_at.as_deref() != Some(updated_at.as_str())
                    {
                        st.last_updated_at = Some(updated_at.clone());
                        Event::default()
                            .id(updated_at)
                            .event("job")
                            .json_data(json!({ "type": "job", "job": job }))
                            .unwrap_or_else(|_| Event::default().comment("keep-alive"))
                    } else {
                        Event::default().comment("keep-alive")
                    }
                }
                _ => {
                    st.finished = true;
                    Event::default()
                        .event("error")
                        .json_data(json!({ "type": "error", "detail": "JOB_NOT_FOUND" }))
                        .unwrap_or_else(|_| Event::default().event("error").data("{}"))
                }
            };

            Some((Ok::<_, Infallible>(event), st))
        },
    );

    Sse::new(stream.boxed()).into_response()
}

pub(super) async fn job_ws(
    State(ctx): State<Arc<AppContext>>,
    Path(job_id): Path<String>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| handle_job_ws(ctx, job_id, socket))
}

async fn handle_job_ws(ctx: Arc<AppContext>, job_id: String, mut socket: WebSocket) {
    let mut last_updated_at: Option<String> = None;

    loop {
        let job = match ctx.store.get_job(&job_id) {
            Ok(job) => job,
            Err(e) => {
                debug!("WS job lookup failed: {e}");
                return;
            }
        };

        let Some(job) = job else {
            let payload = json!({ "type": "error", "detail": "JOB_NOT_FOUND" }).to_string();
            let _ = socket.send(Message::Text(payload.into())).await;
            return;
        };

        let updated_at = job.updated_at.clone();
        if !updated_at.is_empty() && last_updated_at.as_deref() != Some(updated_at.as_str()) {
            last_updated_at = Some(updated_at);
            let payload = json!({ "type": "job", "job": job }).to_string();
            if socket.send(Message::Text(payload.into())).await.is_err() {
                return;
            }
        }

        // The receive timeout doubles as the poll tick.
        match tokio::time::timeout(POLL_INTERVAL, socket.recv()).await {
            Ok(None) => return,
            Ok(Some(Err(_))) => return,
            Ok(Some(Ok(Message::Close(_)))) => return,
            Ok(Some(Ok(_))) => {}
            Err(_) => {}
        }
    }
}
