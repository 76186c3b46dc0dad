//! HTTP+SSE Transport
//!
//! Legacy MCP transport used by older clients. A client opens a long-lived
//! `GET <mount>/sse` event stream, receives an `endpoint` event naming the
//! message URL for its session, then POSTs JSON-RPC messages to that URL.
//! Each POST is acknowledged with 202 and its response is delivered as a
//! `message` event on the session's stream.

use actix_web::{HttpResponse, Result, http::header, web};
use bytes::Bytes;
use futures_util::stream;
use serde::Deserialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, interval_at};

use crate::core::server::{HttpSettings, McpService, mount_join};

/// Interval between comment frames on an idle event stream.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(15);

const KEEP_ALIVE_FRAME: &[u8] = b": ping\n\n";

/// Open SSE sessions keyed by session id.
///
/// Each entry holds the sending half of the channel feeding that session's
/// event stream. Entries are removed when the stream is dropped.
pub struct SseSessions {
    senders: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Bytes>>>>,
    keep_alive: Duration,
}

impl Default for SseSessions {
    fn default() -> Self {
        Self::with_keep_alive(DEFAULT_KEEP_ALIVE)
    }
}

impl SseSessions {
    /// Sessions whose streams emit a comment frame after `keep_alive` of
    /// silence, so proxies and clients do not treat them as dead.
    pub fn with_keep_alive(keep_alive: Duration) -> Self {
        Self {
            senders: Arc::default(),
            keep_alive,
        }
    }

    /// Register a new session and return its id with the receiving half.
    pub fn open(&self) -> (String, mpsc::UnboundedReceiver<Bytes>) {
        let session_id = uuid::Uuid::new_v4().simple().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut senders) = self.senders.lock() {
            senders.insert(session_id.clone(), tx);
        }
        (session_id, rx)
    }

    /// Queue an event for a session. Returns false when the session is gone.
    pub fn send(&self, session_id: &str, event: Bytes) -> bool {
        let Ok(mut senders) = self.senders.lock() else {
            return false;
        };
        match senders.get(session_id) {
            Some(tx) if tx.send(event).is_ok() => true,
            Some(_) => {
                senders.remove(session_id);
                false
            }
            None => false,
        }
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.senders
            .lock()
            .map(|senders| senders.contains_key(session_id))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.senders.lock().map(|senders| senders.len()).unwrap_or(0)
    }

    fn guard(&self, session_id: String) -> SessionGuard {
        SessionGuard {
            session_id,
            senders: Arc::clone(&self.senders),
        }
    }
}

/// Removes its session from the map when the event stream is dropped,
/// which happens when the client disconnects.
struct SessionGuard {
    session_id: String,
    senders: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Bytes>>>>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Ok(mut senders) = self.senders.lock() {
            senders.remove(&self.session_id);
        }
        tracing::debug!(session_id = %self.session_id, "SSE session closed");
    }
}

/// Format one server-sent event frame.
pub fn format_event(event: &str, data: &str) -> Bytes {
    let mut frame = String::with_capacity(event.len() + data.len() + 16);
    frame.push_str("event: ");
    frame.push_str(event);
    frame.push('\n');
    // Multi-line payloads need one data field per line
    for line in data.lines() {
        frame.push_str("data: ");
        frame.push_str(line);
        frame.push('\n');
    }
    frame.push('\n');
    Bytes::from(frame)
}

/// `GET <mount>/sse`: open a session and stream its events.
pub async fn sse_connect(
    sessions: web::Data<SseSessions>,
    settings: web::Data<HttpSettings>,
) -> Result<HttpResponse> {
    let (session_id, rx) = sessions.open();
    let endpoint = format!(
        "{}?session_id={}",
        mount_join(&settings.mount_path, "/messages/"),
        session_id
    );
    tracing::info!(session_id = %session_id, active = sessions.len(), "SSE session opened");

    let guard = sessions.guard(session_id);
    let period = sessions.keep_alive;
    let ticker = interval_at(Instant::now() + period, period);
    let first = stream::once(async move { Ok::<_, Infallible>(format_event("endpoint", &endpoint)) });
    let rest = stream::unfold((rx, guard, ticker), |(mut rx, guard, mut ticker)| async move {
        let event = tokio::select! {
            event = rx.recv() => event?,
            _ = ticker.tick() => Bytes::from_static(KEEP_ALIVE_FRAME),
        };
        Some((Ok::<_, Infallible>(event), (rx, guard, ticker)))
    });

    Ok(HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header((header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"))
        // Disable nginx buffering for real-time streaming
        .insert_header(("x-accel-buffering", "no"))
        .streaming(futures_util::StreamExt::chain(first, rest)))
}

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    pub session_id: Option<String>,
}

/// `POST <mount>/messages/?session_id=...`: accept one JSON-RPC message for a
/// session. The response is delivered on the session's event stream.
pub async fn sse_message(
    service: web::Data<McpService>,
    sessions: web::Data<SseSessions>,
    query: web::Query<MessageQuery>,
    body: web::Bytes,
) -> Result<HttpResponse> {
    let Some(session_id) = query.into_inner().session_id.filter(|s| !s.is_empty()) else {
        return Ok(HttpResponse::BadRequest().body("session_id is required"));
    };
    if !sessions.contains(&session_id) {
        return Ok(HttpResponse::NotFound().body("Could not find session"));
    }

    let raw = match String::from_utf8(body.to_vec()) {
        Ok(raw) => raw,
        Err(_) => return Ok(HttpResponse::BadRequest().body("Could not parse message")),
    };
    if serde_json::from_str::<serde_json::Value>(&raw).is_err() {
        return Ok(HttpResponse::BadRequest().body("Could not parse message"));
    }

    // Tool calls may wait on the clinic backend; answer on the stream later
    actix_rt::spawn(async move {
        let Some(response) = service.handle_raw(&raw).await else {
            return;
        };
        match serde_json::to_string(&response) {
            Ok(json) => {
                if !sessions.send(&session_id, format_event("message", &json)) {
                    tracing::warn!(session_id = %session_id, "SSE session closed before response was sent");
                }
            }
            Err(e) => tracing::error!(error = %e, "failed to serialize response"),
        }
    });

    Ok(HttpResponse::Accepted().body("Accepted"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{CorsConfig, Transport};
    use crate::core::server::{build_cors, configure_routes, tests::echo_service};
    use actix_web::body::{BoxBody, MessageBody};
    use actix_web::{App, test as actix_test};
    use serde_json::{Value, json};

    #[test]
    fn test_format_event_splits_lines() {
        let frame = format_event("message", "{\"a\":1}");
        assert_eq!(frame, "event: message\ndata: {\"a\":1}\n\n");

        let frame = format_event("message", "one\ntwo");
        assert_eq!(frame, "event: message\ndata: one\ndata: two\n\n");
    }

    #[test]
    fn test_sessions_are_removed_when_stream_drops() {
        let sessions = SseSessions::default();
        let (id, rx) = sessions.open();
        let guard = sessions.guard(id.clone());
        assert!(sessions.send(&id, Bytes::from_static(b"x")));
        assert_eq!(sessions.len(), 1);

        drop(rx);
        drop(guard);
        assert!(!sessions.contains(&id));
        assert!(!sessions.send(&id, Bytes::from_static(b"x")));
    }

    async fn next_chunk(body: &mut BoxBody) -> String {
        let chunk = futures_util::future::poll_fn(|cx| std::pin::Pin::new(&mut *body).poll_next(cx))
            .await
            .expect("stream ended")
            .ok()
            .expect("stream error");
        String::from_utf8(chunk.to_vec()).unwrap()
    }

    #[actix_web::test]
    async fn test_sse_session_round_trip() {
        let settings = HttpSettings {
            transport: Transport::Sse,
            mount_path: "/".to_string(),
        };
        let sessions = web::Data::new(SseSessions::default());
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(echo_service()))
                .app_data(sessions.clone())
                .app_data(web::Data::new(settings.clone()))
                .wrap(build_cors(&CorsConfig::default()))
                .configure(move |cfg| configure_routes(cfg, &settings)),
        )
        .await;

        let req = actix_test::TestRequest::get().uri("/sse").to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), 200);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );

        let mut body = resp.into_body().boxed();
        let endpoint_event = next_chunk(&mut body).await;
        assert!(endpoint_event.starts_with("event: endpoint\ndata: /messages/?session_id="));
        let endpoint = endpoint_event
            .trim_end()
            .trim_start_matches("event: endpoint\ndata: ")
            .to_string();
        assert_eq!(sessions.len(), 1);

        let req = actix_test::TestRequest::post()
            .uri(&endpoint)
            .set_json(json!({
                "jsonrpc": "2.0",
                "id": 7,
                "method": "tools/call",
                "params": { "name": "echo", "arguments": { "message": "via sse" } }
            }))
            .to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), 202);

        let message_event = next_chunk(&mut body).await;
        assert!(message_event.starts_with("event: message\ndata: "));
        let data: Value = serde_json::from_str(
            message_event
                .trim_end()
                .trim_start_matches("event: message\ndata: "),
        )
        .unwrap();
        assert_eq!(data["id"], 7);
        assert_eq!(data["result"]["content"][0]["text"], "via sse");

        drop(body);
        assert_eq!(sessions.len(), 0);
    }

    #[actix_web::test]
    async fn test_idle_stream_sends_keep_alive_comments() {
        let settings = HttpSettings {
            transport: Transport::Sse,
            mount_path: "/".to_string(),
        };
        let sessions = web::Data::new(SseSessions::with_keep_alive(Duration::from_millis(20)));
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(echo_service()))
                .app_data(sessions.clone())
                .app_data(web::Data::new(settings.clone()))
                .configure(move |cfg| configure_routes(cfg, &settings)),
        )
        .await;

        let req = actix_test::TestRequest::get().uri("/sse").to_request();
        let resp = actix_test::call_service(&app, req).await;
        let mut body = resp.into_body().boxed();

        assert!(next_chunk(&mut body).await.starts_with("event: endpoint\n"));
        assert_eq!(next_chunk(&mut body).await, ": ping\n\n");
        assert_eq!(next_chunk(&mut body).await, ": ping\n\n");
        assert_eq!(sessions.len(), 1);

        drop(body);
        assert_eq!(sessions.len(), 0);
    }

    #[actix_web::test]
    async fn test_message_post_requires_known_session() {
        let settings = HttpSettings {
            transport: Transport::Sse,
            mount_path: "/legacy".to_string(),
        };
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(echo_service()))
                .app_data(web::Data::new(SseSessions::default()))
                .app_data(web::Data::new(settings.clone()))
                .configure(move |cfg| configure_routes(cfg, &settings)),
        )
        .await;

        let ping = json!({ "jsonrpc": "2.0", "id": 1, "method": "ping" });

        let req = actix_test::TestRequest::post()
            .uri("/legacy/messages/")
            .set_json(&ping)
            .to_request();
        assert_eq!(actix_test::call_service(&app, req).await.status(), 400);

        let req = actix_test::TestRequest::post()
            .uri("/legacy/messages/?session_id=unknown")
            .set_json(&ping)
            .to_request();
        assert_eq!(actix_test::call_service(&app, req).await.status(), 404);
    }
}
