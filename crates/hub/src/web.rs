use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::broker::BrokerConnection;
use crate::db::Db;
use crate::live::{EntityKind, LiveSnapshot, LiveStateCache, Subscription, ENVIRONMENT_ID};
use crate::series::{RollingSeriesStore, SeriesPoint};
use crate::state::SharedState;
use crate::telemetry::Telemetry;

/// Per-client buffer; a client that falls further behind loses events.
const STREAM_BUFFER: usize = 64;
const DEFAULT_EXECUTIONS: i64 = 50;
const MAX_EXECUTIONS: i64 = 500;

#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    pub broker: BrokerConnection,
    pub series: Arc<RollingSeriesStore>,
    pub live: Arc<LiveStateCache>,
    pub telemetry: Arc<Telemetry>,
    pub db: Db,
    pub heartbeat: Duration,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/environment", get(api_environment))
        .route("/api/devices/{id}/status", get(api_device_status))
        .route("/api/series/{id}", get(api_series))
        .route("/api/executions", get(api_executions))
        .route("/api/stream", get(api_stream))
        .route("/api/topics/reload", post(api_reload))
        .with_state(state)
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    let topics = state.broker.subscribed_topics().await;
    let series = state.series.series_ids();
    let listeners = state.live.listener_count();
    let st = state.shared.read();
    Json(st.to_status(state.broker.state(), topics, series, listeners))
}

fn unavailable() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "available": false })),
    )
        .into_response()
}

fn internal_error(e: anyhow::Error) -> Response {
    error!("request failed: {e:#}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": format!("{e:#}") })),
    )
        .into_response()
}

async fn api_environment(State(state): State<AppState>) -> Response {
    match state.live.get(ENVIRONMENT_ID) {
        Some(snap) => Json(snap).into_response(),
        None => unavailable(),
    }
}

async fn api_device_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    match state.live.get(&id) {
        Some(snap) if snap.kind == EntityKind::Device => Json(snap).into_response(),
        _ => unavailable(),
    }
}

#[derive(Serialize)]
struct SeriesResponse {
    id: String,
    capacity: usize,
    points: Vec<SeriesPoint>,
}

async fn api_series(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let points = state.series.snapshot(&id);
    Json(SeriesResponse {
        id,
        capacity: state.series.capacity(),
        points,
    })
}

#[derive(Deserialize)]
struct ExecutionsQuery {
    limit: Option<i64>,
}

async fn api_executions(
    State(state): State<AppState>,
    Query(q): Query<ExecutionsQuery>,
) -> Response {
    let limit = q.limit.unwrap_or(DEFAULT_EXECUTIONS).clamp(1, MAX_EXECUTIONS);
    match state.db.recent_executions(limit).await {
        Ok(records) => Json(records).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn api_reload(State(state): State<AppState>) -> Response {
    let devices = match state.db.load_devices().await {
        Ok(d) => d,
        Err(e) => return internal_error(e),
    };
    let charts = match state.db.load_charts().await {
        Ok(c) => c,
        Err(e) => return internal_error(e),
    };

    let summary = state.telemetry.reload(&devices, &charts).await;
    state.shared.write().record_system(format!(
        "topics reloaded: +{} ~{} -{}",
        summary.attached.len(),
        summary.repointed.len(),
        summary.detached.len()
    ));
    Json(summary).into_response()
}

// ---------------------------------------------------------------------------
// Server-sent events
// ---------------------------------------------------------------------------

fn rfc3339(ts: OffsetDateTime) -> String {
    ts.format(&Rfc3339).unwrap_or_default()
}

/// Client-facing JSON for a live update, or `None` for updates that are not
/// streamed.
pub fn sse_payload(snap: &LiveSnapshot) -> Option<Value> {
    let timestamp = rfc3339(snap.last_update);
    match snap.kind {
        EntityKind::Environment => Some(json!({
            "temperature": snap.fields.get("temperature")?,
            "humidity": snap.fields.get("humidity")?,
            "timestamp": timestamp,
        })),
        EntityKind::Nutrient => Some(json!({
            "type": "nutrient",
            "id": snap.entity_id,
            "value": snap.fields.get("value")?,
            "timestamp": timestamp,
        })),
        EntityKind::Device => Some(json!({
            "type": "device",
            "id": snap.entity_id,
            "on": snap.fields.get("on")?,
            "timestamp": timestamp,
        })),
    }
}

/// One client's stream. Dropping it drops the cache subscription and the
/// heartbeat timer.
struct ClientStream {
    greeted: bool,
    rx: mpsc::Receiver<Value>,
    heartbeat: Interval,
    _subscription: Subscription,
}

fn client_stream(
    live: &LiveStateCache,
    heartbeat: Duration,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    let subscription = live.subscribe(move |snap| {
        if let Some(payload) = sse_payload(snap) {
            if tx.try_send(payload).is_err() {
                debug!("stream client lagging, update dropped");
            }
        }
    });

    let mut ticker = interval_at(Instant::now() + heartbeat, heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let client = ClientStream {
        greeted: false,
        rx,
        heartbeat: ticker,
        _subscription: subscription,
    };

    stream::unfold(client, |mut c| async move {
        if !c.greeted {
            c.greeted = true;
            let hello = json!({ "timestamp": rfc3339(OffsetDateTime::now_utc()) });
            return Some((Ok(Event::default().event("connected").data(hello.to_string())), c));
        }

        let event = tokio::select! {
            _ = c.heartbeat.tick() => {
                let beat = json!({ "timestamp": rfc3339(OffsetDateTime::now_utc()) });
                Event::default().event("heartbeat").data(beat.to_string())
            }
            update = c.rx.recv() => Event::default().data(update?.to_string()),
        };
        Some((Ok(event), c))
    })
}

async fn api_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    debug!("stream client connected");
    Sse::new(client_stream(&state.live, state.heartbeat))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!(%addr, "http api listening");

    axum::serve(listener, router(state)).await?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::testing::recording_connection;
    use crate::live::Fields;
    use crate::router::TopicRouter;
    use crate::state::SystemState;
    use crate::store::{Device, ExecutionLog, ExecutionRecord, Outcome};
    use axum::body::Body;
    use axum::http::Request;
    use futures::StreamExt;
    use http_body_util::BodyExt;
    use time::macros::datetime;
    use tower::ServiceExt;

    async fn app_state() -> AppState {
        let (broker, _client) = recording_connection();
        broker.on_connected().await;
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();

        let router = Arc::new(TopicRouter::new(broker.clone()));
        let series = Arc::new(RollingSeriesStore::new(5));
        let live = Arc::new(LiveStateCache::default());
        let telemetry = Arc::new(Telemetry::new(
            router,
            Arc::clone(&series),
            Arc::clone(&live),
        ));
        AppState {
            shared: SystemState::shared(),
            broker,
            series,
            live,
            telemetry,
            db,
            heartbeat: Duration::from_secs(30),
        }
    }

    fn fields(v: Value) -> Fields {
        v.as_object().cloned().unwrap()
    }

    async fn get_json(state: &AppState, uri: &str) -> (StatusCode, Value) {
        let resp = router(state.clone())
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    // -- Plain routes -----------------------------------------------------

    #[tokio::test]
    async fn environment_unavailable_until_first_reading() {
        let state = app_state().await;
        let (status, body) = get_json(&state, "/api/environment").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, json!({ "available": false }));

        state.live.update(
            ENVIRONMENT_ID,
            EntityKind::Environment,
            fields(json!({"temperature": 26.5, "humidity": 65.3})),
        );
        let (status, body) = get_json(&state, "/api/environment").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["fields"]["temperature"], 26.5);
    }

    #[tokio::test]
    async fn device_status_route() {
        let state = app_state().await;
        let (status, _) = get_json(&state, "/api/devices/d1/status").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        state
            .live
            .update("d1", EntityKind::Device, fields(json!({"on": true})));
        let (status, body) = get_json(&state, "/api/devices/d1/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["fields"]["on"], true);
        assert_eq!(body["kind"], "device");
    }

    #[tokio::test]
    async fn series_route_returns_window() {
        let state = app_state().await;
        state.series.append("ph", SeriesPoint::now(6.1));
        state.series.append("ph", SeriesPoint::now(6.3));

        let (status, body) = get_json(&state, "/api/series/ph").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["capacity"], 5);
        assert_eq!(body["points"][0]["value"], 6.1);
        assert_eq!(body["points"][1]["value"], 6.3);

        let (_, body) = get_json(&state, "/api/series/unknown").await;
        assert_eq!(body["points"], json!([]));
    }

    #[tokio::test]
    async fn executions_newest_first_with_limit() {
        let state = app_state().await;
        for (i, ts) in [
            datetime!(2024-01-01 07:00 +7),
            datetime!(2024-01-02 07:00 +7),
        ]
        .into_iter()
        .enumerate()
        {
            state
                .db
                .append(&ExecutionRecord {
                    schedule_id: format!("s{i}"),
                    device_id: "d1".into(),
                    outcome: Outcome::Success,
                    timestamp: ts,
                    detail: String::new(),
                })
                .await
                .unwrap();
        }

        let (status, body) = get_json(&state, "/api/executions?limit=1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["schedule_id"], "s1");
        assert_eq!(body[0]["outcome"], "success");
    }

    #[tokio::test]
    async fn status_reports_broker_and_topics() {
        let state = app_state().await;
        state.broker.subscribe("env/sensor").await.unwrap();

        let (status, body) = get_json(&state, "/api/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["broker"], "connected");
        assert_eq!(body["subscribed_topics"], json!(["env/sensor"]));
    }

    #[tokio::test]
    async fn reload_attaches_stored_devices() {
        let state = app_state().await;
        state
            .db
            .upsert_device(&Device {
                id: "d1".into(),
                name: "Pump".into(),
                topic: Some("device/1/status".into()),
            })
            .await
            .unwrap();

        let resp = router(state.clone())
            .oneshot(
                Request::post("/api/topics/reload")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["attached"], json!(["device:d1"]));
        assert_eq!(
            state.broker.subscribed_topics().await,
            vec!["device/1/status".to_string()]
        );
    }

    // -- SSE --------------------------------------------------------------

    #[test]
    fn sse_payload_shapes() {
        let ts = datetime!(2024-01-01 07:00 UTC);
        let env = LiveSnapshot {
            entity_id: ENVIRONMENT_ID.into(),
            kind: EntityKind::Environment,
            fields: fields(json!({"temperature": 26.5, "humidity": 65.3})),
            last_update: ts,
        };
        assert_eq!(
            sse_payload(&env).unwrap(),
            json!({"temperature": 26.5, "humidity": 65.3, "timestamp": "2024-01-01T07:00:00Z"})
        );

        let nutrient = LiveSnapshot {
            entity_id: "tds".into(),
            kind: EntityKind::Nutrient,
            fields: fields(json!({"value": 812.0})),
            last_update: ts,
        };
        assert_eq!(
            sse_payload(&nutrient).unwrap(),
            json!({"type": "nutrient", "id": "tds", "value": 812.0, "timestamp": "2024-01-01T07:00:00Z"})
        );

        let pump = LiveSnapshot {
            entity_id: "d1".into(),
            kind: EntityKind::Device,
            fields: fields(json!({"on": true})),
            last_update: ts,
        };
        assert_eq!(
            sse_payload(&pump).unwrap(),
            json!({"type": "device", "id": "d1", "on": true, "timestamp": "2024-01-01T07:00:00Z"})
        );

        let partial = LiveSnapshot {
            fields: fields(json!({"temperature": 26.5})),
            ..env
        };
        assert!(sse_payload(&partial).is_none());
    }

    async fn next_text(body: &mut Body) -> String {
        let frame = tokio::time::timeout(Duration::from_secs(2), body.frame())
            .await
            .expect("stream stalled")
            .unwrap()
            .unwrap();
        String::from_utf8(frame.into_data().unwrap().to_vec()).unwrap()
    }

    #[tokio::test]
    async fn stream_greets_then_pushes_updates() {
        let state = app_state().await;
        let resp = router(state.clone())
            .oneshot(Request::get("/api/stream").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let mut body = resp.into_body();

        let first = next_text(&mut body).await;
        assert!(first.contains("event: connected"), "got {first:?}");

        state.live.update(
            ENVIRONMENT_ID,
            EntityKind::Environment,
            fields(json!({"temperature": 27.0, "humidity": 60.0})),
        );
        let update = next_text(&mut body).await;
        assert!(update.contains("\"temperature\":27.0"), "got {update:?}");
        assert!(!update.contains("event:"), "default event expected: {update:?}");

        assert_eq!(state.live.listener_count(), 1);
        drop(body);
        assert_eq!(state.live.listener_count(), 0);
    }

    #[tokio::test]
    async fn stream_sends_heartbeats() {
        let live = LiveStateCache::default();
        let mut stream = Box::pin(client_stream(&live, Duration::from_millis(20)));

        assert!(stream.next().await.is_some()); // connected
        let beat = tokio::time::timeout(Duration::from_secs(2), stream.next()).await;
        assert!(matches!(beat, Ok(Some(Ok(_)))));
        assert_eq!(live.listener_count(), 1);

        drop(stream);
        assert_eq!(live.listener_count(), 0);
    }
}
