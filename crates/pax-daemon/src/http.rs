use crate::core::DaemonEvent;
use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use pax_proto::protocol::{Command, SessionState};
use pax_proto::state::StateManager;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

#[derive(Clone)]
struct HttpState {
    state_manager: Arc<StateManager>,
    event_tx: mpsc::Sender<DaemonEvent>,
}

pub fn start_server(
    bind_address: String,
    port: u16,
    state_manager: Arc<StateManager>,
    event_tx: mpsc::Sender<DaemonEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(state_manager, event_tx);

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    })
}

fn router(state_manager: Arc<StateManager>, event_tx: mpsc::Sender<DaemonEvent>) -> Router {
    let app_state = HttpState {
        state_manager,
        event_tx,
    };

    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/command", post(command))
        .route("/api/toggle", post(toggle))
        .route("/api/stop", post(stop))
        .route("/api/next", post(next_station))
        .route("/api/prev", post(prev_station))
        .route("/api/random", post(random_station))
        .layer(CorsLayer::permissive())
        .with_state(app_state)
}

async fn forward(state: &HttpState, cmd: Command) -> StatusCode {
    info!("HTTP API: {:?}", cmd);
    if state.event_tx.send(DaemonEvent::ClientCommand(cmd)).await.is_err() {
        error!("Failed to forward HTTP command");
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    StatusCode::ACCEPTED
}

async fn get_state(State(state): State<HttpState>) -> Json<SessionState> {
    Json(state.state_manager.get_state().await)
}

async fn command(State(state): State<HttpState>, Json(cmd): Json<Command>) -> StatusCode {
    forward(&state, cmd).await
}

async fn toggle(State(state): State<HttpState>) -> StatusCode {
    forward(&state, Command::Toggle).await
}

async fn stop(State(state): State<HttpState>) -> StatusCode {
    forward(&state, Command::Stop).await
}

async fn next_station(State(state): State<HttpState>) -> StatusCode {
    forward(&state, Command::Next).await
}

async fn prev_station(State(state): State<HttpState>) -> StatusCode {
    forward(&state, Command::Prev).await
}

async fn random_station(State(state): State<HttpState>) -> StatusCode {
    forward(&state, Command::Random).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use pax_proto::protocol::PlaybackState;
    use tower::ServiceExt;

    fn app(dir: &std::path::Path) -> (Router, mpsc::Receiver<DaemonEvent>) {
        let sm = Arc::new(StateManager::new(dir.join("state.json"), 0.5));
        let (tx, rx) = mpsc::channel(8);
        (router(sm, tx), rx)
    }

    #[tokio::test]
    async fn test_get_state() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _rx) = app(dir.path());

        let request = Request::builder()
            .uri("/api/state")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let state: SessionState = serde_json::from_slice(&body).unwrap();
        assert_eq!(state.playback, PlaybackState::Idle);
        assert_eq!(state.volume, 0.5);
    }

    #[tokio::test]
    async fn test_command_body_is_forwarded() {
        let dir = tempfile::tempdir().unwrap();
        let (app, mut rx) = app(dir.path());

        let request = Request::builder()
            .uri("/api/command")
            .method("POST")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"cmd":"SleepTimer","duration_ms":900000}"#))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        match rx.recv().await.unwrap() {
            DaemonEvent::ClientCommand(cmd) => {
                assert_eq!(cmd, Command::SleepTimer { duration_ms: 900_000 })
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_shortcut_routes() {
        let dir = tempfile::tempdir().unwrap();
        let (app, mut rx) = app(dir.path());

        for (path, expected) in [
            ("/api/toggle", Command::Toggle),
            ("/api/next", Command::Next),
            ("/api/random", Command::Random),
        ] {
            let request = Request::builder()
                .uri(path)
                .method("POST")
                .body(Body::empty())
                .unwrap();
            let response = app.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::ACCEPTED);
            match rx.recv().await.unwrap() {
                DaemonEvent::ClientCommand(cmd) => assert_eq!(cmd, expected),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_unknown_command_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (app, mut rx) = app(dir.path());

        let request = Request::builder()
            .uri("/api/command")
            .method("POST")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"cmd":"SelfDestruct"}"#))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert!(response.status().is_client_error());
        assert!(rx.try_recv().is_err());
    }
}
