mod alarm;
mod core;
mod engine;
mod http;
mod mpv;
mod sleep_timer;
mod socket;

use std::sync::Arc;

use pax_proto::config::Config;
use pax_proto::favorites::FavoritesStore;
use pax_proto::state::StateManager;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Clone)]
pub enum BroadcastMessage {
    StateUpdated,
    /// Short user-facing notice.
    Toast(String),
    Log(String),
}

/// Forwards WARN and ERROR events to connected clients.
struct BroadcastLayer {
    sender: broadcast::Sender<BroadcastMessage>,
}

impl BroadcastLayer {
    fn new(sender: broadcast::Sender<BroadcastMessage>) -> Self {
        Self { sender }
    }
}

impl<S> tracing_subscriber::Layer<S> for BroadcastLayer
where
    S: tracing::Subscriber,
{
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let level = event.metadata().level();
        if !matches!(*level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }

        let mut message = format!("{} [{}] ", chrono::Local::now().format("%H:%M:%S"), level);
        let mut visitor = MessageVisitor(&mut message);
        event.record(&mut visitor);

        // No receivers is fine.
        let _ = self.sender.send(BroadcastMessage::Log(message));
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl<'a> tracing::field::Visit for MessageVisitor<'a> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0.push_str(&format!("{:?}", value));
        } else {
            self.0.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Created first so the log layer can use it.
    let (broadcast_tx, _) = broadcast::channel::<BroadcastMessage>(100);

    let data_dir = pax_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("daemon.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(BroadcastLayer::new(broadcast_tx.clone()))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,paxradio_daemon=debug")),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    // Every external input funnels into the SessionController.
    let (event_tx, event_rx) = tokio::sync::mpsc::channel::<core::DaemonEvent>(256);

    let state_manager = Arc::new(StateManager::new(
        config.daemon.state_file.clone(),
        config.mpv.default_volume,
    ));
    let favorites = Arc::new(FavoritesStore::load(config.daemon.favorites_file.clone()));
    let engine = mpv::MpvEngine::new(state_manager.get_state().await.volume);
    let alarm = Box::new(alarm::TokioAlarmBridge::new(event_tx.clone()));

    let controller = core::SessionController::new(
        config.clone(),
        state_manager.clone(),
        favorites,
        engine,
        alarm,
        event_tx.clone(),
        broadcast_tx.clone(),
    )
    .await;

    let _socket_handle = socket::start_server(
        config.control.bind_address.clone(),
        config.control.port,
        state_manager.clone(),
        event_tx.clone(),
        broadcast_tx.clone(),
    );

    if config.http.enabled {
        let _http_handle = http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            state_manager.clone(),
            event_tx.clone(),
        );
    }

    let shutdown_tx = event_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Could not listen for ctrl-c: {}", e);
            return;
        }
        info!("Interrupt received");
        let _ = shutdown_tx.send(core::DaemonEvent::Shutdown).await;
    });
    drop(event_tx);

    info!("Daemon initialised, running event loop");
    controller.run(event_rx).await?;

    Ok(())
}
