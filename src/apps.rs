use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};

use crate::broker::ReviewBroker;
use crate::config::HitlSettings;
use crate::coordinator::CheckpointCoordinator;
use crate::ws::WsServer;

/// The running HITL service: one broker, the WebSocket server reviewers
/// connect to, and the coordinator the pipeline calls into.
pub struct App {
    broker: Arc<ReviewBroker>,
    coordinator: CheckpointCoordinator,
    ws_server: Option<WsServer>,
}

impl App {
    /// Bootstraps the service:
    ///   - creates the broker with the configured timeout
    ///   - binds the WebSocket server and registers it as the transport
    ///   - builds the coordinator from the checkpoint flags
    pub async fn bootstrap(settings: &HitlSettings) -> Result<Self> {
        let broker = ReviewBroker::new(settings.timeout);

        let bind = settings.ws_bind_addr();
        let ws_server = match WsServer::start(&bind, broker.clone()).await {
            Ok(server) => server,
            Err(err) => {
                error!("Could not start the HITL WebSocket server: {:#}", err);
                return Err(err).context("bootstrap failed");
            }
        };
        broker.set_transport(ws_server.broadcaster()).await;

        let coordinator = CheckpointCoordinator::new(broker.clone(), settings.flags);
        info!(
            timeout_secs = settings.timeout.as_secs_f64(),
            "HITL service ready on {}",
            ws_server.local_addr()
        );

        Ok(Self {
            broker,
            coordinator,
            ws_server: Some(ws_server),
        })
    }

    pub fn broker(&self) -> Arc<ReviewBroker> {
        self.broker.clone()
    }

    pub fn coordinator(&self) -> &CheckpointCoordinator {
        &self.coordinator
    }

    pub fn ws_addr(&self) -> Option<SocketAddr> {
        self.ws_server.as_ref().map(WsServer::local_addr)
    }

    /// Detach the transport first so reviews started from here on auto-approve
    /// instead of broadcasting into a closed server.
    pub async fn shutdown(&mut self) {
        self.broker.clear_transport().await;
        if let Some(server) = self.ws_server.take() {
            server.shutdown().await;
        }
        let abandoned = self.broker.pending_count();
        if abandoned > 0 {
            info!("{} reviews still waiting at shutdown", abandoned);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::CheckpointFlags;
    use std::time::Duration;

    fn local_settings() -> HitlSettings {
        HitlSettings {
            timeout: Duration::from_secs(3),
            ws_address: "127.0.0.1".into(),
            ws_port: 0,
            flags: CheckpointFlags {
                after_plan_generation: true,
                after_atomizer: false,
                before_execute: true,
            },
        }
    }

    #[tokio::test]
    async fn test_bootstrap_wires_transport_and_flags() {
        let mut app = App::bootstrap(&local_settings()).await.unwrap();
        assert!(app.broker().has_transport().await);
        assert!(app.ws_addr().is_some());
        assert!(app.coordinator().flags().before_execute);
        assert_eq!(app.broker().timeout(), Duration::from_secs(3));

        app.shutdown().await;
        assert!(!app.broker().has_transport().await);
        assert!(app.ws_addr().is_none());
    }

    #[tokio::test]
    async fn test_bootstrap_fails_on_bad_address() {
        let mut settings = local_settings();
        settings.ws_address = "not an address".into();
        assert!(App::bootstrap(&settings).await.is_err());
    }
}
