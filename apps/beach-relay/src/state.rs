use std::sync::Arc;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusHandle;
use tokio::task::JoinHandle;

use crate::config::RelayConfig;
use crate::dispatch::Dispatcher;
use crate::pending::PendingRequestTable;
use crate::registry::{ClientRegistry, RegistryBuilder};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RelayConfig>,
    pub registry: Arc<ClientRegistry>,
    pub pending: Arc<PendingRequestTable>,
    pub dispatcher: Dispatcher,
    pub metrics: Option<PrometheusHandle>,
    pub started: Instant,
}

impl AppState {
    pub fn build(config: RelayConfig, metrics: Option<PrometheusHandle>) -> Self {
        Self::with_handlers(config, metrics, |builder| builder)
    }

    /// Like [`AppState::build`], letting the caller subscribe extra
    /// inbound handlers before the registry is frozen.
    pub fn with_handlers<F>(config: RelayConfig, metrics: Option<PrometheusHandle>, extend: F) -> Self
    where
        F: FnOnce(RegistryBuilder) -> RegistryBuilder,
    {
        let pending = Arc::new(PendingRequestTable::new());
        let mut builder = Dispatcher::install(ClientRegistry::builder(), &pending);
        if config.fail_pending_on_disconnect {
            let table = Arc::clone(&pending);
            builder = builder.on_client_removed(move |client| {
                table.fail_client(client.id(), client.connection().id());
            });
        }
        let registry = Arc::new(extend(builder).build());
        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&pending),
            config.request_timeout,
        );

        Self {
            config: Arc::new(config),
            registry,
            pending,
            dispatcher,
            metrics,
            started: Instant::now(),
        }
    }

    /// Starts the registry and pending sweepers.
    pub fn spawn_background(&self) -> Vec<JoinHandle<()>> {
        vec![
            self.registry.spawn_sweeper(self.config.cleanup_interval),
            self.pending
                .spawn_sweeper(self.config.pending_sweep_interval, self.config.pending_max_age),
        ]
    }

    pub fn render_metrics(&self) -> Option<String> {
        self.metrics.as_ref().map(PrometheusHandle::render)
    }
}
