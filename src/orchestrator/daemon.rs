//! Sync daemon
//!
//! Long-running process wrapping the `SyncService`: a fixed pool of sync
//! workers pulling from the shared queue, an independent webhook consumer
//! pool (a stalled provider never blocks inbound event application), a
//! command channel, an event broadcast for observers, and graceful
//! shutdown on SIGTERM/SIGINT.

use super::service::{JobOutcome, SyncService, WebhookOutcome};
use crate::metrics;
use crate::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info};

/// Default event channel capacity
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 1000;

/// Events emitted by the daemon
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Daemon started
    Started,

    /// Daemon stopped
    Stopped,

    /// A sync job reached an outcome
    Job(JobOutcome),

    /// A webhook event was processed
    Webhook(WebhookOutcome),

    /// Worker error
    Error {
        /// Error message
        message: String,
    },
}

/// Commands accepted by the daemon
#[derive(Debug, Clone)]
pub enum SyncCommand {
    /// Stop the daemon
    Shutdown,
}

/// The sync daemon
pub struct SyncDaemon {
    service: Arc<SyncService>,
    event_tx: broadcast::Sender<SyncEvent>,
    command_tx: mpsc::Sender<SyncCommand>,
    command_rx: Option<mpsc::Receiver<SyncCommand>>,
}

impl SyncDaemon {
    pub fn new(service: Arc<SyncService>) -> Self {
        Self::with_capacity(service, DEFAULT_EVENT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(service: Arc<SyncService>, event_capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(event_capacity);
        let (command_tx, command_rx) = mpsc::channel(10);
        Self {
            service,
            event_tx,
            command_tx,
            command_rx: Some(command_rx),
        }
    }

    /// Get an event subscriber
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.event_tx.subscribe()
    }

    /// Get a command sender
    pub fn command_sender(&self) -> mpsc::Sender<SyncCommand> {
        self.command_tx.clone()
    }

    pub fn service(&self) -> Arc<SyncService> {
        self.service.clone()
    }

    /// Run until shutdown
    ///
    /// Recovers persisted queue state, spawns the worker pools, then
    /// waits for a shutdown command or signal. Workers drain their
    /// current job before exiting; no job is abandoned mid-flight.
    pub async fn run(&mut self) -> Result<()> {
        let mut command_rx = self
            .command_rx
            .take()
            .ok_or_else(|| crate::SyncError::Config("Daemon already running".to_string()))?;

        self.service.recover()?;

        metrics::set_health_status(true);
        let _ = self.event_tx.send(SyncEvent::Started);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let poll_interval =
            Duration::from_millis(self.service.config().workers.poll_interval_ms);

        let mut handles = Vec::new();

        let sync_workers = self.service.config().workers.sync_workers;
        for worker in 0..sync_workers {
            handles.push(tokio::spawn(sync_worker_loop(
                worker,
                self.service.clone(),
                self.event_tx.clone(),
                shutdown_rx.clone(),
                poll_interval,
            )));
        }

        let webhook_workers = self.service.config().workers.webhook_workers;
        for worker in 0..webhook_workers {
            handles.push(tokio::spawn(webhook_worker_loop(
                worker,
                self.service.clone(),
                self.event_tx.clone(),
                shutdown_rx.clone(),
                poll_interval,
            )));
        }

        info!(
            sync_workers,
            webhook_workers,
            poll_interval_ms = poll_interval.as_millis() as u64,
            "Sync daemon running"
        );

        self.wait_for_shutdown(&mut command_rx).await;

        let _ = shutdown_tx.send(true);
        let _ = futures::future::join_all(handles).await;

        info!("Sync daemon shutdown complete");
        metrics::set_health_status(false);
        let _ = self.event_tx.send(SyncEvent::Stopped);
        Ok(())
    }

    /// Block until a shutdown command or signal arrives
    #[cfg(unix)]
    async fn wait_for_shutdown(&self, command_rx: &mut mpsc::Receiver<SyncCommand>) {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                self.wait_for_command(command_rx).await;
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGINT handler");
                self.wait_for_command(command_rx).await;
                return;
            }
        };

        loop {
            tokio::select! {
                cmd = command_rx.recv() => {
                    match cmd {
                        Some(SyncCommand::Shutdown) | None => {
                            info!("Received shutdown command");
                            break;
                        }
                    }
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                    break;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating graceful shutdown");
                    break;
                }
            }
        }
    }

    #[cfg(not(unix))]
    async fn wait_for_shutdown(&self, command_rx: &mut mpsc::Receiver<SyncCommand>) {
        self.wait_for_command(command_rx).await;
    }

    async fn wait_for_command(&self, command_rx: &mut mpsc::Receiver<SyncCommand>) {
        loop {
            match command_rx.recv().await {
                Some(SyncCommand::Shutdown) | None => {
                    info!("Received shutdown command");
                    break;
                }
            }
        }
    }
}

/// Builder for the sync daemon
pub struct SyncDaemonBuilder {
    service: Arc<SyncService>,
    event_capacity: usize,
}

impl SyncDaemonBuilder {
    pub fn new(service: Arc<SyncService>) -> Self {
        Self {
            service,
            event_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
        }
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn build(self) -> SyncDaemon {
        SyncDaemon::with_capacity(self.service, self.event_capacity)
    }
}

/// One sync worker: poll, process, sleep when idle
///
/// Each job is owned start-to-finish by the worker that dequeued it.
async fn sync_worker_loop(
    worker: usize,
    service: Arc<SyncService>,
    event_tx: broadcast::Sender<SyncEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
    poll_interval: Duration,
) {
    debug!(worker, "Sync worker started");
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        match service.process_next_job().await {
            Ok(Some(outcome)) => {
                let _ = event_tx.send(SyncEvent::Job(outcome));
            }
            Ok(None) => {
                idle_wait(&mut shutdown_rx, poll_interval).await;
            }
            Err(e) => {
                let _ = event_tx.send(SyncEvent::Error {
                    message: format!("sync worker {}: {}", worker, e),
                });
                idle_wait(&mut shutdown_rx, poll_interval).await;
            }
        }
    }
    debug!(worker, "Sync worker stopped");
}

/// One webhook consumer: poll, apply, sleep when idle
async fn webhook_worker_loop(
    worker: usize,
    service: Arc<SyncService>,
    event_tx: broadcast::Sender<SyncEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
    poll_interval: Duration,
) {
    debug!(worker, "Webhook worker started");
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        match service.process_next_webhook() {
            Ok(Some(outcome)) => {
                let _ = event_tx.send(SyncEvent::Webhook(outcome));
            }
            Ok(None) => {
                idle_wait(&mut shutdown_rx, poll_interval).await;
            }
            Err(e) => {
                let _ = event_tx.send(SyncEvent::Error {
                    message: format!("webhook worker {}: {}", worker, e),
                });
                idle_wait(&mut shutdown_rx, poll_interval).await;
            }
        }
    }
    debug!(worker, "Webhook worker stopped");
}

/// Sleep for the poll interval, waking early on shutdown
async fn idle_wait(shutdown_rx: &mut watch::Receiver<bool>, poll_interval: Duration) {
    tokio::select! {
        _ = tokio::time::sleep(poll_interval) => {}
        _ = shutdown_rx.changed() => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::system_clock;
    use crate::config::SyncConfig;
    use crate::model::{InvoiceId, InvoiceSnapshot, Priority, Provider};
    use crate::provider::{MockProviderClient, ProviderRegistry};
    use crate::store::{MemoryStore, Store};
    use chrono::Utc;

    fn service_with_mock() -> (Arc<SyncService>, Arc<MockProviderClient>) {
        let store = Arc::new(MemoryStore::new());
        let mock = Arc::new(MockProviderClient::new(Provider::QuickBooks));

        let mut providers = ProviderRegistry::new();
        providers.register(mock.clone());

        let mut config = SyncConfig::default();
        config.workers.sync_workers = 2;
        config.workers.webhook_workers = 1;
        config.workers.poll_interval_ms = 10;

        store
            .upsert_snapshot(&InvoiceSnapshot {
                invoice_id: InvoiceId::new("inv-1"),
                organization_id: "org-1".to_string(),
                invoice_number: "INV-1".to_string(),
                customer_name: "Acme Restoration".to_string(),
                total_cents: 10_000,
                currency: "USD".to_string(),
                issued_at: Utc::now(),
                memo: None,
            })
            .unwrap();

        let service = Arc::new(SyncService::new(
            config,
            store,
            providers,
            system_clock(),
        ));
        (service, mock)
    }

    #[tokio::test]
    async fn test_daemon_processes_job_then_shuts_down() {
        let (service, mock) = service_with_mock();
        mock.push_success("qb-1");

        service
            .enqueue_sync(InvoiceId::new("inv-1"), Provider::QuickBooks, Priority::Normal)
            .unwrap();

        let mut daemon = SyncDaemon::new(service.clone());
        let mut events = daemon.subscribe();
        let commands = daemon.command_sender();

        let run = tokio::spawn(async move { daemon.run().await });

        // Wait for the job outcome event, then stop the daemon
        let mut synced = false;
        for _ in 0..50 {
            match tokio::time::timeout(Duration::from_millis(200), events.recv()).await {
                Ok(Ok(SyncEvent::Job(JobOutcome::Synced { external_id, .. }))) => {
                    assert_eq!(external_id, "qb-1");
                    synced = true;
                    break;
                }
                Ok(Ok(_)) => continue,
                _ => break,
            }
        }
        assert!(synced, "daemon never reported the sync outcome");

        commands.send(SyncCommand::Shutdown).await.unwrap();
        run.await.unwrap().unwrap();
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_daemon_cannot_run_twice() {
        let (service, _) = service_with_mock();
        let mut daemon = SyncDaemon::new(service);
        let commands = daemon.command_sender();

        commands.send(SyncCommand::Shutdown).await.unwrap();
        daemon.run().await.unwrap();
        assert!(daemon.run().await.is_err());
    }
}
