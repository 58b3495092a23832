//! Worker lifecycle manager
//!
//! Owns the set of running [`ResilientConsumer`]s. The set is empty until
//! [`WorkerManager::start`] builds one consumer per [`ConsumerDefinition`].

use futures::future::join_all;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use event_bus::{Broker, ConsumerConfig};

use crate::consumer::{ConsumerError, ConsumerStatus, ResilientConsumer};
use crate::handler::MessageHandler;

/// Everything needed to (re)create one consumer
#[derive(Clone)]
pub struct ConsumerDefinition {
    pub config: ConsumerConfig,
    pub handler: Arc<dyn MessageHandler>,
}

impl ConsumerDefinition {
    pub fn new(config: ConsumerConfig, handler: Arc<dyn MessageHandler>) -> Self {
        Self { config, handler }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    /// When false, `start()` logs and does nothing
    pub enabled: bool,
    pub broker_url: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("consumer '{name}' failed to start: {source}")]
    StartFailed {
        name: String,
        #[source]
        source: ConsumerError,
    },

    #[error("unknown consumer '{0}'")]
    UnknownConsumer(String),

    #[error("duplicate consumer name '{0}'")]
    DuplicateConsumer(String),
}

/// Aggregate status, serialized by the status endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagerStatus {
    pub enabled: bool,
    pub is_running: bool,
    /// False when messaging is enabled and a consumer is missing or not connected
    pub healthy: bool,
    pub consumers: Vec<ConsumerStatus>,
}

pub struct WorkerManager {
    settings: WorkerSettings,
    broker: Arc<dyn Broker>,
    definitions: Vec<ConsumerDefinition>,
    consumers: Mutex<Vec<Arc<ResilientConsumer>>>,
}

impl WorkerManager {
    pub fn new(
        settings: WorkerSettings,
        broker: Arc<dyn Broker>,
        definitions: Vec<ConsumerDefinition>,
    ) -> Result<Self, ManagerError> {
        let mut names = HashSet::new();
        for definition in &definitions {
            if !names.insert(definition.config.name.as_str()) {
                return Err(ManagerError::DuplicateConsumer(definition.config.name.clone()));
            }
        }

        Ok(Self {
            settings,
            broker,
            definitions,
            consumers: Mutex::new(Vec::new()),
        })
    }

    pub async fn is_running(&self) -> bool {
        !self.consumers.lock().await.is_empty()
    }

    /// Start every configured consumer, in order
    ///
    /// All-or-nothing: if one consumer fails to start, the ones already
    /// started are stopped and the error is returned. No-op when already
    /// running or when messaging is disabled.
    ///
    /// The consumers join the managed set before they connect and the set
    /// lock is never held across a connect, so [`Self::status`] stays
    /// responsive and [`Self::stop`] abandons a start that is still dialling.
    pub async fn start(&self) -> Result<(), ManagerError> {
        if !self.settings.enabled {
            info!("Messaging disabled, worker manager not starting consumers");
            return Ok(());
        }

        let starting: Vec<(String, Arc<ResilientConsumer>)> = {
            let mut consumers = self.consumers.lock().await;
            if !consumers.is_empty() {
                info!(consumers = consumers.len(), "Worker manager already running");
                return Ok(());
            }

            let starting: Vec<_> = self
                .definitions
                .iter()
                .map(|d| (d.config.name.clone(), Arc::new(self.build(d))))
                .collect();
            consumers.extend(starting.iter().map(|(_, c)| c.clone()));
            starting
        };

        info!(consumers = starting.len(), "Starting event consumers");

        for (name, consumer) in &starting {
            let result = consumer.start().await;
            let managed = self.is_managed(consumer).await;

            let source = match result {
                Ok(()) if managed => continue,
                Ok(()) => ConsumerError::Stopped,
                Err(source) => source,
            };

            error!(consumer = %name, error = %source, "Consumer failed to start, rolling back");
            let ours: Vec<_> = starting.iter().map(|(_, c)| c.clone()).collect();
            self.consumers
                .lock()
                .await
                .retain(|c| !ours.iter().any(|o| Arc::ptr_eq(o, c)));
            stop_all(ours).await;

            return Err(ManagerError::StartFailed {
                name: name.clone(),
                source,
            });
        }

        info!(consumers = starting.len(), "Event consumers started");
        Ok(())
    }

    /// Stop all consumers concurrently and clear the managed set
    pub async fn stop(&self) {
        let stopping: Vec<_> = self.consumers.lock().await.drain(..).collect();
        if stopping.is_empty() {
            return;
        }

        let count = stopping.len();
        stop_all(stopping).await;
        info!(consumers = count, "Event consumers stopped");
    }

    pub async fn restart(&self) -> Result<(), ManagerError> {
        self.stop().await;
        self.start().await
    }

    /// Stop and re-create exactly one managed consumer; the others keep running
    ///
    /// Fails with [`ManagerError::UnknownConsumer`] unless `name` is in the
    /// managed set, so it never starts anything on a stopped or disabled
    /// manager. A replacement that fails to start stays managed and is
    /// reported unhealthy until restarted again.
    pub async fn restart_consumer(&self, name: &str) -> Result<(), ManagerError> {
        let (old, replacement) = {
            let mut consumers = self.consumers.lock().await;
            let index = consumers
                .iter()
                .position(|c| c.name() == name)
                .ok_or_else(|| ManagerError::UnknownConsumer(name.to_string()))?;
            let definition = self
                .definitions
                .iter()
                .find(|d| d.config.name == name)
                .ok_or_else(|| ManagerError::UnknownConsumer(name.to_string()))?;

            let replacement = Arc::new(self.build(definition));
            let old = std::mem::replace(&mut consumers[index], replacement.clone());
            (old, replacement)
        };

        if let Err(e) = old.stop().await {
            warn!(consumer = %name, error = %e, "Error stopping consumer during restart");
        }

        replacement
            .start()
            .await
            .map_err(|source| ManagerError::StartFailed {
                name: name.to_string(),
                source,
            })?;

        info!(consumer = %name, "Consumer restarted");
        Ok(())
    }

    pub async fn status(&self) -> ManagerStatus {
        let consumers: Vec<ConsumerStatus> = self
            .consumers
            .lock()
            .await
            .iter()
            .map(|c| c.status())
            .collect();

        let is_running = !consumers.is_empty();
        let healthy = !self.settings.enabled
            || (consumers.len() == self.definitions.len() && consumers.iter().all(|c| c.connected));

        ManagerStatus {
            enabled: self.settings.enabled,
            is_running,
            healthy,
            consumers,
        }
    }

    async fn is_managed(&self, consumer: &Arc<ResilientConsumer>) -> bool {
        self.consumers
            .lock()
            .await
            .iter()
            .any(|c| Arc::ptr_eq(c, consumer))
    }

    fn build(&self, definition: &ConsumerDefinition) -> ResilientConsumer {
        ResilientConsumer::new(
            self.broker.clone(),
            self.settings.broker_url.clone(),
            definition.config.clone(),
            definition.handler.clone(),
        )
    }
}

async fn stop_all(consumers: Vec<Arc<ResilientConsumer>>) {
    let results = join_all(consumers.iter().map(|c| c.stop())).await;

    for (consumer, result) in consumers.iter().zip(results) {
        if let Err(e) = result {
            warn!(consumer = %consumer.name(), error = %e, "Error stopping consumer");
        }
    }
}
