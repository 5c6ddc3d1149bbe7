//! Composition root.
//!
//! Every collaborator is constructed here explicitly and handed to its
//! dependents; there is no container magic. Teardown is an ordered hook
//! list run LIFO with a shared deadline.

use anyhow::anyhow;
use futures::future::BoxFuture;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::errors::ApiError;
use crate::events::{spawn_event_consumer, ChannelEventPublisher, EventPublisher, NoopEventPublisher};
use crate::idempotency::{self, IdempotencyStore, SWEEP_INTERVAL};
use crate::kv::MemoryKvStore;
use crate::middleware::{IdempotencyLayerState, RateLimiter};
use crate::repository::{CartRepository, KvCartRepository};
use crate::resilience::{OperationClass, ResiliencePipeline};
use crate::services::{cart_service::STORE_RESOURCE, CartService};

type ShutdownHook = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Resolved singletons plus the ordered teardown list.
pub struct Application {
    pub config: AppConfig,
    pub repository: Arc<dyn CartRepository>,
    pub events: Arc<dyn EventPublisher>,
    pub idempotency: Arc<dyn IdempotencyStore>,
    pub resilience: Arc<ResiliencePipeline>,
    pub rate_limiter: Arc<RateLimiter>,
    shutdown_hooks: Mutex<Vec<(&'static str, ShutdownHook)>>,
}

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub cart_service: Arc<CartService>,
    pub application: Arc<Application>,
}

impl Application {
    /// Wires the whole object graph from configuration and spawns the
    /// background tasks (event consumer, idempotency sweeper).
    pub async fn build(config: AppConfig) -> anyhow::Result<Arc<Self>> {
        let store = Arc::new(MemoryKvStore::new());
        let repository: Arc<dyn CartRepository> = Arc::new(KvCartRepository::new(
            store.clone(),
            config.dynamodb_table.clone(),
        ));

        let resilience = Arc::new(ResiliencePipeline::from_config(&config));
        let rate_limiter = Arc::new(RateLimiter::new(
            config.rate_limit_rps,
            config.rate_limit_burst,
        ));

        let mut hooks: Vec<(&'static str, ShutdownHook)> = Vec::new();

        // Stands in for the hosted store's asynchronous TTL reaper.
        let reaper = {
            let store = store.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(300));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    store.sweep_expired();
                }
            })
        };
        hooks.push((
            "ttl-reaper",
            Box::new(move || {
                Box::pin(async move {
                    reaper.abort();
                    Ok(())
                })
            }),
        ));

        let events: Arc<dyn EventPublisher> = if config.eventbridge_enabled {
            let (publisher, rx) = ChannelEventPublisher::channel(config.event_channel_capacity());
            let consumer = spawn_event_consumer(rx);
            hooks.push((
                "event-consumer",
                Box::new(move || {
                    Box::pin(async move {
                        consumer.abort();
                        Ok(())
                    })
                }),
            ));
            Arc::new(publisher)
        } else {
            info!("event bus disabled by configuration");
            Arc::new(NoopEventPublisher)
        };

        let (idempotency, memory_store) =
            idempotency::build_store(&config.idempotency_backend, config.redis_url.as_deref())
                .await;
        if let Some(memory) = memory_store {
            let sweeper = idempotency::spawn_sweeper(memory, SWEEP_INTERVAL);
            hooks.push((
                "idempotency-sweeper",
                Box::new(move || {
                    Box::pin(async move {
                        sweeper.abort();
                        Ok(())
                    })
                }),
            ));
        }

        Ok(Arc::new(Self {
            config,
            repository,
            events,
            idempotency,
            resilience,
            rate_limiter,
            shutdown_hooks: Mutex::new(hooks),
        }))
    }

    pub fn state(self: &Arc<Self>) -> AppState {
        AppState {
            cart_service: Arc::new(CartService::new(
                self.repository.clone(),
                self.events.clone(),
                self.resilience.clone(),
            )),
            application: self.clone(),
        }
    }

    pub fn idempotency_layer(&self) -> IdempotencyLayerState {
        IdempotencyLayerState {
            store: self.idempotency.clone(),
            ttl: self.config.idempotency_ttl(),
            enabled: self.config.idempotency_enabled,
            required: self.config.idempotency_required,
        }
    }

    /// Enqueues a teardown hook. Hooks run LIFO at shutdown.
    pub fn register_shutdown(
        &self,
        name: &'static str,
        hook: impl FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send + 'static,
    ) {
        self.shutdown_hooks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((name, Box::new(hook)));
    }

    /// Runs every hook in reverse registration order under one deadline.
    /// The first error is kept; later hooks still run.
    pub async fn shutdown(&self, timeout: Duration) -> anyhow::Result<()> {
        let hooks: Vec<_> = {
            let mut guard = self
                .shutdown_hooks
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            guard.drain(..).collect()
        };

        let deadline = tokio::time::Instant::now() + timeout;
        let mut first_error: Option<anyhow::Error> = None;

        for (name, hook) in hooks.into_iter().rev() {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, hook()).await {
                Ok(Ok(())) => info!(hook = name, "shutdown hook completed"),
                Ok(Err(err)) => {
                    error!(hook = name, error = %err, "shutdown hook failed");
                    first_error.get_or_insert(err);
                }
                Err(_) => {
                    warn!(hook = name, "shutdown hook timed out");
                    first_error.get_or_insert_with(|| anyhow!("shutdown hook {name} timed out"));
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Ready iff the critical dependencies answer; the repository is the
    /// minimum.
    pub async fn readiness_check(&self) -> Result<(), ApiError> {
        let repository = self.repository.clone();
        self.resilience
            .execute(STORE_RESOURCE, OperationClass::Read, move || {
                let repository = repository.clone();
                async move { repository.health_check().await }
            })
            .await
            .map_err(|err| {
                warn!(error = %err, "readiness probe failed");
                ApiError::ServiceUnavailable {
                    resource: "repository".to_string(),
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_config() -> AppConfig {
        crate::config::load_config().expect("default config")
    }

    #[tokio::test]
    async fn build_wires_a_ready_application() {
        let app = Application::build(test_config()).await.expect("build");
        app.readiness_check().await.expect("ready");
        app.shutdown(Duration::from_secs(1)).await.expect("shutdown");
    }

    #[tokio::test]
    async fn shutdown_runs_hooks_in_lifo_order() {
        let app = Application::build(test_config()).await.expect("build");
        let order = Arc::new(Mutex::new(Vec::new()));

        for name in ["first", "second", "third"] {
            let order = order.clone();
            app.register_shutdown(name, move || {
                Box::pin(async move {
                    order.lock().expect("order lock").push(name);
                    Ok(())
                })
            });
        }

        app.shutdown(Duration::from_secs(1)).await.expect("shutdown");
        let recorded = order.lock().expect("order lock").clone();
        assert_eq!(&recorded[..3], &["third", "second", "first"]);
    }

    #[tokio::test]
    async fn shutdown_keeps_first_error_but_runs_all_hooks() {
        let app = Application::build(test_config()).await.expect("build");
        let ran = Arc::new(AtomicUsize::new(0));

        {
            let ran = ran.clone();
            app.register_shutdown("ok-early", move || {
                Box::pin(async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            });
        }
        app.register_shutdown("fails", || {
            Box::pin(async move { Err(anyhow!("flush failed")) })
        });
        {
            let ran = ran.clone();
            app.register_shutdown("ok-late", move || {
                Box::pin(async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            });
        }

        let err = app.shutdown(Duration::from_secs(1)).await.unwrap_err();
        assert!(err.to_string().contains("flush failed"));
        assert_eq!(ran.load(Ordering::SeqCst), 2, "later hooks still ran");
    }
}
