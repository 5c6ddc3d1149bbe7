#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request};
use axum::response::Response;
use axum::Router;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::ServiceExt;

use cart_api::app::{AppState, Application};
use cart_api::config::load_config;
use cart_api::events::{EventEnvelope, EventError, EventPublisher};
use cart_api::kv::MemoryKvStore;
use cart_api::middleware::RequestContext;
use cart_api::repository::{CartRepository, KvCartRepository};
use cart_api::resilience::{
    BulkheadConfig, CircuitBreakerConfig, DeadlineConfig, ResiliencePipeline, RetryConfig,
};
use cart_api::services::CartService;

/// Full application wired from default configuration, driven through the
/// router with `oneshot`.
pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub application: Arc<Application>,
}

impl TestApp {
    pub async fn new() -> Self {
        let config = load_config().expect("default config");
        let application = Application::build(config).await.expect("build application");
        let state = application.state();
        let router = cart_api::handlers::router(state.clone());
        Self {
            router,
            state,
            application,
        }
    }

    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        headers: &[(&str, &str)],
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(path);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("request");

        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router response")
    }
}

pub async fn response_json(response: Response) -> Value {
    use http_body_util::BodyExt as _;
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("response body")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("json body")
}

pub async fn response_text(response: Response) -> String {
    use http_body_util::BodyExt as _;
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("response body")
        .to_bytes();
    String::from_utf8(bytes.to_vec()).expect("utf8 body")
}

/// Publisher that records every envelope for assertions.
#[derive(Debug, Default, Clone)]
pub struct CapturingPublisher {
    events: Arc<Mutex<Vec<EventEnvelope>>>,
}

impl CapturingPublisher {
    pub fn events(&self) -> Vec<EventEnvelope> {
        self.events.lock().expect("events lock").clone()
    }

    pub fn event_types(&self) -> Vec<String> {
        self.events().iter().map(|e| e.event_type.clone()).collect()
    }
}

#[async_trait]
impl EventPublisher for CapturingPublisher {
    async fn publish(&self, event: EventEnvelope) -> Result<(), EventError> {
        self.events.lock().expect("events lock").push(event);
        Ok(())
    }
}

/// Service harness over the in-memory store with fast retry timings.
pub struct ServiceHarness {
    pub service: CartService,
    pub repository: Arc<dyn CartRepository>,
    pub publisher: CapturingPublisher,
}

impl ServiceHarness {
    pub fn new() -> Self {
        let repository: Arc<dyn CartRepository> = Arc::new(KvCartRepository::new(
            Arc::new(MemoryKvStore::new()),
            "carts-test",
        ));
        let publisher = CapturingPublisher::default();
        let resilience = Arc::new(ResiliencePipeline::new(
            CircuitBreakerConfig::default(),
            BulkheadConfig::default(),
            RetryConfig {
                max_attempts: 2,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                ..RetryConfig::default()
            },
            DeadlineConfig::default(),
        ));
        let service = CartService::new(
            repository.clone(),
            Arc::new(publisher.clone()),
            resilience,
        );
        Self {
            service,
            repository,
            publisher,
        }
    }
}

pub fn test_context() -> RequestContext {
    RequestContext {
        request_id: "req-test".to_string(),
        trace_id: Some("Root=1-test".to_string()),
        correlation_id: None,
    }
}
