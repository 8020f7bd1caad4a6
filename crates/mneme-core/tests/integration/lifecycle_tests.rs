use std::future::Future;
use std::io::Write;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use mneme_core::models::{QueryResponse, TeachEntry};
use mneme_core::{
    AlwaysRun, AppError, CircuitState, CrawlRequest, DataSink, HandlerOutcome, HandlerWrapper,
    IntelligenceLevel, KnowledgeClient, KnowledgeConfig, KnowledgeTransport, LearningSink,
    RequestContext, ServiceStats, TeachResponse, spawn_in_scope,
};

use crate::common::{CollectingSink, memory_client, test_config};

fn request(url: &str, sink: &CollectingSink) -> RequestContext {
    RequestContext::new(CrawlRequest::new(url)).with_data_sink(Arc::new(sink.clone()))
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), AppError>> + Send>>;

/// Handler that scrapes a fixed record and counts how often it ran.
fn counting_handler(runs: Arc<AtomicUsize>) -> impl Fn(RequestContext) -> HandlerFuture {
    move |ctx: RequestContext| -> HandlerFuture {
        let runs = Arc::clone(&runs);
        Box::pin(async move {
            runs.fetch_add(1, Ordering::SeqCst);
            ctx.push_data(serde_json::json!({"url": ctx.request.url, "title": "scraped"}))
                .await
        })
    }
}

#[tokio::test]
async fn second_crawl_skips_what_the_first_one_taught() {
    let (transport, client) = memory_client(test_config());
    let runs = Arc::new(AtomicUsize::new(0));
    let wrapper = HandlerWrapper::new(Arc::clone(&client), counting_handler(Arc::clone(&runs)));
    let urls = ["https://shop.test/1", "https://shop.test/2", "https://shop.test/3"];

    let first = CollectingSink::default();
    for url in urls {
        let outcome = wrapper.handle(request(url, &first)).await.unwrap();
        assert_eq!(outcome, HandlerOutcome::Executed);
    }
    assert_eq!(runs.load(Ordering::SeqCst), 3);
    assert_eq!(transport.len(), 3);
    assert_eq!(client.usage().learned, 3);

    let second = CollectingSink::default();
    for url in urls {
        let outcome = wrapper.handle(request(url, &second)).await.unwrap();
        assert_eq!(outcome, HandlerOutcome::Skipped);
    }
    assert_eq!(runs.load(Ordering::SeqCst), 3);
    assert_eq!(second.items(), first.items());
    assert_eq!(client.usage().recognized, 3);
}

#[tokio::test]
async fn concurrent_requests_are_batched_and_all_learned() {
    let (_transport, client) = memory_client(test_config());
    let runs = Arc::new(AtomicUsize::new(0));
    let wrapper = Arc::new(HandlerWrapper::new(Arc::clone(&client), counting_handler(Arc::clone(&runs))));
    let sink = CollectingSink::default();

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let wrapper = Arc::clone(&wrapper);
            let ctx = request(&format!("https://shop.test/{i}"), &sink);
            tokio::spawn(async move { wrapper.handle(ctx).await })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), HandlerOutcome::Executed);
    }

    assert_eq!(sink.items().len(), 8);
    let stats = client.stats().await.unwrap();
    assert_eq!(stats.queries, 8);
    assert_eq!(stats.learned, 8);
}

#[tokio::test]
async fn config_file_controls_policy() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{"alwaysRun": ["listing"], "batchMaxWaitMs": 2, "intelligenceLevel": "high"}}"#
    )
    .unwrap();
    let config = KnowledgeConfig::from_file(file.path()).unwrap();
    config.validate().unwrap();
    assert_eq!(config.always_run, AlwaysRun::Labels(vec!["listing".into()]));
    assert_eq!(config.intelligence_level, IntelligenceLevel::High);

    let (transport, client) = memory_client(config);
    transport.insert("https://shop.test/list", serde_json::json!({"items": 2}));
    transport.insert("https://shop.test/item", serde_json::json!({"price": 5}));

    let runs = Arc::new(AtomicUsize::new(0));
    let wrapper = HandlerWrapper::new(client, counting_handler(Arc::clone(&runs)));
    let sink = CollectingSink::default();

    let listing = RequestContext::new(CrawlRequest::new("https://shop.test/list").with_label("listing"))
        .with_data_sink(Arc::new(sink.clone()));
    let detail = RequestContext::new(CrawlRequest::new("https://shop.test/item").with_label("detail"))
        .with_data_sink(Arc::new(sink.clone()));

    assert_eq!(wrapper.handle(listing).await.unwrap(), HandlerOutcome::Executed);
    assert_eq!(wrapper.handle(detail).await.unwrap(), HandlerOutcome::Skipped);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn disabled_learning_never_teaches() {
    let (transport, client) = memory_client(KnowledgeConfig {
        learning_enabled: false,
        ..test_config()
    });
    let runs = Arc::new(AtomicUsize::new(0));
    let wrapper = HandlerWrapper::new(client, counting_handler(Arc::clone(&runs)));
    let sink = CollectingSink::default();

    wrapper.handle(request("https://a.test", &sink)).await.unwrap();
    wrapper.handle(request("https://a.test", &sink)).await.unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert!(transport.is_empty());
}

#[tokio::test]
async fn spawned_work_carries_the_request_scope() {
    let (transport, client) = memory_client(test_config());
    let dataset = CollectingSink::default();
    let global: Arc<dyn DataSink> = Arc::new(LearningSink::new(Arc::new(dataset.clone())));

    let wrapper = HandlerWrapper::new(client, {
        let global = Arc::clone(&global);
        move |_ctx: RequestContext| {
            let global = Arc::clone(&global);
            async move {
                let task =
                    spawn_in_scope(async move { global.push(serde_json::json!({"detail": 1})).await });
                match task.await {
                    Ok(pushed) => pushed,
                    Err(e) => Err(AppError::Generic(e.to_string())),
                }
            }
        }
    });

    wrapper
        .handle(RequestContext::new(CrawlRequest::new("https://deep.test")))
        .await
        .unwrap();

    assert_eq!(dataset.items().len(), 1);
    assert_eq!(transport.get("https://deep.test"), Some(serde_json::json!({"detail": 1})));
}

/// A service that is never reachable.
#[derive(Clone)]
struct UnreachableService {
    calls: Arc<AtomicUsize>,
}

impl KnowledgeTransport for UnreachableService {
    async fn query(
        &self,
        _urls: &[String],
        _intelligence: IntelligenceLevel,
    ) -> Result<QueryResponse, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(AppError::NetworkError("connection refused".into()))
    }

    async fn teach(&self, _entries: &[TeachEntry]) -> Result<TeachResponse, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(AppError::NetworkError("connection refused".into()))
    }

    async fn stats(&self) -> Result<ServiceStats, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(AppError::NetworkError("connection refused".into()))
    }
}

#[tokio::test]
async fn crawl_completes_with_service_down_and_stops_calling_it() {
    let calls = Arc::new(AtomicUsize::new(0));
    let service = UnreachableService {
        calls: Arc::clone(&calls),
    };
    let client = Arc::new(KnowledgeClient::new(service, test_config()));
    let runs = Arc::new(AtomicUsize::new(0));
    let wrapper = HandlerWrapper::new(Arc::clone(&client), counting_handler(Arc::clone(&runs)));
    let sink = CollectingSink::default();

    for i in 0..20 {
        let outcome = wrapper
            .handle(request(&format!("https://down.test/{i}"), &sink))
            .await
            .unwrap();
        assert_eq!(outcome, HandlerOutcome::Executed);
    }

    assert_eq!(runs.load(Ordering::SeqCst), 20);
    assert_eq!(sink.items().len(), 20);
    assert_eq!(client.circuit_stats().state, CircuitState::Open);
    // Default threshold is three failures; everything after is answered locally.
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn learning_dataset_passed_as_request_sink_teaches_once() {
    let (transport, client) = memory_client(test_config());
    let dataset = CollectingSink::default();
    let learning: Arc<dyn DataSink> = Arc::new(LearningSink::new(Arc::new(dataset.clone())));

    let wrapper = HandlerWrapper::new(Arc::clone(&client), |ctx: RequestContext| -> HandlerFuture {
        Box::pin(async move { ctx.push_data(serde_json::json!({"title": "once"})).await })
    });

    let ctx = RequestContext::new(CrawlRequest::new("https://shop.test/once")).with_data_sink(learning);
    assert_eq!(wrapper.handle(ctx).await.unwrap(), HandlerOutcome::Executed);

    assert_eq!(dataset.items(), vec![serde_json::json!({"title": "once"})]);
    assert_eq!(client.usage().learned, 1);
    assert_eq!(client.stats().await.unwrap().learned, 1);
    assert_eq!(transport.get("https://shop.test/once"), Some(serde_json::json!({"title": "once"})));
}
