//! Marginalia HTTP server binary

use marginalia::{
    AppConfig, AppState, ContextJobQueue, ContextRetriever, ExtractionWorker, FileRecord,
    FixturePdf, HttpChatClient, HttpFileFetcher, HttpTextExtractor, InMemoryFiles,
    MockChatProvider, QuotaService, SessionStore, StickerCache, StickerGenerator, MemoryStore,
    WindowScheduler,
};
use marginalia::ai_client::ChatProvider;
use marginalia::pdf::{FileFetcher, PageTextSource};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let config = AppConfig::from_env();
    let use_mock = std::env::args().any(|arg| arg == "--mock") || config.ai_api_key.is_none();

    println!("Marginalia sticker backend");
    println!("  version: {}", env!("CARGO_PKG_VERSION"));
    println!();

    let store = Arc::new(MemoryStore::new());
    let (provider, fetcher, text_source) = if use_mock {
        println!("  mode: MOCK (scripted provider, in-memory fixtures)");
        println!("  (set MARGINALIA_AI_API_KEY or OPENAI_API_KEY for real providers)");
        seed_demo_file(&store);
        let provider: Arc<dyn ChatProvider> =
            Arc::new(MockChatProvider::new(Vec::<&str>::new()));
        let fetcher: Arc<dyn FileFetcher> = Arc::new(demo_files());
        let text_source: Arc<dyn PageTextSource> = Arc::new(FixturePdf::uniform(
            42,
            "This demo page walks through the definition of the derivative \
and how difference quotients converge to it as the step size shrinks.",
        ));
        (provider, fetcher, text_source)
    } else {
        println!("  mode: REAL");
        println!("  ai endpoint: {}", config.ai_base_url);
        println!("  model: {}", config.ai_model);
        println!("  storage: {}", config.storage_base_url);
        println!("  extractor: {}", config.extractor_base_url);
        let provider: Arc<dyn ChatProvider> = Arc::new(HttpChatClient::new(
            config.ai_base_url.clone(),
            config.ai_api_key.clone(),
            config.ai_model.clone(),
        ));
        let fetcher: Arc<dyn FileFetcher> =
            Arc::new(HttpFileFetcher::new(config.storage_base_url.clone()));
        let text_source: Arc<dyn PageTextSource> =
            Arc::new(HttpTextExtractor::new(config.extractor_base_url.clone()));
        (provider, fetcher, text_source)
    };

    let quota = Arc::new(QuotaService::new(&config));
    let cache = Arc::new(StickerCache::new(store.clone(), quota.clone()));
    let retriever = Arc::new(ContextRetriever::new(
        store.clone(),
        provider.clone(),
        &config,
    ));
    let generator = Arc::new(StickerGenerator::new(
        store.clone(),
        cache.clone(),
        quota.clone(),
        Some(retriever),
        provider.clone(),
        fetcher.clone(),
        text_source.clone(),
        config.clone(),
    ));
    let sessions = Arc::new(SessionStore::new(store.clone(), &config));
    let scheduler = Arc::new(WindowScheduler::new(
        store.clone(),
        sessions.clone(),
        cache.clone(),
        quota.clone(),
        generator.clone(),
        fetcher.clone(),
        config.clone(),
        None,
    ));
    let jobs = Arc::new(ContextJobQueue::new(store.clone(), &config));

    // Background extraction worker
    let worker = ExtractionWorker::new(
        store.clone(),
        jobs.clone(),
        provider,
        fetcher,
        text_source,
        config.clone(),
        format!("worker-{}", std::process::id()),
    );
    tokio::spawn(async move {
        worker.run_loop().await;
    });

    println!("  components ready");
    println!("  starting HTTP server on port {}...", config.port);
    println!();

    let port = config.port;
    let state = AppState {
        store,
        quota,
        cache,
        generator,
        sessions,
        scheduler,
        jobs,
        config,
    };
    marginalia::run_server(state, port).await?;

    Ok(())
}

/// Demo file so mock mode answers requests out of the box.
fn seed_demo_file(store: &MemoryStore) {
    store.upsert_file(FileRecord {
        id: "demo-file".to_string(),
        course_id: "demo-course".to_string(),
        owner_user_id: "demo-user".to_string(),
        storage_key: "objects/demo.pdf".to_string(),
        page_count: 42,
        is_scanned: false,
        content_hash: Some("demo-content-hash".to_string()),
    });
}

fn demo_files() -> InMemoryFiles {
    let files = InMemoryFiles::new();
    files.put("objects/demo.pdf", vec![0u8; 64]);
    files
}
