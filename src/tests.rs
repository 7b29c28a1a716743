//! Cross-component scenario tests over the mock providers.

use crate::ai_client::MockChatProvider;
use crate::config::AppConfig;
use crate::extraction::ExtractionWorker;
use crate::generator::{GenerateJob, StickerGenerator};
use crate::job_queue::ContextJobQueue;
use crate::pdf::{FixturePdf, InMemoryFiles};
use crate::quota::{Bucket, QuotaService};
use crate::retrieval::{ContextRetriever, RetrievalRequest};
use crate::scheduler::{ProgressCallback, SessionRun, WindowScheduler};
use crate::session_store::SessionStore;
use crate::sticker_cache::{project_stickers, ProbeResult, StickerCache};
use crate::store::MemoryStore;
use crate::types::*;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

const PAGE_TEXT: &str = "The derivative of a function measures the instantaneous \
rate of change of its output with respect to its input variable.";

struct Harness {
    store: Arc<MemoryStore>,
    quota: Arc<QuotaService>,
    cache: Arc<StickerCache>,
    generator: Arc<StickerGenerator>,
    sessions: Arc<SessionStore>,
    scheduler: Arc<WindowScheduler>,
}

fn test_config() -> AppConfig {
    AppConfig {
        poll_interval: Duration::from_millis(10),
        worker_poll: Duration::from_millis(10),
        ..AppConfig::default()
    }
}

fn file(pages: u32) -> FileRecord {
    FileRecord {
        id: "file-1".to_string(),
        course_id: "course-1".to_string(),
        owner_user_id: "user-1".to_string(),
        storage_key: "objects/file-1.pdf".to_string(),
        page_count: pages,
        is_scanned: false,
        content_hash: Some("hash-a".to_string()),
    }
}

fn harness(
    provider: MockChatProvider,
    pages: Vec<&str>,
    config: AppConfig,
    progress: Option<ProgressCallback>,
) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let quota = Arc::new(QuotaService::new(&config));
    let cache = Arc::new(StickerCache::new(store.clone(), quota.clone()));
    let files = InMemoryFiles::new();
    files.put("objects/file-1.pdf", vec![0u8; 32]);
    let fetcher = Arc::new(files);
    let provider: Arc<MockChatProvider> = Arc::new(provider);
    let page_count = pages.len() as u32;
    let text_source = Arc::new(FixturePdf::new(pages));
    store.upsert_file(file(page_count));

    let generator = Arc::new(StickerGenerator::new(
        store.clone(),
        cache.clone(),
        quota.clone(),
        None,
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
        fetcher,
        config,
        progress,
    ));
    Harness {
        store,
        quota,
        cache,
        generator,
        sessions,
        scheduler,
    }
}

fn fingerprint(page: u32) -> Fingerprint {
    Fingerprint {
        pdf_hash: "hash-a".to_string(),
        page,
        locale: Locale::En,
        mode: EffectiveMode::TextOnly,
        selection_hash: None,
    }
}

fn generate_job(harness: &Harness, generation_id: &str, user_id: &str, page: u32) -> GenerateJob {
    GenerateJob {
        generation_id: generation_id.to_string(),
        user_id: user_id.to_string(),
        course_id: "course-1".to_string(),
        file: file(harness.store.file("file-1").map(|f| f.page_count).unwrap_or(1)),
        page,
        pdf_kind: PdfKind::Text,
        locale: Locale::En,
        mode: EffectiveMode::TextOnly,
        images: vec![],
        question: None,
        file_bytes: None,
    }
}

// Scenario: first-time page generates once, later users hit the cache and
// receive projected copies.
#[tokio::test]
async fn first_request_generates_then_cache_serves() {
    let payload = r#"[{"anchorText": "rate of change", "explanation": "How fast it moves."}]"#;
    let harness = harness(
        MockChatProvider::new(vec![payload]),
        vec![PAGE_TEXT; 6],
        test_config(),
        None,
    );
    let fp = fingerprint(5);

    // User A misses, claims, generates
    assert!(matches!(harness.cache.probe(&fp, "user-a"), ProbeResult::NotFound));
    harness.quota.deduct("user-a", Bucket::AutoExplain, 1).unwrap();
    let claim = harness.cache.try_start(&fp, "user-a", 1, &[]);
    assert!(claim.started);
    harness
        .generator
        .run(generate_job(&harness, &claim.generation_id, "user-a", 5))
        .await
        .expect("generation succeeds");

    // User B hits ready and adopts a projected copy
    let generation = match harness.cache.probe(&fp, "user-b") {
        ProbeResult::Ready { generation } => generation,
        other => panic!("expected ready, got {:?}", other),
    };
    harness.quota.deduct("user-b", Bucket::AutoExplain, 1).unwrap();
    let copies = project_stickers(&generation, "user-b", "course-9", "file-9");
    harness.store.insert_stickers(&copies);

    assert_eq!(harness.store.stickers_for_page("user-a", "file-1", 5).len(), 1);
    let adopted = harness.store.stickers_for_page("user-b", "file-9", 5);
    assert_eq!(adopted.len(), 1);
    assert_ne!(adopted[0].id, generation.stickers[0].id);
    assert_eq!(adopted[0].content_markdown, "How fast it moves.");
    // One unit per served user
    assert_eq!(harness.quota.check("user-a", Bucket::AutoExplain).used, 1);
    assert_eq!(harness.quota.check("user-b", Bucket::AutoExplain).used, 1);
}

// Scenario: two concurrent identical requests coalesce behind one record.
#[tokio::test]
async fn concurrent_requests_share_one_generation() {
    let payload = r#"[{"anchorText": "derivative", "explanation": "The slope."}]"#;
    let harness = harness(
        MockChatProvider::new(vec![payload]),
        vec![PAGE_TEXT; 6],
        test_config(),
        None,
    );
    let fp = fingerprint(3);

    let first = harness.cache.try_start(&fp, "user-a", 1, &[]);
    let second = harness.cache.try_start(&fp, "user-b", 1, &[]);
    assert_eq!(
        [first.started, second.started].iter().filter(|s| **s).count(),
        1
    );
    assert_eq!(first.generation_id, second.generation_id);

    // The winner generates; the loser polls the same id to ready
    harness
        .generator
        .run(generate_job(&harness, &first.generation_id, "user-a", 3))
        .await
        .expect("generation succeeds");
    let status = harness.cache.get_status(&second.generation_id).unwrap();
    assert_eq!(status.state, GenerationState::Ready);
    assert_eq!(status.stickers.len(), 1);
}

// Scenario: a full window session prefetches every page with progressive,
// monotone progress.
#[tokio::test]
async fn window_session_prefetches_whole_window() {
    let observed: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = observed.clone();
    let progress: ProgressCallback = Arc::new(move |event| {
        sink.lock().push(event.completed_in_window);
    });

    let harness = harness(
        MockChatProvider::new(Vec::<&str>::new()),
        vec![PAGE_TEXT; 12],
        test_config(),
        Some(progress),
    );
    let file = file(12);
    let session = harness
        .sessions
        .start("user-1", &file, 1, PdfKind::Text, Locale::En)
        .unwrap();
    assert_eq!((session.window_start, session.window_end), (1, 8));

    harness
        .scheduler
        .run_session(SessionRun {
            session_id: session.id.clone(),
            user_id: "user-1".to_string(),
            course_id: "course-1".to_string(),
            locale: Locale::En,
            file,
        })
        .await;

    let done = harness.sessions.get(&session.id).unwrap();
    assert_eq!(done.state, SessionState::Completed);
    for page in 1..=8 {
        assert!(
            !harness.store.stickers_for_page("user-1", "file-1", page).is_empty(),
            "page {} should have stickers",
            page
        );
    }
    assert_eq!(harness.quota.check("user-1", Bucket::AutoExplain).used, 8);

    // Progressive save: user-visible completion only ever grows
    let counts = observed.lock();
    assert!(!counts.is_empty());
    assert!(counts.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(*counts.last().unwrap(), 8);
}

// Scenario: cancellation stops pickups; already-generated stickers stay.
#[tokio::test]
async fn canceled_session_stops_new_pickups() {
    let harness = harness(
        MockChatProvider::new(Vec::<&str>::new()),
        vec![PAGE_TEXT; 12],
        test_config(),
        None,
    );
    let file = file(12);
    let session = harness
        .sessions
        .start("user-1", &file, 1, PdfKind::Text, Locale::En)
        .unwrap();
    harness.sessions.cancel(&session.id).unwrap();

    harness
        .scheduler
        .run_session(SessionRun {
            session_id: session.id.clone(),
            user_id: "user-1".to_string(),
            course_id: "course-1".to_string(),
            locale: Locale::En,
            file,
        })
        .await;

    let done = harness.sessions.get(&session.id).unwrap();
    assert_eq!(done.state, SessionState::Canceled);
    assert!(done.pages_completed.is_empty());
    assert_eq!(harness.quota.check("user-1", Bucket::AutoExplain).used, 0);
}

// Scenario: selected-image generation carries the multi-anchor layout that
// later cache hits replay.
#[tokio::test]
async fn selected_images_preserve_regions_for_cache_hits() {
    let payload = r#"[{"anchorText": "the selected figures", "explanation": "Those regions show the key diagram."}]"#;
    let harness = harness(
        MockChatProvider::new(vec![payload]),
        vec![PAGE_TEXT; 8],
        test_config(),
        None,
    );

    let regions = [
        SelectedRegion { page: 7, rect: Rect { x: 0.1, y: 0.1, w: 0.2, h: 0.2 } },
        SelectedRegion { page: 7, rect: Rect { x: 0.5, y: 0.1, w: 0.2, h: 0.2 } },
        SelectedRegion { page: 7, rect: Rect { x: 0.1, y: 0.5, w: 0.2, h: 0.2 } },
    ];
    let captures: Vec<crate::sticker_cache::ImageRegionCapture> = regions
        .iter()
        .map(|region| crate::sticker_cache::ImageRegionCapture {
            region: *region,
            jpeg_bytes: vec![0xFF, 0xD8],
        })
        .collect();

    let selection_hash = crate::fingerprint::canonical_selection_hash(
        7,
        EffectiveMode::WithSelectedImages,
        Locale::ZhHans,
        &regions,
    );
    // Region order never changes the fingerprint
    let mut reversed = regions;
    reversed.reverse();
    assert_eq!(
        selection_hash,
        crate::fingerprint::canonical_selection_hash(
            7,
            EffectiveMode::WithSelectedImages,
            Locale::ZhHans,
            &reversed,
        )
    );

    let fp = Fingerprint {
        pdf_hash: "hash-a".to_string(),
        page: 7,
        locale: Locale::ZhHans,
        mode: EffectiveMode::WithSelectedImages,
        selection_hash: Some(selection_hash),
    };
    let claim = harness.cache.try_start(&fp, "user-a", 1, &captures);
    let mut job = generate_job(&harness, &claim.generation_id, "user-a", 7);
    job.locale = Locale::ZhHans;
    job.mode = EffectiveMode::WithSelectedImages;
    job.images = captures;
    harness.generator.run(job).await.expect("generation succeeds");

    let record = match harness.cache.probe(&fp, "user-b") {
        ProbeResult::Ready { generation } => generation,
        other => panic!("expected ready, got {:?}", other),
    };
    assert_eq!(record.selected_regions.len(), 3);
    let anchors = record.stickers[0].anchor.anchors.as_ref().unwrap();
    assert_eq!(anchors.len(), 4);
    let image_ids: Vec<&str> = anchors
        .iter()
        .filter_map(|part| match part {
            AnchorPart::Image { id, .. } => Some(id.as_str()),
            AnchorPart::Text { .. } => None,
        })
        .collect();
    assert_eq!(
        image_ids,
        vec!["7-0.1-0.1-0.2-0.2", "7-0.5-0.1-0.2-0.2", "7-0.1-0.5-0.2-0.2"]
    );
}

// Scenario: extraction mines entries once per hash and retrieval feeds them
// back, deduped to the best-scored title.
#[tokio::test]
async fn context_pipeline_mines_once_and_retrieves() {
    let config = AppConfig {
        batch_target_words: 20,
        batch_min_words: 10,
        batch_max_words: 30,
        sample_pages: 2,
        ..test_config()
    };
    let batch_page = "limits derivatives integrals continuity sequences series \
convergence divergence functions mappings theorems proofs lemmas corollaries";
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(ContextJobQueue::new(store.clone(), &config));
    let files = InMemoryFiles::new();
    files.put("objects/file-1.pdf", vec![0u8; 8]);
    store.upsert_file(file(4));

    let extraction_payloads = vec![
        r#"[{"type": "definition", "title": "Derivative", "body": "Rate of change.", "sourcePage": 1, "keywords": ["derivative"], "qualityScore": 0.85}]"#,
        r#"[{"type": "definition", "title": "derivative", "body": "The better one.", "sourcePage": 3, "keywords": ["derivative"], "qualityScore": 0.92}]"#,
    ];
    let worker = ExtractionWorker::new(
        store.clone(),
        queue.clone(),
        Arc::new(MockChatProvider::new(extraction_payloads)),
        Arc::new(files),
        Arc::new(FixturePdf::new(vec![batch_page; 4])),
        config.clone(),
        "worker-a",
    );

    queue.enqueue("hash-a", "file-1", "user-1", 4).unwrap();
    assert!(worker.tick().await);
    // Second tick has nothing left to claim
    assert!(!worker.tick().await);

    let entries = store.entries_for_hashes(&["hash-a".to_string()]);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].quality_score, 0.92);
    assert_eq!(entries[0].body, "The better one.");

    // Retrieval over the scope the extraction materialized
    let retriever = ContextRetriever::new(
        store,
        Arc::new(MockChatProvider::new(vec![r#"{"keywords": ["derivative"]}"#])),
        &config,
    );
    let result = retriever
        .retrieve_for_page(&RetrievalRequest {
            user_id: "user-1".to_string(),
            course_id: "course-1".to_string(),
            current_pdf_hash: Some("hash-a".to_string()),
            page_text: Some("what is a derivative".to_string()),
            question: None,
        })
        .await;
    assert_eq!(result.entries.len(), 1);
    assert_eq!(result.entries[0].title, "derivative");
    assert!(result.total_tokens <= 2000);
}

// Scenario: quota exhaustion surfaces before any record is written.
#[tokio::test]
async fn exhausted_quota_blocks_before_claiming() {
    let config = AppConfig {
        auto_explain_limit: 1,
        ..test_config()
    };
    let harness = harness(
        MockChatProvider::new(Vec::<&str>::new()),
        vec![PAGE_TEXT; 6],
        config,
        None,
    );
    harness.quota.deduct("user-a", Bucket::AutoExplain, 1).unwrap();

    let snapshot = harness.quota.check("user-a", Bucket::AutoExplain);
    assert!(!snapshot.allowed());
    // The boundary stops here: no try_start, so no record for the fingerprint
    assert!(matches!(
        harness.cache.probe(&fingerprint(2), "user-a"),
        ProbeResult::NotFound
    ));
    assert!(harness
        .store
        .generation_for_key(&fingerprint(2).key())
        .is_none());
}
