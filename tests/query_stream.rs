mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use common::{Harness, ScriptedChat};
use vault_qa::config::ProvidersConfig;
use vault_qa::llm::ProviderFactory;
use vault_qa::query::{QueryEvent, QueryRequest, QueryService, NO_RELEVANT_NOTES};
use vault_qa::router::{Complexity, Tier};

const SIMPLE: (&str, &str) = ("openai", "gpt-4o-mini");
const COMPLEX: (&str, &str) = ("anthropic", "claude-3-5-sonnet-20241022");

fn service(h: &Harness, chats: Vec<Arc<ScriptedChat>>) -> QueryService {
    let factory = ProviderFactory::new(ProvidersConfig::default());
    for chat in chats {
        factory.insert(chat);
    }
    QueryService::new(&h.config, h.embedder.clone(), h.index.clone(), Arc::new(factory))
}

fn simple_chat(deltas: &[&str]) -> Arc<ScriptedChat> {
    Arc::new(ScriptedChat::new(SIMPLE.0, SIMPLE.1, deltas))
}

async fn collect(mut rx: mpsc::Receiver<QueryEvent>) -> Vec<QueryEvent> {
    let mut events = Vec::new();
    while let Some(event) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("query stream stalled")
    {
        events.push(event);
    }
    events
}

async fn indexed() -> Harness {
    let h = Harness::new().await;
    h.seed_three_notes();
    h.sync().await;
    h
}

#[tokio::test]
async fn stream_emits_sources_content_metadata_done() {
    let h = indexed().await;
    let chat = simple_chat(&["Tomatoes ", "need ", "full sun."]);
    let qs = service(&h, vec![chat.clone()]);

    let events = collect(qs.stream(QueryRequest::new("When do tomatoes need watering?"))).await;
    assert_eq!(events.len(), 6, "{:?}", events);

    let QueryEvent::Sources { sources } = &events[0] else {
        panic!("expected sources first, got {:?}", events[0]);
    };
    assert!(!sources.is_empty());
    assert!(sources.len() <= 3);
    assert!(sources
        .windows(2)
        .all(|w| w[0].similarity_score >= w[1].similarity_score));
    let garden = sources
        .iter()
        .find(|s| s.note_path == "garden.md")
        .expect("garden note cited");
    assert_eq!(garden.obsidian_url, "obsidian://open?vault=Test%20Vault&file=garden");

    let text: String = events[1..4]
        .iter()
        .map(|e| match e {
            QueryEvent::Content { content } => content.as_str(),
            other => panic!("expected content, got {:?}", other),
        })
        .collect();
    assert_eq!(text, "Tomatoes need full sun.");

    let QueryEvent::Metadata(meta) = &events[4] else {
        panic!("expected metadata, got {:?}", events[4]);
    };
    assert_eq!(meta.complexity_used, Tier::Simple);
    assert_eq!(meta.model_used, SIMPLE.1);
    assert_eq!(meta.provider_used, SIMPLE.0);
    assert_eq!(meta.input_tokens, 100);
    assert_eq!(meta.output_tokens, 3);
    assert!(meta.embedding_tokens > 0);
    assert!(meta.total_cost > 0.0);

    assert!(matches!(events[5], QueryEvent::Done));
    assert!(chat.last_prompt().contains("When do tomatoes need watering?"));
    assert!(chat.last_prompt().contains("Tomatoes need full sun"));
}

#[tokio::test]
async fn empty_index_still_answers_with_no_sources() {
    let h = Harness::new().await;
    let chat = simple_chat(&["I could not find anything."]);
    let qs = service(&h, vec![chat.clone()]);

    let events = collect(qs.stream(QueryRequest::new("Where did I park?"))).await;
    assert!(matches!(&events[0], QueryEvent::Sources { sources } if sources.is_empty()));
    assert!(matches!(events.last(), Some(QueryEvent::Done)));
    assert!(chat.last_prompt().contains(NO_RELEVANT_NOTES));
}

#[tokio::test]
async fn folder_scope_limits_sources() {
    let h = indexed().await;
    let qs = service(&h, vec![simple_chat(&["ok"])]);

    let mut request = QueryRequest::new("Where is the castle tram?");
    request.folders = vec!["Travel".to_string()];
    let events = collect(qs.stream(request)).await;
    let QueryEvent::Sources { sources } = &events[0] else {
        panic!("expected sources first");
    };
    assert!(!sources.is_empty());
    assert!(sources.iter().all(|s| s.folder == "Travel"));
    assert_eq!(sources[0].title, "Lisbon Trip");

    let hits = qs
        .search("billing migration", &["Work".to_string()], 10)
        .await
        .unwrap();
    assert!(!hits.is_empty());
    assert!(hits.iter().all(|c| c.folder.starts_with("Work")));

    let none = qs
        .search("anything", &["Nowhere".to_string()], 10)
        .await
        .unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn invalid_question_yields_single_error() {
    let h = indexed().await;
    let chat = simple_chat(&["never"]);
    let qs = service(&h, vec![chat.clone()]);

    let events = collect(qs.stream(QueryRequest::new("   "))).await;
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], QueryEvent::Error { error } if error.contains("empty")));

    let mut request = QueryRequest::new("ok?");
    request.top_k = Some(50);
    let events = collect(qs.stream(request)).await;
    assert!(matches!(&events[..], [QueryEvent::Error { .. }]));
    assert!(chat.requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn embedding_failure_reported_before_sources() {
    let h = indexed().await;
    h.embedder.fail_on("BROKEN");
    let qs = service(&h, vec![simple_chat(&["never"])]);

    let events = collect(qs.stream(QueryRequest::new("BROKEN question"))).await;
    assert_eq!(events.len(), 1);
    let QueryEvent::Error { error } = &events[0] else {
        panic!("expected error, got {:?}", events[0]);
    };
    assert!(error.starts_with("provider error"), "{}", error);
}

#[tokio::test]
async fn mid_stream_failure_ends_with_error() {
    let h = indexed().await;
    let chat = Arc::new(
        ScriptedChat::new(SIMPLE.0, SIMPLE.1, &["Partial ", "answer", "!"]).failing_at(1),
    );
    let qs = service(&h, vec![chat]);

    let events = collect(qs.stream(QueryRequest::new("What grows in the garden?"))).await;
    assert_eq!(events.len(), 3, "{:?}", events);
    assert!(matches!(events[0], QueryEvent::Sources { .. }));
    assert!(matches!(&events[1], QueryEvent::Content { content } if content == "Partial "));
    let QueryEvent::Error { error } = &events[2] else {
        panic!("expected error, got {:?}", events[2]);
    };
    assert!(error.contains("provider unavailable"), "{}", error);
    assert!(events.iter().all(|e| !matches!(e, QueryEvent::Done)));
}

#[tokio::test]
async fn analytical_question_routes_to_complex_tier() {
    let h = indexed().await;
    let simple = simple_chat(&["simple"]);
    let complex = Arc::new(ScriptedChat::new(COMPLEX.0, COMPLEX.1, &["deep"]));
    let qs = service(&h, vec![simple.clone(), complex.clone()]);

    let events = collect(qs.stream(QueryRequest::new(
        "Compare my roadmap priorities with my travel plans",
    )))
    .await;
    let meta = events
        .iter()
        .find_map(|e| match e {
            QueryEvent::Metadata(m) => Some(m.clone()),
            _ => None,
        })
        .expect("metadata event");
    assert_eq!(meta.complexity_used, Tier::Complex);
    assert_eq!(meta.model_used, COMPLEX.1);
    assert!(simple.requests.lock().unwrap().is_empty());
    assert_eq!(complex.requests.lock().unwrap().len(), 1);

    // an explicit override wins over the analysis
    let mut request = QueryRequest::new("Compare my roadmap priorities with my travel plans");
    request.complexity = Complexity::Simple;
    let response = qs.answer(request).await.unwrap();
    assert_eq!(response.metadata.complexity_used, Tier::Simple);
    assert_eq!(response.answer, "simple");
}

#[tokio::test]
async fn dropping_receiver_stops_generation() {
    let h = indexed().await;
    let deltas: Vec<String> = (0..1_000).map(|i| format!("tok{} ", i)).collect();
    let refs: Vec<&str> = deltas.iter().map(String::as_str).collect();
    let chat = simple_chat(&refs);
    let qs = service(&h, vec![chat.clone()]);

    let mut rx = qs.stream(QueryRequest::new("Tell me about the garden"));
    let first = rx.recv().await.expect("sources event");
    assert!(matches!(first, QueryEvent::Sources { .. }));
    drop(rx);

    tokio::time::timeout(Duration::from_secs(5), async {
        while !chat.finished.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("model stream kept running after the receiver was dropped");
    assert!(chat.sent.load(Ordering::SeqCst) < deltas.len());
}

#[tokio::test]
async fn answer_returns_full_response() {
    let h = indexed().await;
    let qs = service(&h, vec![simple_chat(&["Tram ", "28."])]);

    let mut request = QueryRequest::new("Which tram goes to the castle?");
    request.top_k = Some(1);
    let response = qs.answer(request).await.unwrap();
    assert_eq!(response.answer, "Tram 28.");
    assert_eq!(response.sources.len(), 1);
    assert_eq!(response.metadata.input_tokens, 100);

    let json = serde_json::to_value(&response).unwrap();
    assert_eq!(json["answer"], "Tram 28.");
    assert_eq!(json["complexity_used"], "simple");
    assert!(json["sources"][0]["relevant_excerpt"].is_string());
}
