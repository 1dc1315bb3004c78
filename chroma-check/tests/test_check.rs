use chroma_check::{run_check, ChromaClient, EmbeddingFunction, OllamaEmbeddings};
use serde_json::json;
use wiremock::matchers::{body_json, body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const COLLECTIONS: &str = "/api/v2/tenants/default_tenant/databases/default_database/collections";
const COLLECTION_ID: &str = "6f1f7b3c-55a8-4b4a-9a53-0e0d8d1a2a11";

async fn mount_ollama(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .and(body_partial_json(json!({"input": ["테스트"]})))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"embeddings": [[0.1, 0.2, 0.3]]})),
        )
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .and(body_partial_json(json!({
            "model": "mxbai-embed-large",
            "input": [
                "안녕하세요! 이것은 테스트 문서입니다.",
                "ChromaDB는 벡터 데이터베이스입니다."
            ]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "embeddings": [[0.1, 0.2, 0.3], [0.3, 0.2, 0.1]]
        })))
        .mount(server)
        .await;
}

async fn mount_chroma(server: &MockServer, delete_calls: u64) {
    Mock::given(method("GET"))
        .and(path("/api/v2/heartbeat"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"nanosecond heartbeat": 1729000000000000000u64})),
        )
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/v2/version"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!("1.0.0")))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path(COLLECTIONS))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(server)
        .await;

    Mock::given(method("DELETE"))
        .and(path(format!("{COLLECTIONS}/test_collection")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(delete_calls)
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path(COLLECTIONS))
        .and(body_partial_json(
            json!({"name": "test_collection", "get_or_create": false}),
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": COLLECTION_ID,
            "name": "test_collection",
            "metadata": {"description": "connectivity check collection"},
            "tenant": "default_tenant",
            "database": "default_database"
        })))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path(format!("{COLLECTIONS}/{COLLECTION_ID}/add")))
        .and(body_json(json!({
            "ids": ["doc1", "doc2"],
            "embeddings": [[0.1, 0.2, 0.3], [0.3, 0.2, 0.1]],
            "documents": [
                "안녕하세요! 이것은 테스트 문서입니다.",
                "ChromaDB는 벡터 데이터베이스입니다."
            ],
            "metadatas": [
                {"source": "test1", "language": "ko"},
                {"source": "test2", "language": "ko"}
            ]
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({})))
        .expect(1)
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path(format!("{COLLECTIONS}/{COLLECTION_ID}/query")))
        .and(body_partial_json(json!({"n_results": 2})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ids": [["doc1", "doc2"]],
            "documents": [[
                "안녕하세요! 이것은 테스트 문서입니다.",
                "ChromaDB는 벡터 데이터베이스입니다."
            ]],
            "distances": [[0.0, 0.2]],
            "metadatas": null,
            "embeddings": null
        })))
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_check_succeeds() {
    let chroma = MockServer::start().await;
    let ollama = MockServer::start().await;
    mount_chroma(&chroma, 2).await;
    mount_ollama(&ollama).await;

    let client = ChromaClient::new(chroma.uri(), "default_tenant", "default_database");
    let embedder = OllamaEmbeddings::new(ollama.uri(), "mxbai-embed-large");

    assert!(run_check(&client, &embedder, "test_collection").await);
}

#[tokio::test]
async fn test_check_ignores_failed_cleanup() {
    let chroma = MockServer::start().await;
    let ollama = MockServer::start().await;
    mount_ollama(&ollama).await;

    // Takes precedence over the DELETE mock mounted below for the first call only
    Mock::given(method("DELETE"))
        .and(path(format!("{COLLECTIONS}/test_collection")))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "error": "NotFoundError",
            "message": "Collection [test_collection] does not exist"
        })))
        .up_to_n_times(1)
        .expect(1)
        .mount(&chroma)
        .await;
    mount_chroma(&chroma, 1).await;

    let client = ChromaClient::new(chroma.uri(), "default_tenant", "default_database");
    let embedder = OllamaEmbeddings::new(ollama.uri(), "mxbai-embed-large");

    assert!(run_check(&client, &embedder, "test_collection").await);
}

#[tokio::test]
async fn test_check_fails_when_unreachable() {
    let chroma = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v2/heartbeat"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&chroma)
        .await;

    let client = ChromaClient::new(chroma.uri(), "default_tenant", "default_database");
    let embedder = OllamaEmbeddings::new("http://127.0.0.1:9", "mxbai-embed-large");

    assert!(!run_check(&client, &embedder, "test_collection").await);
}

#[tokio::test]
async fn test_heartbeat_status_error() {
    let chroma = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v2/heartbeat"))
        .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
        .mount(&chroma)
        .await;

    let client = ChromaClient::new(chroma.uri(), "default_tenant", "default_database");
    match client.heartbeat().await {
        Err(chroma_check::ChromaError::Status { status, body }) => {
            assert_eq!(status, 503);
            assert_eq!(body, "unavailable");
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn test_ollama_embeddings() {
    let ollama = MockServer::start().await;
    mount_ollama(&ollama).await;

    let embedder = OllamaEmbeddings::new(ollama.uri(), "mxbai-embed-large");
    let embeddings = embedder.embed(&["테스트".to_string()]).await.unwrap();
    assert_eq!(embeddings, vec![vec![0.1f32, 0.2, 0.3]]);
}

#[tokio::test]
async fn test_ollama_embeddings_count_mismatch() {
    let ollama = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"embeddings": []})))
        .mount(&ollama)
        .await;

    let embedder = OllamaEmbeddings::new(ollama.uri(), "mxbai-embed-large");
    let result = embedder.embed(&["a".to_string()]).await;
    assert!(matches!(
        result,
        Err(chroma_check::ChromaError::Embedding(_))
    ));
}
