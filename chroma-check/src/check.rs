use crate::client::{AddRecords, ChromaClient};
use crate::embed::EmbeddingFunction;
use crate::ChromaError;
use serde_json::{Map, Value};
use std::time::Instant;
use tracing::instrument;

const DOCUMENTS: [(&str, &str, &str); 2] = [
    ("doc1", "안녕하세요! 이것은 테스트 문서입니다.", "test1"),
    ("doc2", "ChromaDB는 벡터 데이터베이스입니다.", "test2"),
];
const QUERY: &str = "테스트";
const N_RESULTS: usize = 2;

/// Run the smoke test sequence against `client`.
///
/// Returns `true` when every step succeeded. Side effects of a failed run are left in place.
#[instrument(skip(client, embedder))]
pub async fn run_check(
    client: &ChromaClient,
    embedder: &dyn EmbeddingFunction,
    collection: &str,
) -> bool {
    let start = Instant::now();
    tracing::info!("Connecting to Chroma at {}", client.base_url());

    match steps(client, embedder, collection).await {
        Ok(()) => {
            tracing::info!("Chroma connectivity check passed in {:?}", start.elapsed());
            true
        }
        Err(err) => {
            tracing::error!("Chroma connectivity check failed: {err}");
            false
        }
    }
}

async fn steps(
    client: &ChromaClient,
    embedder: &dyn EmbeddingFunction,
    collection_name: &str,
) -> Result<(), ChromaError> {
    let heartbeat = client.heartbeat().await?;
    tracing::info!("Heartbeat: {heartbeat}");

    let version = client.version().await?;
    tracing::info!("Chroma version: {version}");

    let collections = client.list_collections().await?;
    tracing::info!("Existing collections: {}", collections.len());
    for collection in &collections {
        tracing::info!("  - {} ({})", collection.name, collection.id);
    }

    // Leftover from a previous run
    if let Err(err) = client.delete_collection(collection_name).await {
        tracing::debug!("No collection to clean up: {err}");
    }

    let mut metadata = Map::new();
    metadata.insert(
        "description".to_string(),
        Value::from("connectivity check collection"),
    );
    let collection = client
        .create_collection(collection_name, Some(metadata))
        .await?;
    tracing::info!("Created collection `{}` ({})", collection.name, collection.id);

    let documents: Vec<String> = DOCUMENTS.iter().map(|(_, doc, _)| doc.to_string()).collect();
    let embeddings = embedder.embed(&documents).await?;
    let records = AddRecords {
        ids: DOCUMENTS.iter().map(|(id, _, _)| id.to_string()).collect(),
        embeddings,
        documents,
        metadatas: DOCUMENTS
            .iter()
            .map(|(_, _, source)| document_metadata(source))
            .collect(),
    };
    client.add(&collection.id, &records).await?;
    tracing::info!("Added {} documents", records.ids.len());

    let query_embeddings = embedder.embed(&[QUERY.to_string()]).await?;
    let result = client
        .query(&collection.id, &query_embeddings, N_RESULTS)
        .await?;
    tracing::info!("Query `{QUERY}` results:");
    let ids = result.ids.first().cloned().unwrap_or_default();
    let documents = result
        .documents
        .and_then(|documents| documents.into_iter().next())
        .unwrap_or_default();
    for (i, id) in ids.iter().enumerate() {
        let document = documents.get(i).cloned().flatten().unwrap_or_default();
        tracing::info!("  {}. {id}: {document}", i + 1);
    }

    client.delete_collection(collection_name).await?;
    tracing::info!("Deleted collection `{collection_name}`");

    Ok(())
}

fn document_metadata(source: &str) -> Map<String, Value> {
    let mut metadata = Map::new();
    metadata.insert("source".to_string(), Value::from(source));
    metadata.insert("language".to_string(), Value::from("ko"));
    metadata
}
