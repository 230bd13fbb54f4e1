use async_trait::async_trait;
use docrag_core::{
    build_chunks, register_upload, CharacterNgramEmbedder, ChunkingConfig, ContentTypeParser,
    DocumentStatus, DocumentStore, Embedder, FileDocumentStore, IndexOutcome, IndexingPipeline,
    IndexingQueue, LocalVectorStore, QueueReport, RequestContext, RetrievalMode,
    RetrievalOrchestrator, RetrievalSettings, Reranker, SearchError, VectorIndex,
};
use std::collections::HashSet;
use std::error::Error;
use std::path::Path;
use std::sync::Arc;

const MANUAL: &str = "The hydraulic pump must be inspected every five hundred operating hours. \
Check the shaft seal for weeping oil and replace it when the housing shows residue. \
Filter cartridges are changed at every second inspection, and the old cartridge is kept for analysis. \
Pressure relief valves are tested against the rated setting printed on the nameplate. \
Any vibration above the documented limit requires the coupling alignment to be measured again. \
Warranty claims are filed within thirty days and must include the inspection log.";

struct Harness {
    _dir: tempfile::TempDir,
    uploads: std::path::PathBuf,
    documents: Arc<FileDocumentStore>,
    embedder: Arc<CharacterNgramEmbedder>,
    index: Arc<LocalVectorStore>,
    pipeline: Arc<IndexingPipeline>,
}

fn chunking() -> ChunkingConfig {
    ChunkingConfig {
        size: 120,
        overlap: 20,
    }
}

fn harness() -> Result<Harness, Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let documents = Arc::new(FileDocumentStore::open(dir.path().join("documents.json"))?);
    let embedder = Arc::new(CharacterNgramEmbedder::default());
    let index = Arc::new(LocalVectorStore::open_or_create(&dir.path().join("vectors"))?);
    let pipeline = Arc::new(IndexingPipeline::new(
        documents.clone(),
        Arc::new(ContentTypeParser::default()),
        embedder.clone(),
        index.clone(),
        chunking(),
    )?);

    Ok(Harness {
        uploads: dir.path().join("uploads"),
        _dir: dir,
        documents,
        embedder,
        index,
        pipeline,
    })
}

fn write_source(dir: &Path, name: &str, body: &[u8]) -> Result<std::path::PathBuf, Box<dyn Error>> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(name);
    std::fs::write(&path, body)?;
    Ok(path)
}

/// Scores a passage by how many query words it contains.
struct OverlapReranker;

#[async_trait]
impl Reranker for OverlapReranker {
    fn model_id(&self) -> &str {
        "word-overlap"
    }

    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f64>, SearchError> {
        let words: Vec<String> = query.split_whitespace().map(str::to_lowercase).collect();
        Ok(passages
            .iter()
            .map(|passage| {
                let passage = passage.to_lowercase();
                words.iter().filter(|word| passage.contains(word.as_str())).count() as f64
            })
            .collect())
    }
}

#[tokio::test]
async fn uploaded_text_document_is_indexed_and_tagged() -> Result<(), Box<dyn Error>> {
    let h = harness()?;
    let source = write_source(&h._dir.path().join("incoming"), "pump-manual.txt", MANUAL.as_bytes())?;
    let ctx = RequestContext::new();

    let document = register_upload(h.documents.as_ref(), &h.uploads, &source, "alice", None).await?;
    assert_eq!(document.status, DocumentStatus::Pending);
    assert_eq!(document.content_type, "text/plain");
    assert!(document.file_path.starts_with(&h.uploads));

    let expected = build_chunks(document.id, MANUAL, chunking())?.len();
    assert!(expected > 1);

    let outcome = h.pipeline.index(&ctx, document.id).await;
    assert_eq!(outcome, IndexOutcome::Indexed { chunks: expected });

    let stored = h.documents.get(document.id).await?.ok_or("row missing")?;
    assert_eq!(stored.status, DocumentStatus::Done);

    let records = h.index.records_for(document.id);
    assert_eq!(records.len(), expected);
    assert!(records.iter().all(|record| record.metadata.document_id == document.id));
    assert!(records.iter().all(|record| record.embedding.len() == h.embedder.dimensions()));
    Ok(())
}

#[tokio::test]
async fn windows_below_the_minimum_still_finish_done() -> Result<(), Box<dyn Error>> {
    let h = harness()?;
    let pipeline = IndexingPipeline::new(
        h.documents.clone(),
        Arc::new(ContentTypeParser::default()),
        h.embedder.clone(),
        h.index.clone(),
        ChunkingConfig { size: 10, overlap: 5 },
    )?;
    let text = "A B C D E F G H I J K L M N O P Q R S T.";
    assert_eq!(text.chars().count(), 40);
    let source = write_source(&h._dir.path().join("incoming"), "letters.txt", text.as_bytes())?;

    let document = register_upload(h.documents.as_ref(), &h.uploads, &source, "alice", None).await?;
    let outcome = pipeline.index(&RequestContext::new(), document.id).await;

    assert_eq!(outcome, IndexOutcome::Indexed { chunks: 0 });
    let stored = h.documents.get(document.id).await?.ok_or("row missing")?;
    assert_eq!(stored.status, DocumentStatus::Done);
    assert!(h.index.records_for(document.id).is_empty());
    Ok(())
}

#[tokio::test]
async fn unsupported_upload_ends_failed_without_vectors() -> Result<(), Box<dyn Error>> {
    let h = harness()?;
    let source = write_source(&h._dir.path().join("incoming"), "diagram.png", &[0x89, b'P', b'N', b'G'])?;

    let document = register_upload(h.documents.as_ref(), &h.uploads, &source, "alice", None).await?;
    let outcome = h.pipeline.index(&RequestContext::new(), document.id).await;

    assert!(matches!(
        outcome,
        IndexOutcome::Failed { code: "UNSUPPORTED_DOCUMENT_TYPE", .. }
    ));
    let stored = h.documents.get(document.id).await?.ok_or("row missing")?;
    assert_eq!(stored.status, DocumentStatus::Failed);
    assert!(h.index.records_for(document.id).is_empty());
    Ok(())
}

#[tokio::test]
async fn stored_chunks_are_their_own_nearest_neighbour() -> Result<(), Box<dyn Error>> {
    let h = harness()?;
    let source = write_source(&h._dir.path().join("incoming"), "pump-manual.md", MANUAL.as_bytes())?;
    let document = register_upload(h.documents.as_ref(), &h.uploads, &source, "alice", None).await?;
    h.pipeline.index(&RequestContext::new(), document.id).await;

    for record in h.index.records_for(document.id) {
        let query = h.embedder.embed_one(&record.text)?;
        let matches = h.index.search(&query, 1).await?;
        assert_eq!(matches.texts, vec![record.text.clone()]);
        assert!(matches.distances[0].abs() < 1e-5);
    }
    Ok(())
}

#[tokio::test]
async fn reranked_results_come_from_the_hybrid_recall() -> Result<(), Box<dyn Error>> {
    let h = harness()?;
    let source = write_source(&h._dir.path().join("incoming"), "pump-manual.txt", MANUAL.as_bytes())?;
    let document = register_upload(h.documents.as_ref(), &h.uploads, &source, "alice", None).await?;
    h.pipeline.index(&RequestContext::new(), document.id).await;

    let settings = RetrievalSettings {
        top_k: 2,
        rerank_candidates: Some(4),
        ..RetrievalSettings::default()
    };
    let retriever = RetrievalOrchestrator::new(h.embedder.clone(), h.index.clone(), settings)?
        .with_reranker(Arc::new(OverlapReranker));
    let ctx = RequestContext::new();
    let query = "replace the shaft seal";

    let recall: HashSet<String> = retriever
        .retrieve_with(&ctx, query, RetrievalMode::Hybrid, 4)
        .await?
        .into_iter()
        .map(|chunk| chunk.text)
        .collect();
    let reranked = retriever
        .retrieve_with(&ctx, query, RetrievalMode::Rerank, 2)
        .await?;

    assert_eq!(reranked.len(), 2);
    assert!(reranked.iter().all(|chunk| recall.contains(&chunk.text)));
    assert!(reranked.iter().all(|chunk| chunk.rerank_score.is_some()));
    assert!(reranked[0].rerank_score >= reranked[1].rerank_score);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn queue_drives_every_upload_to_a_terminal_status() -> Result<(), Box<dyn Error>> {
    let h = harness()?;
    let incoming = h._dir.path().join("incoming");
    let queue = IndexingQueue::start(h.pipeline.clone(), 2, 4);
    let ctx = RequestContext::new();

    let mut ids = Vec::new();
    for (name, body) in [
        ("a.txt", MANUAL.as_bytes()),
        ("b.md", MANUAL.as_bytes()),
        ("c.bin", b"\x00\x01\x02".as_slice()),
    ] {
        let source = write_source(&incoming, name, body)?;
        let document = register_upload(h.documents.as_ref(), &h.uploads, &source, "bob", None).await?;
        queue.submit(&ctx, document.id).await?;
        ids.push(document.id);
    }

    let report = queue.shutdown().await?;
    assert_eq!(
        report,
        QueueReport {
            indexed: 2,
            failed: 1,
            skipped: 0,
            missing: 0,
        }
    );

    let mut statuses = Vec::new();
    for id in ids {
        statuses.push(h.documents.get(id).await?.ok_or("row missing")?.status);
    }
    assert_eq!(
        statuses,
        vec![DocumentStatus::Done, DocumentStatus::Done, DocumentStatus::Failed]
    );
    Ok(())
}
