use clap::{Parser, Subcommand, ValueEnum};
use chrono::Utc;
use docrag_core::{
    build_chunks, discover_files, guess_content_type, register_upload, AnswerGenerator,
    CharacterNgramEmbedder, ChunkingConfig, ContentTypeParser, DocumentParser, DocumentStore,
    Embedder, ErrorReport, FileDocumentStore, HttpCrossEncoder, IndexingPipeline, IndexingQueue,
    LlmSettings, LocalVectorStore, OpenAiBackend, QdrantStore, RagChat, RequestContext,
    Reranker, RerankerSettings, RetrievalMode, RetrievalOrchestrator, RetrievalSettings,
    Transition, VectorIndex,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

const PREVIEW_CHARS: usize = 1000;
const PREVIEW_CHUNKS: usize = 3;

#[derive(Parser)]
#[command(name = "docrag", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Directory holding the document rows, uploads and local vectors
    #[arg(long, env = "DOCRAG_DATA_DIR", default_value = ".docrag")]
    data_dir: PathBuf,

    /// Owner recorded on uploaded documents
    #[arg(long, env = "DOCRAG_USER", default_value = "local")]
    user: String,

    /// Vector index backend
    #[arg(long, env = "DOCRAG_VECTOR_BACKEND", value_enum, default_value = "local")]
    vector_backend: VectorBackend,

    /// Qdrant base URL
    #[arg(long, env = "QDRANT_URL", default_value = "http://localhost:6333")]
    qdrant_url: String,

    /// Qdrant collection
    #[arg(long, env = "QDRANT_COLLECTION", default_value = "document_chunks")]
    qdrant_collection: String,

    /// Embedding model: `char-trigram`, or a fastembed model name when built
    /// with the `local-models` feature
    #[arg(long, env = "DOCRAG_EMBEDDING_MODEL", default_value = "char-trigram")]
    embedding_model: String,

    /// Retrieval strategy: vector, hybrid or rerank
    #[arg(long, env = "DOCRAG_RETRIEVAL_MODE", default_value = "hybrid")]
    retrieval_mode: String,

    /// Passages returned per query
    #[arg(long, env = "DOCRAG_TOP_K", default_value = "5")]
    top_k: usize,

    /// Hybrid candidates gathered before reranking
    #[arg(long, env = "DOCRAG_RERANK_CANDIDATES", default_value = "10")]
    rerank_candidates: usize,

    /// Chunk window size in characters
    #[arg(long, env = "DOCRAG_CHUNK_SIZE", default_value = "500")]
    chunk_size: usize,

    /// Characters shared by consecutive chunks
    #[arg(long, env = "DOCRAG_CHUNK_OVERLAP", default_value = "100")]
    chunk_overlap: usize,

    /// Cross-encoder service exposing `/v1/rerank`
    #[arg(long, env = "RERANKER_URL")]
    reranker_url: Option<String>,

    /// Cross-encoder model name
    #[arg(long, env = "RERANKER_MODEL")]
    reranker_model: Option<String>,

    /// Documents indexed at the same time
    #[arg(long, env = "DOCRAG_INDEX_CONCURRENCY", default_value = "2")]
    concurrency: usize,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum VectorBackend {
    Local,
    Qdrant,
}

#[derive(Subcommand)]
enum Command {
    /// Register a file and index it in the background.
    Upload {
        /// File to upload
        path: PathBuf,
        /// Override the content type guessed from the extension
        #[arg(long)]
        content_type: Option<String>,
    },
    /// Upload and index every supported file under a folder.
    Ingest {
        /// Folder searched recursively
        #[arg(long)]
        folder: PathBuf,
    },
    /// Put a finished document back to PENDING and index it again.
    Reindex {
        /// Document id
        id: Uuid,
    },
    /// Show one document row.
    Status {
        /// Document id
        id: Uuid,
    },
    /// List documents, newest first.
    List {
        /// Show every owner's documents
        #[arg(long, default_value_t = false)]
        all: bool,
    },
    /// Retrieve ranked passages for a query.
    Search {
        /// Search query
        #[arg(long)]
        query: String,
        /// Override the configured retrieval mode
        #[arg(long)]
        mode: Option<String>,
        /// Override the configured number of passages
        #[arg(long)]
        top_k: Option<usize>,
    },
    /// Answer a question from the indexed documents.
    Ask {
        /// Question
        question: String,
        /// Print the answer as it is generated
        #[arg(long, default_value_t = false)]
        stream: bool,
    },
    /// Preview the parsed text and first chunks of a file without indexing it.
    Inspect {
        /// File to parse
        path: PathBuf,
        #[arg(long)]
        content_type: Option<String>,
    },
}

/// Renders a core error as `error[CODE] message`.
fn report<E>(error: E) -> anyhow::Error
where
    for<'a> ErrorReport: From<&'a E>,
{
    let report = ErrorReport::from(&error);
    anyhow::anyhow!("error[{}] {}", report.code, report.message)
}

struct App {
    cli: Cli,
    documents: Arc<FileDocumentStore>,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
}

impl App {
    fn open(cli: Cli) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&cli.data_dir)?;
        let documents = FileDocumentStore::open(cli.data_dir.join("documents.json")).map_err(report)?;
        let embedder = build_embedder(&cli.embedding_model)?;
        let index: Arc<dyn VectorIndex> = match cli.vector_backend {
            VectorBackend::Local => Arc::new(
                LocalVectorStore::open_or_create(&cli.data_dir.join("vectors")).map_err(report)?,
            ),
            VectorBackend::Qdrant => Arc::new(QdrantStore::new(&cli.qdrant_url, &cli.qdrant_collection)),
        };

        Ok(Self {
            cli,
            documents: Arc::new(documents),
            embedder,
            index,
        })
    }

    fn uploads_dir(&self) -> PathBuf {
        self.cli.data_dir.join("uploads")
    }

    fn chunking(&self) -> ChunkingConfig {
        ChunkingConfig {
            size: self.cli.chunk_size,
            overlap: self.cli.chunk_overlap,
        }
    }

    fn queue(&self) -> anyhow::Result<IndexingQueue> {
        let pipeline = IndexingPipeline::new(
            self.documents.clone(),
            Arc::new(ContentTypeParser::default()),
            self.embedder.clone(),
            self.index.clone(),
            self.chunking(),
        )
        .map_err(report)?;
        let concurrency = self.cli.concurrency.max(1);
        Ok(IndexingQueue::start(Arc::new(pipeline), concurrency, concurrency * 4))
    }

    fn retriever(&self) -> anyhow::Result<RetrievalOrchestrator> {
        let mode: RetrievalMode = self.cli.retrieval_mode.parse().map_err(report)?;
        let settings = RetrievalSettings {
            mode,
            top_k: self.cli.top_k,
            rerank_candidates: Some(self.cli.rerank_candidates),
            ..RetrievalSettings::default()
        };

        let retriever =
            RetrievalOrchestrator::new(self.embedder.clone(), self.index.clone(), settings).map_err(report)?;
        Ok(match build_reranker(&self.cli)? {
            Some(reranker) => retriever.with_reranker(reranker),
            None => retriever,
        })
    }

    async fn print_status(&self, id: Uuid) -> anyhow::Result<()> {
        match self.documents.get(id).await.map_err(report)? {
            Some(document) => println!("{}", serde_json::to_string_pretty(&document)?),
            None => anyhow::bail!("document {id} not found"),
        }
        Ok(())
    }
}

fn build_embedder(name: &str) -> anyhow::Result<Arc<dyn Embedder>> {
    if name == "char-trigram" {
        return Ok(Arc::new(CharacterNgramEmbedder::default()));
    }
    local_embedder(name)
}

#[cfg(feature = "local-models")]
fn local_embedder(name: &str) -> anyhow::Result<Arc<dyn Embedder>> {
    let embedder = docrag_core::FastEmbedder::new(name)?;
    embedder.warm_up()?;
    Ok(Arc::new(embedder))
}

#[cfg(not(feature = "local-models"))]
fn local_embedder(name: &str) -> anyhow::Result<Arc<dyn Embedder>> {
    anyhow::bail!("embedding model `{name}` requires building with the `local-models` feature")
}

fn build_reranker(cli: &Cli) -> anyhow::Result<Option<Arc<dyn Reranker>>> {
    if cli.reranker_url.is_some() {
        let settings = RerankerSettings {
            base_url: cli.reranker_url.clone(),
            model: cli.reranker_model.clone(),
            ..RerankerSettings::default()
        };
        return Ok(Some(Arc::new(HttpCrossEncoder::new(&settings).map_err(report)?)));
    }
    local_reranker(cli.reranker_model.as_deref())
}

#[cfg(feature = "local-models")]
fn local_reranker(name: Option<&str>) -> anyhow::Result<Option<Arc<dyn Reranker>>> {
    let name = name.unwrap_or(docrag_core::local_models::DEFAULT_LOCAL_RERANK_MODEL);
    Ok(Some(Arc::new(docrag_core::FastEmbedReranker::new(name)?)))
}

#[cfg(not(feature = "local-models"))]
fn local_reranker(_name: Option<&str>) -> anyhow::Result<Option<Arc<dyn Reranker>>> {
    Ok(None)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        "docrag boot"
    );
    let app = App::open(cli)?;
    let ctx = RequestContext::new();

    match &app.cli.command {
        Command::Upload { path, content_type } => {
            let queue = app.queue()?;
            let document = register_upload(
                app.documents.as_ref(),
                &app.uploads_dir(),
                path,
                &app.cli.user,
                content_type.as_deref(),
            )
            .await
            .map_err(report)?;
            println!("{} {}", document.id, document.status);

            queue.submit(&ctx, document.id).await.map_err(report)?;
            queue.shutdown().await.map_err(report)?;
            app.print_status(document.id).await?;
        }
        Command::Ingest { folder } => {
            let files = discover_files(folder);
            if files.is_empty() {
                anyhow::bail!("no supported files found in {}", folder.display());
            }
            info!(folder = %folder.display(), files = files.len(), "ingesting folder");

            let queue = app.queue()?;
            for path in &files {
                let file_ctx = RequestContext::new();
                match register_upload(app.documents.as_ref(), &app.uploads_dir(), path, &app.cli.user, None).await {
                    Ok(document) => queue.submit(&file_ctx, document.id).await.map_err(report)?,
                    Err(error) => warn!(path = %path.display(), code = error.code(), error = %error, "skipped file"),
                }
            }

            let summary = queue.shutdown().await.map_err(report)?;
            println!(
                "{} indexed, {} failed, {} skipped, {} missing at {}",
                summary.indexed,
                summary.failed,
                summary.skipped,
                summary.missing,
                Utc::now().to_rfc3339()
            );
        }
        Command::Reindex { id } => {
            match app.documents.reset_for_reindex(*id).await.map_err(report)? {
                Transition::Applied(_) => {}
                Transition::Missing => anyhow::bail!("document {id} not found"),
                Transition::Rejected { current } => {
                    anyhow::bail!("document {id} is {current}; only DONE or FAILED documents can be reindexed")
                }
            }
            let queue = app.queue()?;
            queue.submit(&ctx, *id).await.map_err(report)?;
            queue.shutdown().await.map_err(report)?;
            app.print_status(*id).await?;
        }
        Command::Status { id } => app.print_status(*id).await?,
        Command::List { all } => {
            let owner = (!all).then_some(app.cli.user.as_str());
            for document in app.documents.list(owner).await.map_err(report)? {
                println!(
                    "{} {:<10} {} {} {}",
                    document.id,
                    document.status,
                    document.created_at.to_rfc3339(),
                    document.content_type,
                    document.filename
                );
            }
        }
        Command::Search { query, mode, top_k } => {
            let retriever = app.retriever()?;
            let mode = match mode {
                Some(raw) => raw.parse::<RetrievalMode>().map_err(report)?,
                None => retriever.settings().mode,
            };
            let top_k = top_k.unwrap_or(retriever.settings().top_k);

            let chunks = retriever
                .retrieve_with(&ctx, query, mode, top_k)
                .await
                .map_err(report)?;
            println!("{}", serde_json::to_string_pretty(&chunks)?);
        }
        Command::Ask { question, stream } => {
            let generator = AnswerGenerator::new(Arc::new(OpenAiBackend::default()), LlmSettings::from_env());
            let chat = RagChat::new(Arc::new(app.retriever()?), Arc::new(generator));

            if *stream {
                let mut answer = chat.stream_answer(&ctx, question).await.map_err(report)?;
                let mut stdout = tokio::io::stdout();
                loop {
                    tokio::select! {
                        fragment = answer.next_fragment() => match fragment {
                            Some(fragment) => {
                                stdout.write_all(fragment.as_bytes()).await?;
                                stdout.flush().await?;
                            }
                            None => break,
                        },
                        _ = tokio::signal::ctrl_c() => {
                            warn!("interrupted, closing answer stream");
                            break;
                        }
                    }
                }
                println!();
            } else {
                let answer = chat.answer(&ctx, question).await.map_err(report)?;
                println!("{}", serde_json::to_string_pretty(&answer)?);
            }
        }
        Command::Inspect { path, content_type } => {
            inspect(path, content_type.as_deref(), app.chunking()).await?;
        }
    }

    Ok(())
}

async fn inspect(path: &Path, content_type: Option<&str>, chunking: ChunkingConfig) -> anyhow::Result<()> {
    let content_type = content_type
        .map(str::to_string)
        .unwrap_or_else(|| guess_content_type(path).to_string());
    let owned_path = path.to_path_buf();
    let parse_type = content_type.clone();
    let text = tokio::task::spawn_blocking(move || ContentTypeParser::default().parse(&owned_path, &parse_type))
        .await?
        .map_err(report)?;

    let chunks = build_chunks(Uuid::nil(), &text, chunking).map_err(report)?;
    let preview = serde_json::json!({
        "filename": path.file_name().map(|name| name.to_string_lossy().into_owned()),
        "content_type": content_type,
        "text_length": text.chars().count(),
        "text_preview": text.chars().take(PREVIEW_CHARS).collect::<String>(),
        "chunk_size": chunking.size,
        "chunk_overlap": chunking.overlap,
        "total_chunks": chunks.len(),
        "chunks_preview": chunks.iter().take(PREVIEW_CHUNKS).map(|chunk| &chunk.text).collect::<Vec<_>>(),
    });
    println!("{}", serde_json::to_string_pretty(&preview)?);
    Ok(())
}
