pub mod chunk;
pub mod chunker;
pub mod preprocess;
pub mod reader;

pub use chunk::{Chunk, ChunkKind, ChunkMetadata, DocType, Segment};
pub use chunker::{Chunker, ChunkerConfig};
pub use preprocess::{DocumentMetadata, PreprocessConfig, PreprocessedDocument, Preprocessor};
pub use reader::FileReader;

use anyhow::{Context, Result};
use std::path::Path;
use tracing::info;

/// Chunking tag for text indexed without preprocessing
pub const PLAIN_CHUNKING: &str = "plain";

/// Split raw text into chunks without any enrichment.
pub fn chunk_plain(text: &str, source: &str, config: ChunkerConfig) -> Vec<Chunk> {
    let segments = Chunker::new(config)
        .chunk_text(text, None)
        .into_iter()
        .map(|piece| Segment::new(ChunkKind::Body, piece))
        .collect();

    chunk::number_segments(source, DocType::Text, PLAIN_CHUNKING, segments)
}

/// Main ingestion pipeline: read and preprocess a single file.
/// The file name becomes the chunks' source identifier.
pub async fn ingest_file(file_path: &Path, preprocessor: &Preprocessor) -> Result<PreprocessedDocument> {
    let filename = file_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .context("Path has no file name")?;

    ingest_file_as(file_path, &filename, preprocessor).await
}

/// Read and preprocess a file under an explicit source identifier
pub async fn ingest_file_as(
    file_path: &Path,
    source: &str,
    preprocessor: &Preprocessor,
) -> Result<PreprocessedDocument> {
    let content = FileReader::read_file(file_path).await?;

    let document = preprocessor.preprocess(&content, source);
    info!(
        filename = %source,
        chunks = document.chunks.len(),
        chunking = %document.metadata.chunking,
        "Ingested file"
    );

    Ok(document)
}

/// Ingest every supported file below a directory.
/// Sources are named by their path relative to `dir_path`, so equal file
/// names in different subdirectories stay distinct.
pub async fn ingest_directory(dir_path: &Path, preprocessor: &Preprocessor) -> Result<Vec<PreprocessedDocument>> {
    let files = FileReader::list_directory(dir_path)?;
    let mut documents = Vec::with_capacity(files.len());

    for path in files {
        let source = relative_source(dir_path, &path);
        documents.push(ingest_file_as(&path, &source, preprocessor).await?);
    }

    Ok(documents)
}

/// `/`-separated path of `path` below `root`
fn relative_source(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
