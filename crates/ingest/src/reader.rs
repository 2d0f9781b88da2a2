use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs;
use walkdir::WalkDir;

const SUPPORTED_EXTENSIONS: [&str; 3] = ["txt", "md", "json"];

pub struct FileReader;

impl FileReader {
    pub fn is_supported(path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| SUPPORTED_EXTENSIONS.contains(&ext))
    }

    pub async fn read_file(path: &Path) -> Result<String> {
        if !Self::is_supported(path) {
            let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            anyhow::bail!("Unsupported file format: {}", extension);
        }

        let bytes = fs::read(path)
            .await
            .with_context(|| format!("Failed to read file: {:?}", path))?;

        // Undecodable bytes are replaced rather than rejecting the whole file
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Every supported file below `dir`, in a stable order.
    pub fn list_directory(dir: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();

        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = entry.with_context(|| format!("Failed to walk directory: {:?}", dir))?;
            if entry.file_type().is_file() && Self::is_supported(entry.path()) {
                files.push(entry.into_path());
            }
        }

        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supported_extensions() {
        assert!(FileReader::is_supported(Path::new("notes.md")));
        assert!(FileReader::is_supported(Path::new("data/config.json")));
        assert!(!FileReader::is_supported(Path::new("image.png")));
        assert!(!FileReader::is_supported(Path::new("README")));
    }

    #[tokio::test]
    async fn test_rejects_unsupported_file() {
        let err = FileReader::read_file(Path::new("archive.zip")).await.unwrap_err();
        assert!(err.to_string().contains("Unsupported file format: zip"));
    }
}
