pub mod local;
pub mod qdrant;

pub use local::LocalVectorStore;
pub use qdrant::QdrantStore;

use serde::Serialize;
use std::path::PathBuf;

use crate::StoreError;

/// Writes `value` as JSON to a sibling temp file on the blocking pool, then
/// renames it over `path`, so readers never observe a half-written file.
pub(crate) async fn write_json_atomic<T>(path: PathBuf, value: T) -> Result<(), StoreError>
where
    T: Serialize + Send + 'static,
{
    tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec(&value)?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, data)?;
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    })
    .await
    .map_err(|error| StoreError::Io(std::io::Error::other(error)))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_replace_the_file_and_leave_no_temp_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("rows.json");

        write_json_atomic(path.clone(), vec![1, 2]).await.unwrap();
        write_json_atomic(path.clone(), vec![3]).await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "[3]");
        assert!(!path.with_extension("json.tmp").exists());
    }
}
