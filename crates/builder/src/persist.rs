use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::CheckpointError;

pub(crate) const TMP_EXTENSION: &str = "tmp";

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(TMP_EXTENSION);
    path.with_file_name(name)
}

/// Writes JSON to a sibling temp file, syncs it, then renames over `path`.
///
/// A crash mid-write leaves the previous file intact.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), CheckpointError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| CheckpointError::io(parent, e))?;
    }

    let temp = temp_path(path);
    let written = (|| -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(&temp)?);
        serde_json::to_writer(&mut writer, value)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        fs::rename(&temp, path)
    })();

    written.map_err(|e| {
        let _ = fs::remove_file(&temp);
        CheckpointError::io(path, e)
    })
}

pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, CheckpointError> {
    let file = File::open(path).map_err(|e| CheckpointError::io(path, e))?;
    serde_json::from_reader(BufReader::new(file)).map_err(|e| CheckpointError::Corrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_atomic_write_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("value.json");

        write_json_atomic(&path, &vec![1, 2, 3]).unwrap();
        write_json_atomic(&path, &vec![4]).unwrap();

        let value: Vec<i32> = read_json(&path).unwrap();
        assert_eq!(value, vec![4]);
        let names: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec!["value.json"]);
    }

    #[test]
    fn test_garbage_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, "{not json").unwrap();

        let result: Result<Vec<i32>, _> = read_json(&path);
        assert!(matches!(result, Err(CheckpointError::Corrupt { .. })));
    }
}
