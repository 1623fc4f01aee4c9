use std::path::{Path, PathBuf};

use stacked_errors::{bail_locationless, Result, StackableErr};
use tokio::fs;

/// Canonicalizes and checks the existence of a file path. Also adds on better
/// information to errors.
///
/// Note: this does not prevent TOCTOU bugs.
pub async fn acquire_file_path(file_path_str: impl AsRef<Path>) -> Result<PathBuf> {
    let file_path_str = file_path_str.as_ref();
    // the canonicalization deals with testing for existence and resolving any
    // symbolic links, no `fs::try_exists` needed
    let path = fs::canonicalize(file_path_str)
        .await
        .stack_err_with(|| format!("acquire_file_path(file_path_str: {file_path_str:?})"))?;
    if path.is_file() {
        Ok(path)
    } else {
        bail_locationless!("acquire_file_path(file_path_str: {file_path_str:?}) -> is not a file")
    }
}

/// Canonicalizes and checks the existence of a directory path. Also adds on
/// better information to errors.
///
/// Note: this does not prevent TOCTOU bugs.
pub async fn acquire_dir_path(dir_path_str: impl AsRef<Path>) -> Result<PathBuf> {
    let dir_path_str = dir_path_str.as_ref();
    let path = fs::canonicalize(dir_path_str)
        .await
        .stack_err_with(|| format!("acquire_dir_path(dir_path_str: {dir_path_str:?})"))?;
    if path.is_dir() {
        Ok(path)
    } else {
        bail_locationless!(
            "acquire_dir_path(dir_path_str: {dir_path_str:?}) -> is not a directory"
        )
    }
}
