/*!
Built-in group commands executed in-process by the local manager.

Paths arrive already validated by the HTTP layer; filenames are re-checked here so the
manager never writes outside the group root even when called directly.
*/

use std::fs;
use std::io;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};

use super::{Files, Params};
use crate::server::paths::safe_upload_name;

pub const ROOT_DIR_PARAM: &str = "group_base_path_root_dir";
pub const GROUP_PATH_PARAM: &str = "group_base_path";

/// Create the group root and write every uploaded file beneath it.
pub fn create_group(params: &Params, files: &Files) -> Result<String> {
    let root = params
        .get(ROOT_DIR_PARAM)
        .ok_or_else(|| anyhow!("missing parameter {ROOT_DIR_PARAM}"))?;
    let root = Path::new(root);
    fs::create_dir_all(root)
        .with_context(|| format!("failed to create group directory {}", root.display()))?;

    for (name, data) in files {
        let Some(rel) = safe_upload_name(name) else {
            bail!("file {name} is outside the group directory");
        };
        let target = root.join(&rel);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
        fs::write(&target, data)
            .with_context(|| format!("failed to write {}", target.display()))?;
    }
    Ok(format!(
        "group created at {} ({} files)",
        root.display(),
        files.len()
    ))
}

/// Remove the group directory tree. A group that is already gone counts as removed.
pub fn remove_group(params: &Params) -> Result<String> {
    let path = params
        .get(GROUP_PATH_PARAM)
        .ok_or_else(|| anyhow!("missing parameter {GROUP_PATH_PARAM}"))?;
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(format!("group removed at {path}")),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(format!("group {path} already absent")),
        Err(e) => Err(e).with_context(|| format!("failed to remove group {path}")),
    }
}
