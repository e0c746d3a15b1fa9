use super::MergeError;
use crate::{
    arrays::{ArrayTool, Statistic},
    batch::batch_index_from_path,
    collector::BatchTree,
    status::STATUS_VARIABLE,
};
use itertools::Itertools;
use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};
use tracing::{error, info, warn};

/// batch trees are `<root>/batch_<i>/output/<file>`
pub const LEGACY_MAX_DEPTH: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Text,
    Status,
    Ordinary,
}

impl FileKind {
    pub fn of(file_name: &str) -> Self {
        if file_name.ends_with(".txt") {
            Self::Text
        } else if file_name.contains(STATUS_VARIABLE) {
            Self::Status
        } else {
            Self::Ordinary
        }
    }
}

fn concatenate_text(inputs: &[PathBuf], dst: &Path) -> io::Result<()> {
    let mut writer = BufWriter::new(File::create(dst)?);

    for input in inputs {
        let content = fs::read(input)?;
        writer.write_all(&content)?;
        if !content.is_empty() && !content.ends_with(b"\n") {
            writer.write_all(b"\n")?;
        }
    }

    writer.flush()
}

/// Combine every file below the batch tree matching `pattern`, grouped by file name
pub fn merge(
    tool: &dyn ArrayTool,
    tree: &BatchTree,
    pattern: &str,
    result_dir: &Path,
) -> Result<BTreeMap<String, Result<FileKind, String>>, MergeError> {
    let files = tree.find(pattern, LEGACY_MAX_DEPTH)?;
    if files.is_empty() {
        warn!(pattern = pattern, root = ?tree.root, "No files matched");
        return Ok(BTreeMap::new());
    }

    fs::create_dir_all(result_dir).map_err(|source| MergeError::Io {
        path: result_dir.to_path_buf(),
        source,
    })?;

    let groups = files
        .into_iter()
        .filter_map(|path| {
            let name = path.file_name()?.to_str()?.to_string();
            Some((name, path))
        })
        .into_group_map();

    let mut outcomes = BTreeMap::new();
    for (name, mut inputs) in groups {
        inputs.sort_by_key(|path| batch_index_from_path(path));
        let kind = FileKind::of(&name);
        let dst = result_dir.join(&name);
        info!(file = %name, inputs = inputs.len(), kind = ?kind, "Merging");

        let result = match kind {
            FileKind::Text => concatenate_text(&inputs, &dst).map_err(|error| error.to_string()),
            FileKind::Status => tool
                .ensemble(&inputs, Statistic::Maximum, &dst)
                .map_err(|error| error.to_string()),
            FileKind::Ordinary => tool
                .ensemble(&inputs, Statistic::Average, &dst)
                .map_err(|error| error.to_string()),
        };

        if let Err(ref reason) = result {
            error!(file = %name, reason = %reason, "Failed to merge");
        }
        outcomes.insert(name, result.map(|()| kind));
    }

    Ok(outcomes)
}
