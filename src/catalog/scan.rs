//! Directory scanning
//!
//! Turns scan roots into primary/projector groups. Identity and aliases are
//! layered on top by the catalog.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::gguf;
use crate::types::model::ModelContainerMetadata;

const GGUF_EXTENSION: &str = "gguf";
const PROJECTOR_MARKER: &str = "mmproj";

static SHARD_NAME: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)^(.+)-(\d{5})-of-(\d{5})\.gguf$").ok());

/// One loadable model found on disk
#[derive(Debug, Clone)]
pub struct ScannedModel {
    /// File stem without the shard suffix
    pub name: String,
    pub primary: ModelContainerMetadata,
    pub mmproj: Option<ModelContainerMetadata>,
    /// Bytes on disk, every shard included
    pub size: u64,
}

#[derive(Debug, PartialEq, Eq)]
struct ShardName {
    base: String,
    index: u32,
    total: u32,
}

fn parse_shard(file_name: &str) -> Option<ShardName> {
    let caps = SHARD_NAME.as_ref()?.captures(file_name)?;
    Some(ShardName {
        base: caps.get(1)?.as_str().to_string(),
        index: caps.get(2)?.as_str().parse().ok()?,
        total: caps.get(3)?.as_str().parse().ok()?,
    })
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn is_projector(path: &Path) -> bool {
    file_name(path).to_ascii_lowercase().contains(PROJECTOR_MARKER)
}

fn file_size(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// Every `*.gguf` file under `roots`, canonicalised and deduplicated
pub fn collect_files(roots: &[PathBuf]) -> BTreeSet<PathBuf> {
    let mut files = BTreeSet::new();

    for root in roots {
        if !root.is_dir() {
            tracing::debug!("Model path {} is not a directory, skipping", root.display());
            continue;
        }

        let pattern = format!(
            "{}/**/*",
            glob::Pattern::escape(&root.to_string_lossy())
        );
        let entries = match glob::glob(&pattern) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("Invalid scan pattern for {}: {}", root.display(), e);
                continue;
            }
        };

        for entry in entries {
            let path = match entry {
                Ok(path) => path,
                Err(e) => {
                    tracing::warn!("Skipping unreadable path during scan: {}", e);
                    continue;
                }
            };
            let is_gguf = path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case(GGUF_EXTENSION));
            if !is_gguf || !path.is_file() {
                continue;
            }
            match std::fs::canonicalize(&path) {
                Ok(canonical) => {
                    files.insert(canonical);
                }
                Err(e) => tracing::debug!("Cannot resolve {}: {}", path.display(), e),
            }
        }
    }

    files
}

/// Group files into models: projectors pair with primaries in the same
/// directory and split shards collapse into their first shard.
pub fn group_models(files: &BTreeSet<PathBuf>) -> Vec<ScannedModel> {
    let mut by_dir: BTreeMap<&Path, Vec<&Path>> = BTreeMap::new();
    for file in files {
        let dir = file.parent().unwrap_or_else(|| Path::new(""));
        by_dir.entry(dir).or_default().push(file.as_path());
    }

    let mut models = Vec::new();
    for (dir, dir_files) in by_dir {
        let (projectors, primaries): (Vec<&Path>, Vec<&Path>) =
            dir_files.into_iter().partition(|p| is_projector(p));

        // First readable projector by file name
        let mmproj = projectors.iter().find_map(|p| gguf::read_file(p));
        if projectors.len() > 1 {
            tracing::debug!("{} projectors in {}, using the first", projectors.len(), dir.display());
        }

        let mut shard_groups: BTreeMap<(String, u32), Vec<(u32, &Path)>> = BTreeMap::new();
        for primary in primaries {
            match parse_shard(&file_name(primary)) {
                Some(shard) => shard_groups
                    .entry((shard.base, shard.total))
                    .or_default()
                    .push((shard.index, primary)),
                None => {
                    let Some(meta) = gguf::read_file(primary) else {
                        continue;
                    };
                    let name = primary
                        .file_stem()
                        .map(|s| s.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    models.push(ScannedModel {
                        name,
                        primary: meta,
                        mmproj: mmproj.clone(),
                        size: file_size(primary),
                    });
                }
            }
        }

        for ((base, total), shards) in shard_groups {
            let Some(&(_, first)) = shards.iter().find(|(index, _)| *index == 1) else {
                tracing::warn!("Split model {} in {} has no first shard, skipping", base, dir.display());
                continue;
            };
            if shards.len() != total as usize {
                tracing::warn!("Split model {} has {} of {} shards", base, shards.len(), total);
            }
            let Some(meta) = gguf::read_file(first) else {
                continue;
            };
            models.push(ScannedModel {
                name: base,
                primary: meta,
                mmproj: mmproj.clone(),
                size: shards.iter().map(|(_, p)| file_size(p)).sum(),
            });
        }
    }

    models
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_shard() {
        assert_eq!(
            parse_shard("Qwen3-235B-Q4_K_M-00001-of-00005.gguf"),
            Some(ShardName {
                base: "Qwen3-235B-Q4_K_M".into(),
                index: 1,
                total: 5
            })
        );
        assert_eq!(parse_shard("model-00002-OF-00002.GGUF").map(|s| s.index), Some(2));
        assert!(parse_shard("model-0001-of-0002.gguf").is_none());
        assert!(parse_shard("model.gguf").is_none());
    }

    #[test]
    fn test_projector_detection() {
        assert!(is_projector(Path::new("/m/mmproj-model-f16.gguf")));
        assert!(is_projector(Path::new("/m/Gemma3-MMPROJ.gguf")));
        assert!(!is_projector(Path::new("/m/gemma-3-4b.gguf")));
    }

    #[test]
    fn test_collect_skips_other_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.gguf"), b"x").unwrap();
        std::fs::write(dir.path().join("B.GGUF"), b"x").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("dir.gguf")).unwrap();

        let files = collect_files(&[dir.path().to_path_buf()]);
        let names: Vec<String> = files.iter().map(|p| file_name(p)).collect();
        assert_eq!(names, vec!["B.GGUF", "a.gguf"]);
    }
}
