//! Repository scanning: block-hashing walks, ignore patterns, change
//! suppression, single-file rechecks and temp-file cleanup.
//!
//! A full walk produces the file list that `replace_local` swaps in; the
//! single-file recheck path promotes through `update_local` instead, because
//! only the full swap can detect deletions en masse. The two paths are kept
//! separate on purpose.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use filetime::FileTime;
use tokio::fs;
use tracing::{debug, warn};

use drift_blocks::{hash_blocks, BLOCK_SIZE};
use drift_proto::{FLAG_DELETED, FLAG_DIRECTORY, FLAG_INVALID, FLAG_MODE_MASK};

use crate::config::TraceCategory;
use crate::errors::Result;
use crate::file::File;
use crate::model::{Model, State};

/// Prefix of in-progress pull files. Scans skip them; startup removes
/// leftovers from interrupted pulls.
pub(crate) const TEMP_PREFIX: &str = ".syncthing.";

/// Per-directory ignore file. Patterns are glob-matched against base names
/// under the directory holding the file; the file itself is never synced.
pub(crate) const IGNORE_FILE: &str = ".stignore";

pub(crate) fn is_temp_name(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with(TEMP_PREFIX))
        .unwrap_or(false)
}

pub(crate) fn temp_name(path: &Path, modified: i64) -> PathBuf {
    let base = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unnamed");
    path.with_file_name(format!("{TEMP_PREFIX}{base}.{modified}"))
}

impl Model {
    /// Scan the repository and return the hashed file list plus the ignore
    /// patterns in effect, keyed by the directory they were found in.
    ///
    /// Unchanged files reuse their existing records without re-hashing.
    /// Changed files pass through change suppression first; a suppressed
    /// file's previous record is re-announced with the invalid flag so peers
    /// stop pulling it until it settles.
    pub async fn walk(
        &self,
        follow_symlinks: bool,
    ) -> Result<(Vec<File>, HashMap<String, Vec<String>>)> {
        // Mutually exclusive with the puller's active window, so a scan
        // never sees a half-applied pull.
        let _walk_guard = self.walk_lock.lock().await;

        let patterns = self.load_ignore_files().await;
        let trace_file = {
            let mut state = self.state.write().await;
            state.ignore = compile_patterns(&patterns);
            state.traces(TraceCategory::File)
        };

        let mut files = Vec::new();
        let mut dirs = vec![self.dir.clone()];

        while let Some(dir) = dirs.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("scan {:?}: {}", dir, e);
                    continue;
                }
            };

            loop {
                let entry = match entries.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("scan {:?}: {}", dir, e);
                        break;
                    }
                };
                let path = entry.path();
                let Some(name) = self.relative_name(&path) else {
                    continue;
                };

                if is_temp_name(&path) {
                    continue;
                }
                if path.file_name().and_then(|n| n.to_str()) == Some(IGNORE_FILE) {
                    continue;
                }
                if self.state.read().await.should_ignore(&name) {
                    if trace_file {
                        debug!("ignore {:?}", name);
                    }
                    continue;
                }

                let Ok(meta) = entry.metadata().await else {
                    continue;
                };

                if meta.is_dir() {
                    files.push(File {
                        name,
                        flags: FLAG_DIRECTORY | (meta.permissions().mode() & FLAG_MODE_MASK),
                        modified: mtime_secs(&meta),
                        version: 0,
                        blocks: Vec::new(),
                    });
                    dirs.push(path);
                } else if meta.is_file() {
                    if let Some(f) = self.scan_file(name, &path, &meta, trace_file).await {
                        files.push(f);
                    }
                } else if meta.file_type().is_symlink() && follow_symlinks {
                    let Ok(target) = fs::metadata(&path).await else {
                        continue;
                    };
                    if target.is_dir() {
                        dirs.push(path);
                    } else if target.is_file() {
                        if let Some(f) = self.scan_file(name, &path, &target, trace_file).await {
                            files.push(f);
                        }
                    }
                }
            }
        }

        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok((files, patterns))
    }

    /// Re-examine a single file, typically on a filesystem notification.
    /// A vanished file is tombstoned immediately; a changed one is
    /// re-hashed. Promotes through `update_local`.
    pub async fn recheck_file(&self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        if is_temp_name(path) {
            return;
        }
        let Some(name) = self.relative_name(path) else {
            return;
        };
        if path.file_name().and_then(|n| n.to_str()) == Some(IGNORE_FILE) {
            return;
        }

        let (ignored, existing, trace_file) = {
            let state = self.state.read().await;
            (
                state.should_ignore(&name),
                state.local.get(&name).cloned(),
                state.traces(TraceCategory::File),
            )
        };
        if ignored {
            return;
        }
        if trace_file {
            debug!("recheck {:?}", name);
        }

        match fs::metadata(path).await {
            Err(_) => {
                // Deleted or unreadable; either way, gone.
                let Some(mut f) = existing else {
                    return;
                };
                if f.is_deleted() {
                    return;
                }
                f.flags = FLAG_DELETED;
                f.version += 1;
                f.blocks.clear();
                self.update_local(f).await;
            }
            Ok(meta) => {
                if !meta.is_file() {
                    return;
                }
                let modified = mtime_secs(&meta);
                if let Some(f) = &existing {
                    if f.modified == modified {
                        return;
                    }
                }

                if trace_file {
                    debug!("hash {:?}", name);
                }
                let Ok(fd) = fs::File::open(path).await else {
                    return;
                };
                let Ok(blocks) = hash_blocks(fd, BLOCK_SIZE).await else {
                    return;
                };
                self.update_local(File {
                    name,
                    flags: meta.permissions().mode() & FLAG_MODE_MASK,
                    modified,
                    version: 0,
                    blocks,
                })
                .await;
            }
        }
    }

    async fn scan_file(
        &self,
        name: String,
        path: &Path,
        meta: &std::fs::Metadata,
        trace_file: bool,
    ) -> Option<File> {
        let modified = mtime_secs(meta);
        let mode = meta.permissions().mode() & FLAG_MODE_MASK;

        let existing = {
            let state = self.state.read().await;
            state.local.get(&name).cloned()
        };

        // Unchanged files keep their record; a pure mode change bumps the
        // version without re-hashing.
        if let Some(f) = &existing {
            if f.modified == modified {
                let mut f = f.clone();
                if f.flags != mode {
                    f.flags = mode;
                    f.version += 1;
                }
                return Some(f);
            }
        }

        if self.should_suppress_change(&name).await {
            if trace_file {
                debug!("suppress change to {:?}", name);
            }
            if let Some(mut f) = existing {
                f.flags = FLAG_INVALID;
                f.version += 1;
                return Some(f);
            }
            return None;
        }

        if trace_file {
            debug!("hash {:?}", name);
        }
        let fd = match fs::File::open(path).await {
            Ok(fd) => fd,
            Err(e) => {
                warn!("open {:?}: {}", name, e);
                return None;
            }
        };
        let blocks = match hash_blocks(fd, BLOCK_SIZE).await {
            Ok(blocks) => blocks,
            Err(e) => {
                warn!("hash {:?}: {}", name, e);
                return None;
            }
        };

        Some(File {
            name,
            flags: mode,
            modified,
            version: 0,
            blocks,
        })
    }

    /// Collect ignore files across the tree; patterns are anchored at the
    /// directory that holds their file.
    async fn load_ignore_files(&self) -> HashMap<String, Vec<String>> {
        let mut patterns = HashMap::new();
        let mut dirs = vec![self.dir.clone()];

        while let Some(dir) = dirs.pop() {
            let Ok(mut entries) = fs::read_dir(&dir).await else {
                continue;
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                let Ok(meta) = entry.metadata().await else {
                    continue;
                };
                if meta.is_dir() {
                    dirs.push(path);
                } else if path.file_name().and_then(|n| n.to_str()) == Some(IGNORE_FILE) {
                    let Ok(content) = fs::read_to_string(&path).await else {
                        continue;
                    };
                    let Some(dir_name) = self.relative_name(&dir) else {
                        continue;
                    };
                    let lines: Vec<String> = content
                        .lines()
                        .filter(|line| !line.is_empty())
                        .map(String::from)
                        .collect();
                    if !lines.is_empty() {
                        patterns.insert(dir_name, lines);
                    }
                }
            }
        }

        patterns
    }

    /// Repository-relative, forward-slash-separated name for a path under
    /// the repository root. The root itself maps to the empty string.
    fn relative_name(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.dir).ok()?;
        Some(
            rel.components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/"),
        )
    }
}

impl State {
    /// Whether `name` matches an ignore pattern anchored at one of its
    /// ancestor directories.
    pub(crate) fn should_ignore(&self, name: &str) -> bool {
        let (dir, base) = match name.rsplit_once('/') {
            Some((dir, base)) => (dir, base),
            None => ("", name),
        };
        for (prefix, patterns) in &self.ignore {
            let applies = prefix.is_empty()
                || dir == prefix
                || dir.starts_with(&format!("{prefix}/"));
            if !applies {
                continue;
            }
            if patterns.iter().any(|p| p.matches(base)) {
                return true;
            }
        }
        false
    }
}

/// Remove leftover temp files from interrupted pulls. Spawned once when
/// read/write processing starts.
pub(crate) async fn clean_temp_files(model: Arc<Model>) {
    let trace_file = model.state.read().await.traces(TraceCategory::File);
    let mut dirs = vec![model.dir.clone()];

    while let Some(dir) = dirs.pop() {
        let Ok(mut entries) = fs::read_dir(&dir).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if meta.is_dir() {
                dirs.push(path);
            } else if meta.is_file() && is_temp_name(&path) {
                if trace_file {
                    debug!("remove stale temp file {:?}", path);
                }
                let _ = fs::remove_file(&path).await;
            }
        }
    }
}

fn compile_patterns(
    patterns: &HashMap<String, Vec<String>>,
) -> HashMap<String, Vec<glob::Pattern>> {
    patterns
        .iter()
        .map(|(dir, pats)| {
            let compiled = pats
                .iter()
                .filter_map(|p| match glob::Pattern::new(p) {
                    Ok(pattern) => Some(pattern),
                    Err(e) => {
                        warn!("bad ignore pattern {:?} in {:?}: {}", p, dir, e);
                        None
                    }
                })
                .collect();
            (dir.clone(), compiled)
        })
        .collect()
}

fn mtime_secs(meta: &std::fs::Metadata) -> i64 {
    FileTime::from_last_modification_time(meta).unix_seconds()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_names_round_trip() {
        let tmp = temp_name(Path::new("some/dir/data.bin"), 12345);
        assert_eq!(tmp, Path::new("some/dir/.syncthing.data.bin.12345"));
        assert!(is_temp_name(&tmp));
        assert!(!is_temp_name(Path::new("some/dir/data.bin")));
    }

    #[tokio::test]
    async fn walk_skips_ignored_temp_and_ignore_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::write(root.join("keep.txt"), b"kept").await.unwrap();
        fs::write(root.join("skip.log"), b"skipped").await.unwrap();
        fs::write(root.join(".syncthing.keep.txt.123"), b"partial")
            .await
            .unwrap();
        fs::write(root.join(IGNORE_FILE), b"*.log\n").await.unwrap();
        fs::create_dir(root.join("sub")).await.unwrap();
        fs::write(root.join("sub/inner.log"), b"also skipped")
            .await
            .unwrap();
        fs::write(root.join("sub/data"), b"data").await.unwrap();

        let model = Model::new(root);
        let (files, patterns) = model.walk(false).await.unwrap();

        let names: Vec<_> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["keep.txt", "sub", "sub/data"]);
        assert_eq!(patterns.get(""), Some(&vec!["*.log".to_string()]));

        let sub = files.iter().find(|f| f.name == "sub").unwrap();
        assert!(sub.is_directory());
        assert!(sub.blocks.is_empty());

        let keep = files.iter().find(|f| f.name == "keep.txt").unwrap();
        assert_eq!(keep.blocks.len(), 1);
        assert_eq!(keep.size(), 4);
    }

    #[tokio::test]
    async fn rapid_rescan_of_changed_file_is_suppressed() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let path = root.join("busy.db");
        fs::write(&path, b"state one").await.unwrap();

        let model = Model::new(root);
        let (files, _) = model.walk(false).await.unwrap();
        model.replace_local(files).await;
        let before = model.local_file("busy.db").await.unwrap();
        assert!(!before.is_invalid());

        // Rewrite with a different mtime and scan again immediately. The
        // change is held back and the record goes out as invalid.
        fs::write(&path, b"state two").await.unwrap();
        filetime::set_file_mtime(&path, FileTime::from_unix_time(before.modified + 30, 0))
            .unwrap();

        let (files, _) = model.walk(false).await.unwrap();
        let busy = files.iter().find(|f| f.name == "busy.db").unwrap();
        assert!(busy.is_invalid());
        assert_eq!(busy.version, before.version + 1);
        assert_eq!(busy.blocks, before.blocks);
    }

    #[tokio::test]
    async fn unchanged_file_is_not_rehashed_but_mode_change_bumps_version() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let path = root.join("stable.txt");
        fs::write(&path, b"stable contents").await.unwrap();

        let model = Model::new(root);
        let (files, _) = model.walk(false).await.unwrap();
        model.replace_local(files).await;
        let first = model.local_file("stable.txt").await.unwrap();

        let (files, _) = model.walk(false).await.unwrap();
        let second = files.iter().find(|f| f.name == "stable.txt").unwrap();
        assert_eq!(second, &first);

        fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
            .await
            .unwrap();
        let (files, _) = model.walk(false).await.unwrap();
        let third = files.iter().find(|f| f.name == "stable.txt").unwrap();
        assert_eq!(third.flags & FLAG_MODE_MASK, 0o600);
        assert_eq!(third.version, first.version + 1);
        assert_eq!(third.blocks, first.blocks);
    }

    #[tokio::test]
    async fn recheck_tombstones_vanished_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let path = root.join("fleeting.txt");
        fs::write(&path, b"soon gone").await.unwrap();

        let model = Model::new(root);
        let (files, _) = model.walk(false).await.unwrap();
        model.replace_local(files).await;
        let before = model.local_file("fleeting.txt").await.unwrap();

        fs::remove_file(&path).await.unwrap();
        model.recheck_file(&path).await;

        let after = model.local_file("fleeting.txt").await.unwrap();
        assert!(after.is_deleted());
        assert!(after.blocks.is_empty());
        assert_eq!(after.version, before.version + 1);

        // A second recheck of the same vanished file changes nothing.
        model.recheck_file(&path).await;
        assert_eq!(
            model.local_file("fleeting.txt").await.unwrap().version,
            after.version
        );
    }

    #[tokio::test]
    async fn recheck_picks_up_modified_content() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let path = root.join("note.txt");
        fs::write(&path, b"first").await.unwrap();

        let model = Model::new(root);
        let (files, _) = model.walk(false).await.unwrap();
        model.replace_local(files).await;
        let before = model.local_file("note.txt").await.unwrap();

        fs::write(&path, b"second, longer").await.unwrap();
        filetime::set_file_mtime(&path, FileTime::from_unix_time(before.modified + 5, 0))
            .unwrap();
        model.recheck_file(&path).await;

        let after = model.local_file("note.txt").await.unwrap();
        assert_eq!(after.modified, before.modified + 5);
        assert_eq!(after.size(), 14);
        assert_ne!(after.blocks, before.blocks);
    }
}
