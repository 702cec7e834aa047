//! The pull loop that converges local disk on the global view.
//!
//! Once per second the puller snapshots the need set, pulls every needed
//! file with a bounded fleet of per-file tasks, and then fixes up directory
//! metadata. It holds the walk lock for the whole window so a concurrent
//! scan never observes a half-applied pull. At most `parallel_files` files
//! are in flight at once; each file runs `parallel_requests` block fetchers,
//! so the product bounds outstanding block requests.

use std::collections::{HashSet, VecDeque};
use std::io::SeekFrom;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use filetime::FileTime;
use tokio::fs;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::debug;

use drift_blocks::{Block, BLOCK_SIZE};

use crate::config::TraceCategory;
use crate::errors::{ModelError, Result};
use crate::file::File;
use crate::model::{Model, LOCAL_PEER};
use crate::walker;

const PULL_INTERVAL: Duration = Duration::from_secs(1);

/// Depth of the in-memory channel between block fetchers and the writer.
const CONTENT_CHANNEL_DEPTH: usize = 32;

/// A block's worth of content addressed at its final file offset.
struct Content {
    offset: u64,
    data: Bytes,
}

pub(crate) async fn run(model: Arc<Model>) {
    loop {
        tokio::time::sleep(PULL_INTERVAL).await;

        let _walk_guard = model.walk_lock.lock().await;

        let (need_files, mut need_dirs, parallel_files, trace_file) = {
            let state = model.state.read().await;
            let mut files = Vec::new();
            let mut dirs = Vec::new();
            for name in &state.need {
                match state.global.get(name) {
                    Some(gf) if gf.is_directory() => dirs.push(name.clone()),
                    Some(_) => files.push(name.clone()),
                    None => {}
                }
            }
            (
                files,
                dirs,
                state.parallel_files,
                state.traces(TraceCategory::File),
            )
        };

        if need_files.is_empty() && need_dirs.is_empty() {
            continue;
        }

        let limiter = Arc::new(Semaphore::new(parallel_files));
        let mut fleet = JoinSet::new();
        for name in need_files {
            // Pulled files dirty their parent directory's metadata.
            if let Some(parent) = parent_name(&name) {
                need_dirs.push(parent);
            }

            let Ok(permit) = Arc::clone(&limiter).acquire_owned().await else {
                break;
            };
            let model = Arc::clone(&model);
            fleet.spawn(async move {
                let _permit = permit;
                pull_one(model, name).await;
            });
        }
        while fleet.join_next().await.is_some() {}

        let mut seen = HashSet::new();
        for name in need_dirs {
            if !seen.insert(name.clone()) {
                continue;
            }
            if trace_file {
                debug!("fix up directory {:?}", name);
            }
            if let Err(e) = pull_dir(&model, &name).await {
                debug!("directory fix-up {:?}: {}", name, e);
            }
        }
    }
}

/// Pull a single needed name, then promote the global record into the local
/// index if it is still the current one.
async fn pull_one(model: Arc<Model>, name: String) {
    let (global, trace_file) = {
        let state = model.state.read().await;
        (
            state.global.get(&name).cloned(),
            state.traces(TraceCategory::File),
        )
    };
    let Some(global) = global else {
        return;
    };

    let result = if global.is_deleted() {
        if trace_file {
            debug!("remove {:?}", name);
        }
        // A file that is already gone is as deleted as we need it to be.
        let _ = fs::remove_file(model.dir.join(&name)).await;
        Ok(())
    } else {
        if trace_file {
            debug!("pull {:?}", name);
        }
        pull_file(&model, &name, &global).await
    };

    match result {
        Ok(()) => {
            // The global record was captured without the lock; re-check it
            // before promotion so a record that moved on in the meantime is
            // left for the next iteration.
            let mut state = model.state.write().await;
            let still_current = state
                .global
                .get(&name)
                .map(|cur| cur.same_version(&global))
                .unwrap_or(false);
            if still_current {
                state.update_local(global);
            }
        }
        Err(e) => {
            if trace_file {
                debug!("pull {:?}: {}", name, e);
            }
        }
    }
}

/// Assemble `name` at the version described by `global` in a temp file and
/// atomically rename it into place.
async fn pull_file(model: &Arc<Model>, name: &str, global: &File) -> Result<()> {
    let (local, sources, parallel_requests) = {
        let state = model.state.read().await;
        (
            state.local.get(name).cloned().unwrap_or_default(),
            state.who_has(name),
            state.parallel_requests,
        )
    };

    if sources.is_empty() {
        return Err(ModelError::NoSource(name.to_string()));
    }

    let dest = model.dir.join(name);
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await?;
    }

    let tmp_path = walker::temp_name(&dest, global.modified);
    let tmp_file = fs::File::create(&tmp_path).await?;

    let (tx, rx) = mpsc::channel(CONTENT_CHANNEL_DEPTH);
    let writer = tokio::spawn(write_content(rx, tmp_file));

    let diff = drift_blocks::diff(&local.blocks, &global.blocks);
    let mut fetchers = JoinSet::new();

    // One local reader feeding blocks we already hold on disk.
    {
        let model = Arc::clone(model);
        let name = name.to_string();
        let tx = tx.clone();
        let blocks = diff.have;
        fetchers.spawn(async move {
            for block in blocks {
                let data = match model
                    .request(LOCAL_PEER, &name, block.offset, block.length, &block.hash)
                    .await
                {
                    Ok(data) => data,
                    Err(_) => break,
                };
                if tx
                    .send(Content {
                        offset: block.offset,
                        data,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
    }

    // N remote fetchers draining a shared queue, so a slow peer never
    // strands blocks that a faster one could fetch. Peers are assigned
    // round-robin from the candidate list.
    let queue = Arc::new(Mutex::new(VecDeque::from(diff.need)));
    for i in 0..parallel_requests {
        let peer_id = sources[i % sources.len()].clone();
        let model = Arc::clone(model);
        let name = name.to_string();
        let tx = tx.clone();
        let queue = Arc::clone(&queue);
        fetchers.spawn(async move {
            loop {
                let block = queue.lock().await.pop_front();
                let Some(block) = block else {
                    break;
                };
                let data = match model
                    .request_from(&peer_id, &name, block.offset, block.length, &block.hash)
                    .await
                {
                    Ok(data) => data,
                    Err(_) => break,
                };
                if tx
                    .send(Content {
                        offset: block.offset,
                        data,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
    }
    drop(tx);

    while fetchers.join_next().await.is_some() {}

    let written = match writer.await {
        Ok(result) => result,
        Err(e) => Err(std::io::Error::other(e)),
    };
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(e.into());
    }

    if let Err(e) = verify_blocks(&tmp_path, name, &global.blocks).await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(e);
    }

    filetime::set_file_mtime(&tmp_path, FileTime::from_unix_time(global.modified, 0))?;
    fs::set_permissions(
        &tmp_path,
        std::fs::Permissions::from_mode(global.flags & 0o777),
    )
    .await?;
    fs::rename(&tmp_path, &dest).await?;

    Ok(())
}

/// Bring a directory's permission bits and modification time in line with
/// the global record. Directories carry no blocks; names without a global
/// record (parents of pulled files) are left alone.
async fn pull_dir(model: &Model, name: &str) -> Result<()> {
    let global = {
        let state = model.state.read().await;
        state.global.get(name).cloned()
    };
    let Some(global) = global else {
        return Ok(());
    };

    let path = model.dir.join(name);
    let meta = fs::metadata(&path).await?;

    let mode = meta.permissions().mode() & 0xfff;
    if mode != global.flags & 0xfff {
        fs::set_permissions(&path, std::fs::Permissions::from_mode(global.flags & 0xfff)).await?;
    }

    let disk_mtime = FileTime::from_last_modification_time(&meta);
    if disk_mtime.unix_seconds() != global.modified {
        filetime::set_file_mtime(&path, FileTime::from_unix_time(global.modified, 0))?;
    }

    Ok(())
}

async fn write_content(mut rx: mpsc::Receiver<Content>, mut file: fs::File) -> std::io::Result<()> {
    while let Some(content) = rx.recv().await {
        file.seek(SeekFrom::Start(content.offset)).await?;
        file.write_all(&content.data).await?;
    }
    file.flush().await?;
    Ok(())
}

/// Re-hash an assembled file and compare against the announced block list.
async fn verify_blocks(path: &Path, name: &str, want: &[Block]) -> Result<()> {
    let fd = fs::File::open(path).await?;
    let have = drift_blocks::hash_blocks(fd, BLOCK_SIZE).await?;

    if have.len() != want.len() {
        return Err(ModelError::HashMismatch(name.to_string()));
    }
    for (h, w) in have.iter().zip(want) {
        if h.hash != w.hash {
            return Err(ModelError::HashMismatch(name.to_string()));
        }
    }
    Ok(())
}

fn parent_name(name: &str) -> Option<String> {
    name.rsplit_once('/').map(|(dir, _)| dir.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn parent_name_splits_on_last_slash() {
        assert_eq!(parent_name("a/b/c.txt").as_deref(), Some("a/b"));
        assert_eq!(parent_name("a/b").as_deref(), Some("a"));
        assert_eq!(parent_name("top.txt"), None);
    }

    #[tokio::test]
    async fn writer_places_blocks_by_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let file = fs::File::create(&path).await.unwrap();

        let (tx, rx) = mpsc::channel(CONTENT_CHANNEL_DEPTH);
        let writer = tokio::spawn(write_content(rx, file));

        // Deliver out of order; offsets alone determine placement.
        for (offset, data) in [(4u64, &b"5678"[..]), (0u64, &b"1234"[..])] {
            tx.send(Content {
                offset,
                data: Bytes::from_static(data),
            })
            .await
            .unwrap();
        }
        drop(tx);
        writer.await.unwrap().unwrap();

        let mut assembled = String::new();
        fs::File::open(&path)
            .await
            .unwrap()
            .read_to_string(&mut assembled)
            .await
            .unwrap();
        assert_eq!(assembled, "12345678");
    }

    #[tokio::test]
    async fn verify_blocks_detects_tampering() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        fs::write(&path, b"hello world").await.unwrap();

        let fd = fs::File::open(&path).await.unwrap();
        let want = drift_blocks::hash_blocks(fd, BLOCK_SIZE).await.unwrap();
        verify_blocks(&path, "data", &want).await.unwrap();

        fs::write(&path, b"hello w0rld").await.unwrap();
        let err = verify_blocks(&path, "data", &want).await.unwrap_err();
        assert!(matches!(err, ModelError::HashMismatch(_)));

        fs::write(&path, b"").await.unwrap();
        let err = verify_blocks(&path, "data", &want).await.unwrap_err();
        assert!(matches!(err, ModelError::HashMismatch(_)));
    }
}
