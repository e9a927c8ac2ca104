use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

use crossbeam_deque::{Injector, Steal};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};

use crate::assembler::AssetAssembler;
use crate::chunk_store::ChunkStore;
use crate::diff::{diff_builds, AssetDiff, BuildDiff, SophonAsset};
use crate::manifest::{decode_build, DecodedBuild};
use crate::progress::{ProgressCounter, Update};
use crate::protos::SophonManifest::{SophonManifestAssetChunk, SophonManifestAssetProperty};
use crate::schemas::{AudioLanguages, Build, DownloadInfo};
use crate::verifier::verify_assets;
use crate::{check_cancelled, check_file, ensure_parent, free_space, SophonError};

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    Install,
    Verify,
    Update,
    Predownload
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationState {
    Idle,
    Running,
    Completed,
    Cancelled,
    Failed
}

/// Everything one operation needs: what to do, where the game lives, and the
/// build descriptors obtained from the launcher API by the embedder
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub state: OperationKind,
    pub game_directory: PathBuf,
    pub chunks_directory: PathBuf,
    pub predownload_status_path: PathBuf,
    pub local_branch: Option<Build>,
    pub remote_branch: Option<Build>,
    pub audio_languages: AudioLanguages
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PredownloadStatus {
    pub tag: String,
    pub finished: bool,
    pub total_blocks: u64
}

/// An asset scheduled into a download/assembly stage: the chunks it needs
/// fetched and, for diff merges, the old manifest record to copy unchanged
/// ranges from
struct StageItem<'a> {
    asset: &'a SophonManifestAssetProperty,
    download: &'a DownloadInfo,
    old: Option<&'a SophonManifestAssetProperty>,
    fetch: Vec<&'a SophonManifestAssetChunk>
}

impl<'a> StageItem<'a> {
    fn full(sophon_asset: &SophonAsset<'a>) -> Self {
        Self {
            asset: sophon_asset.asset,
            download: sophon_asset.chunk_download,
            old: None,
            fetch: sophon_asset.asset.AssetChunks.iter().collect()
        }
    }

    fn diff(asset_diff: &AssetDiff<'a>) -> Self {
        Self {
            asset: asset_diff.new,
            download: asset_diff.chunk_download,
            old: Some(asset_diff.old),
            fetch: asset_diff.diff_chunks.clone()
        }
    }
}

struct FileTask<'a> {
    asset: &'a SophonManifestAssetProperty,
    old: Option<&'a SophonManifestAssetProperty>,
    pending_chunks: AtomicUsize
}

struct ChunkTask<'a> {
    chunk: &'a SophonManifestAssetChunk,
    download: &'a DownloadInfo,
    used_in_files: Vec<usize>
}

/// Work index of one download/assembly stage. Chunks are deduplicated by
/// name across assets; every file tracks how many of its chunks are still
/// in flight and becomes ready for assembly when the counter hits zero.
struct StageIndex<'a> {
    files: Vec<FileTask<'a>>,
    chunks: Vec<ChunkTask<'a>>,
    assemble: bool,
    progress: ProgressCounter,
    merged_files: AtomicU64
}

impl<'a> StageIndex<'a> {
    fn new(items: impl IntoIterator<Item = StageItem<'a>>, assemble: bool) -> Self {
        let mut files = Vec::new();
        let mut chunks: Vec<ChunkTask<'a>> = Vec::new();
        let mut chunks_by_name: HashMap<&'a str, usize> = HashMap::new();

        for (file_index, item) in items.into_iter().enumerate() {
            let mut pending = 0;

            for &chunk in &item.fetch {
                let chunk_index = *chunks_by_name
                    .entry(chunk.ChunkName.as_str())
                    .or_insert_with(|| {
                        chunks.push(ChunkTask {
                            chunk,
                            download: item.download,
                            used_in_files: Vec::new()
                        });

                        chunks.len() - 1
                    });

                // The same content can sit at several offsets of one file
                if !chunks[chunk_index].used_in_files.contains(&file_index) {
                    chunks[chunk_index].used_in_files.push(file_index);

                    pending += 1;
                }
            }

            files.push(FileTask {
                asset: item.asset,
                old: item.old,
                pending_chunks: AtomicUsize::new(pending)
            });
        }

        let progress = ProgressCounter::for_chunks(chunks.iter().map(|task| task.chunk));

        Self {
            files,
            chunks,
            assemble,
            progress,
            merged_files: AtomicU64::new(0)
        }
    }

    fn compressed_bytes(&self) -> u64 {
        self.chunks.iter()
            .map(|task| task.chunk.ChunkSize)
            .sum()
    }

    fn count_merged(&self) {
        self.merged_files.fetch_add(1, Ordering::SeqCst);
    }

    fn msg_files(&self) -> Update {
        Update::DownloadingProgressFiles {
            merged_files: self.merged_files.load(Ordering::Acquire),
            total_files: self.files.len() as u64
        }
    }
}

/// Drives the four operation pipelines over the chunk store, assembler and
/// verifier. At most one operation is in flight at a time; starting a new
/// one cancels and drains the previous one first.
#[derive(Debug)]
pub struct SophonEngine {
    pub client: Client,
    thread_count: usize,
    check_free_space: bool,
    state: Mutex<OperationState>,
    state_changed: Condvar,
    cancel_requested: AtomicBool
}

impl SophonEngine {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            thread_count: std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(1),
            check_free_space: true,
            state: Mutex::new(OperationState::Idle),
            state_changed: Condvar::new(),
            cancel_requested: AtomicBool::new(false)
        }
    }

    #[inline]
    pub fn with_thread_count(mut self, thread_count: usize) -> Self {
        self.thread_count = thread_count.max(1);

        self
    }

    #[inline]
    pub fn with_free_space_check(mut self, check: bool) -> Self {
        self.check_free_space = check;

        self
    }

    pub fn state(&self) -> OperationState {
        *self.state.lock().expect("Something poisoned the state mutex")
    }

    /// Run the operation described by the context on the calling thread,
    /// reporting progress through the updater.
    ///
    /// Returns `Ok(true)` when the operation ran to its end (including the
    /// controlled stops: insufficient disk space, unreachable or corrupted
    /// manifests) and `Ok(false)` when it was cancelled. The chunk store
    /// survives cancellation so a later operation resumes where this one
    /// stopped.
    pub fn start_operation(
        &self,
        context: &OperationContext,
        updater: impl Fn(Update) + Clone + Send + 'static
    ) -> Result<bool, SophonError> {
        self.cancel_operation();

        {
            let mut state = self.state.lock().expect("Something poisoned the state mutex");

            // Another thread may have raced us into Running; wait it out
            while *state == OperationState::Running {
                state = self.state_changed.wait(state).expect("Something poisoned the state mutex");
            }

            *state = OperationState::Running;

            self.cancel_requested.store(false, Ordering::SeqCst);
        }

        tracing::info!(operation = ?context.state, "Starting operation");

        let result = self.run_pipeline(context, updater.clone());

        let (terminal, outcome) = match result {
            Ok(()) => (OperationState::Completed, Ok(true)),

            Err(SophonError::Cancelled) => {
                tracing::info!(operation = ?context.state, "Operation cancelled");

                (OperationState::Cancelled, Ok(false))
            }

            Err(err) if err.is_precondition_failure() => {
                tracing::warn!(operation = ?context.state, %err, "Operation stopped on a failed precondition");

                (updater)(Update::DownloadingError(err));

                (OperationState::Completed, Ok(true))
            }

            Err(err) => {
                tracing::error!(operation = ?context.state, ?err, "Operation failed");

                (OperationState::Failed, Err(err))
            }
        };

        {
            let mut state = self.state.lock().expect("Something poisoned the state mutex");

            *state = terminal;

            self.state_changed.notify_all();
        }

        outcome
    }

    /// Request cooperative cancellation of the running operation and block
    /// until it has drained. No-op when nothing is running.
    pub fn cancel_operation(&self) {
        let mut state = self.state.lock().expect("Something poisoned the state mutex");

        if *state != OperationState::Running {
            return;
        }

        self.cancel_requested.store(true, Ordering::SeqCst);

        while *state == OperationState::Running {
            state = self.state_changed.wait(state).expect("Something poisoned the state mutex");
        }
    }

    fn run_pipeline(
        &self,
        context: &OperationContext,
        updater: impl Fn(Update) + Clone + Send + 'static
    ) -> Result<(), SophonError> {
        let store = ChunkStore::new(&context.chunks_directory);

        match context.state {
            OperationKind::Install => self.install(context, &store, updater),
            OperationKind::Verify => self.verify(context, &store, updater),
            OperationKind::Update => self.update(context, &store, updater),
            OperationKind::Predownload => self.predownload(context, &store, updater)
        }
    }

    fn decode_branch(
        &self,
        branch: &Option<Build>,
        which: &'static str,
        languages: &AudioLanguages
    ) -> Result<DecodedBuild, SophonError> {
        let build = branch.as_ref()
            .ok_or_else(|| SophonError::MissingBuildDescriptor(which.to_string()))?;

        decode_build(&self.client, build, languages, &self.cancel_requested)
    }

    fn free_space_check(
        &self,
        updater: impl Fn(Update),
        path: &Path,
        required: u64
    ) -> Result<(), SophonError> {
        if !self.check_free_space {
            return Ok(());
        }

        (updater)(Update::CheckingFreeSpace(path.to_owned()));

        match free_space::available(path) {
            Some(available) if available >= required => Ok(()),

            Some(available) => Err(SophonError::NoSpaceAvailable {
                path: path.to_owned(),
                required,
                available
            }),

            None => Err(SophonError::PathNotMounted(path.to_owned()))
        }
    }

    fn install(
        &self,
        context: &OperationContext,
        store: &ChunkStore,
        updater: impl Fn(Update) + Clone + Send + 'static
    ) -> Result<(), SophonError> {
        let remote = self.decode_branch(&context.remote_branch, "remote", &context.audio_languages)?;

        self.free_space_check(&updater, &context.game_directory, remote.total_uncompressed_bytes)?;

        let assets = remote.assets().collect::<Vec<_>>();
        let index = StageIndex::new(assets.iter().map(StageItem::full), true);

        (updater)(Update::DownloadingStarted(context.chunks_directory.clone()));

        self.run_stage(&index, store, &context.game_directory, updater.clone())?;

        (updater)(Update::DownloadingFinished);

        self.verify_and_repair(&assets, context, store, updater)?;

        store.purge()?;

        Ok(())
    }

    fn verify(
        &self,
        context: &OperationContext,
        store: &ChunkStore,
        updater: impl Fn(Update) + Clone + Send + 'static
    ) -> Result<(), SophonError> {
        let local = self.decode_branch(&context.local_branch, "local", &context.audio_languages)?;

        let assets = local.assets().collect::<Vec<_>>();

        let repaired = self.verify_and_repair(&assets, context, store, updater)?;

        // A clean check downloaded nothing, so the store stays as it was
        if repaired {
            store.purge()?;
        }

        Ok(())
    }

    fn update(
        &self,
        context: &OperationContext,
        store: &ChunkStore,
        updater: impl Fn(Update) + Clone + Send + 'static
    ) -> Result<(), SophonError> {
        let local = self.decode_branch(&context.local_branch, "local", &context.audio_languages)?;
        let remote = self.decode_branch(&context.remote_branch, "remote", &context.audio_languages)?;

        let diff = diff_builds(&local, &remote);

        self.free_space_check(&updater, &context.game_directory, diff.update_bytes())?;

        let items = diff.added.iter()
            .map(StageItem::full)
            .chain(diff.modified.iter().map(StageItem::diff));

        let index = StageIndex::new(items, true);

        (updater)(Update::DownloadingStarted(context.chunks_directory.clone()));

        self.run_stage(&index, store, &context.game_directory, updater.clone())?;

        (updater)(Update::DownloadingFinished);

        self.delete_assets(&diff, context, &updater)?;

        let assets = remote.assets().collect::<Vec<_>>();

        self.verify_and_repair(&assets, context, store, updater)?;

        store.purge()?;

        Ok(())
    }

    fn predownload(
        &self,
        context: &OperationContext,
        store: &ChunkStore,
        updater: impl Fn(Update) + Clone + Send + 'static
    ) -> Result<(), SophonError> {
        let local = self.decode_branch(&context.local_branch, "local", &context.audio_languages)?;
        let remote = self.decode_branch(&context.remote_branch, "remote", &context.audio_languages)?;

        let diff = diff_builds(&local, &remote);

        let items = diff.added.iter()
            .map(StageItem::full)
            .chain(diff.modified.iter().map(StageItem::diff));

        // Download only - deletions and merging belong to the later update
        let index = StageIndex::new(items, false);

        self.free_space_check(&updater, &context.chunks_directory, index.compressed_bytes())?;

        (updater)(Update::PredownloadStarted(context.predownload_status_path.clone()));

        let mut status = PredownloadStatus {
            tag: remote.tag.clone(),
            finished: false,
            total_blocks: index.chunks.len() as u64
        };

        write_predownload_status(&context.predownload_status_path, &status)?;

        (updater)(Update::DownloadingStarted(context.chunks_directory.clone()));

        self.run_stage(&index, store, &context.game_directory, updater.clone())?;

        (updater)(Update::DownloadingFinished);

        status.finished = true;

        write_predownload_status(&context.predownload_status_path, &status)?;

        (updater)(Update::PredownloadFinished);

        Ok(())
    }

    fn delete_assets(
        &self,
        diff: &BuildDiff<'_>,
        context: &OperationContext,
        updater: &impl Fn(Update)
    ) -> Result<(), SophonError> {
        if diff.deleted.is_empty() {
            return Ok(());
        }

        (updater)(Update::DeletingStarted);

        let total_files = diff.deleted.len() as u64;
        let mut deleted_files = 0;

        for asset in &diff.deleted {
            check_cancelled(&self.cancel_requested)?;

            let path = context.game_directory.join(&asset.AssetName);

            tracing::trace!(file_name = asset.AssetName, "Deleting unused asset");

            // Ignore any I/O errors, the file may be gone already
            let _ = if asset.is_directory() {
                std::fs::remove_dir_all(&path)
            }
            else {
                std::fs::remove_file(&path)
            };

            deleted_files += 1;

            (updater)(Update::DeletingProgress {
                deleted_files,
                total_files
            });
        }

        (updater)(Update::DeletingFinished);

        Ok(())
    }

    /// Verify every asset and run one repair pass over the conflict set.
    /// Returns whether anything had to be repaired.
    fn verify_and_repair<'a>(
        &self,
        assets: &[SophonAsset<'a>],
        context: &OperationContext,
        store: &ChunkStore,
        updater: impl Fn(Update) + Clone + Send + 'static
    ) -> Result<bool, SophonError> {
        (updater)(Update::VerifyingStarted);

        let conflicts = verify_assets(
            &context.game_directory,
            assets,
            self.thread_count,
            &self.cancel_requested,
            updater.clone()
        )?;

        (updater)(Update::VerifyingFinished {
            conflicts: conflicts.len() as u64
        });

        if conflicts.is_empty() {
            return Ok(false);
        }

        tracing::warn!(
            conflicts = conflicts.len(),
            "Verification found broken assets, repairing"
        );

        (updater)(Update::RepairingStarted);

        // Repair is a bounded second pass of the install pipeline over the
        // conflict set: refetch whatever is missing or invalid, reassemble
        let index = StageIndex::new(conflicts.iter().map(StageItem::full), true);

        self.run_stage(&index, store, &context.game_directory, updater.clone())?;

        (updater)(Update::RepairingFinished);

        Ok(true)
    }

    /// Run one download/assembly stage over the worker pool. Workers drain
    /// the queues in inverse pipeline order so downloaded chunks turn into
    /// assembled files before new downloads start.
    fn run_stage(
        &self,
        index: &StageIndex<'_>,
        store: &ChunkStore,
        game_directory: &Path,
        updater: impl Fn(Update) + Clone + Send + 'static
    ) -> Result<(), SophonError> {
        tracing::info!(
            chunks = index.chunks.len(),
            files = index.files.len(),
            total_bytes = index.progress.total_bytes(),
            "Starting download stage"
        );

        (updater)(index.progress.msg_downloaded_bytes());
        (updater)(index.msg_files());

        let assembler = AssetAssembler::new(store, game_directory);

        let download_queue = Injector::new();
        let assembly_queue = Injector::new();

        for chunk_index in 0..index.chunks.len() {
            download_queue.push(chunk_index);
        }

        // Directory assets and files with nothing left to fetch are ready
        // right away
        if index.assemble {
            for (file_index, file) in index.files.iter().enumerate() {
                if file.pending_chunks.load(Ordering::Acquire) == 0 {
                    assembly_queue.push(file_index);
                }
            }
        }

        std::thread::scope(|scope| {
            for _ in 0..self.thread_count {
                let updater_clone = updater.clone();
                let download_queue = &download_queue;
                let assembly_queue = &assembly_queue;
                let assembler = &assembler;

                scope.spawn(move || 'worker: loop {
                    if self.cancel_requested.load(Ordering::Relaxed) {
                        break 'worker;
                    }

                    if let Steal::Success(file_index) = assembly_queue.steal() {
                        self.assembly_handler(
                            &index.files[file_index],
                            index,
                            assembler,
                            game_directory,
                            &updater_clone
                        );

                        continue;
                    }

                    if let Steal::Success(chunk_index) = download_queue.steal() {
                        self.download_handler(
                            &index.chunks[chunk_index],
                            index,
                            store,
                            assembly_queue,
                            &updater_clone
                        );

                        continue;
                    }

                    // A thread still downloading will schedule and drain the
                    // assembly work it unlocks itself
                    if assembly_queue.is_empty() && download_queue.is_empty() {
                        break 'worker;
                    }
                });
            }
        });

        check_cancelled(&self.cancel_requested)
    }

    fn download_handler(
        &self,
        task: &ChunkTask<'_>,
        index: &StageIndex<'_>,
        store: &ChunkStore,
        assembly_queue: &Injector<usize>,
        updater: &impl Fn(Update)
    ) {
        let chunk_name = task.chunk.ChunkName.as_str();

        let result: Result<(), SophonError> = (|| {
            if store.contains_valid(chunk_name, &self.cancel_requested)? {
                tracing::trace!(chunk = chunk_name, "Chunk already stored, skipping download");

                return Ok(());
            }

            let response = self.client
                .get(task.download.download_url(chunk_name))
                .send()?
                .error_for_status()?;

            // A mismatched blob stays in the store; every asset built from
            // it gets flagged by the verify pass
            store.put(chunk_name, response, &self.cancel_requested)
        })();

        match result {
            Ok(()) => {
                index.progress.report(task.chunk.ChunkSizeDecompressed, true);

                (updater)(index.progress.msg_downloaded_bytes());
            }

            Err(SophonError::Cancelled) => return,

            Err(err) => {
                tracing::error!(chunk = chunk_name, ?err, "Failed to download chunk");

                (updater)(Update::DownloadingError(err));

                index.progress.report(0, true);
            }
        }

        // Unblock the files waiting on this chunk whatever the outcome;
        // failed chunks surface as conflicts in the verify pass
        if index.assemble {
            for &file_index in &task.used_in_files {
                if index.files[file_index].pending_chunks.fetch_sub(1, Ordering::SeqCst) == 1 {
                    assembly_queue.push(file_index);
                }
            }
        }
    }

    fn assembly_handler(
        &self,
        file: &FileTask<'_>,
        index: &StageIndex<'_>,
        assembler: &AssetAssembler<'_>,
        game_directory: &Path,
        updater: &impl Fn(Update)
    ) {
        let asset = file.asset;
        let target = game_directory.join(&asset.AssetName);

        let already_valid = !asset.is_directory()
            && matches!(
                check_file(&target, asset.AssetSize, &asset.AssetHashMd5, &self.cancel_requested),
                Ok(true)
            );

        let result = if already_valid {
            tracing::debug!(file = ?target, "File appears to be already assembled");

            Ok(())
        }
        else {
            match file.old {
                Some(old) => assembler.merge_diff_asset(old, asset, &self.cancel_requested),
                None => assembler.merge_asset(asset, &self.cancel_requested)
            }
        };

        match result {
            Ok(()) => {
                index.count_merged();

                (updater)(index.msg_files());
            }

            Err(SophonError::Cancelled) => (),

            Err(err) => {
                tracing::error!(
                    error = ?err,
                    file = asset.AssetName,
                    "File assembly failed"
                );

                (updater)(Update::DownloadingError(err));
            }
        }
    }
}

fn write_predownload_status(
    path: &Path,
    status: &PredownloadStatus
) -> Result<(), SophonError> {
    ensure_parent(path)?;

    let json = serde_json::to_string(status)
        .map_err(|err| SophonError::IoError(err.to_string()))?;

    std::fs::write(path, json)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_named(name: &str, size_decompressed: u64) -> SophonManifestAssetChunk {
        let mut chunk = SophonManifestAssetChunk::new();

        chunk.ChunkName = name.to_string();
        chunk.ChunkDecompressedHashMd5 = name.to_string();
        chunk.ChunkSize = size_decompressed / 2;
        chunk.ChunkSizeDecompressed = size_decompressed;

        chunk
    }

    fn asset_named(name: &str, chunks: Vec<SophonManifestAssetChunk>) -> SophonManifestAssetProperty {
        let mut asset = SophonManifestAssetProperty::new();

        asset.AssetName = name.to_string();
        asset.AssetSize = chunks.iter().map(|chunk| chunk.ChunkSizeDecompressed).sum();
        asset.AssetChunks = chunks;

        asset
    }

    #[test]
    fn stage_index_deduplicates_shared_chunks() {
        let download = DownloadInfo {
            url_prefix: String::from("http://localhost/chunks"),
            url_suffix: String::new()
        };

        let shared = chunk_named("shared", 10);

        let first = asset_named("a.bin", vec![shared.clone(), chunk_named("a1", 10)]);
        let second = asset_named("b.bin", vec![shared.clone(), chunk_named("b1", 10)]);

        let assets = [&first, &second].map(|asset| SophonAsset {
            chunk_download: &download,
            asset
        });

        let index = StageIndex::new(assets.iter().map(StageItem::full), true);

        // Three distinct chunks, the shared one is fetched once and feeds
        // both files
        assert_eq!(index.chunks.len(), 3);
        assert_eq!(index.progress.total_bytes(), 30);

        let shared_task = index.chunks.iter()
            .find(|task| task.chunk.ChunkName == "shared")
            .unwrap();

        assert_eq!(shared_task.used_in_files, vec![0, 1]);

        assert_eq!(index.files[0].pending_chunks.load(Ordering::Acquire), 2);
        assert_eq!(index.files[1].pending_chunks.load(Ordering::Acquire), 2);
    }

    #[test]
    fn stage_index_counts_repeated_chunk_content_once() {
        let download = DownloadInfo {
            url_prefix: String::from("http://localhost/chunks"),
            url_suffix: String::new()
        };

        // The same content at two offsets of one file downloads once
        let mut repeated = chunk_named("rep", 10);

        repeated.ChunkOnFileOffset = 0;

        let mut again = repeated.clone();

        again.ChunkOnFileOffset = 10;

        let asset = asset_named("a.bin", vec![repeated, again]);

        let assets = [SophonAsset {
            chunk_download: &download,
            asset: &asset
        }];

        let index = StageIndex::new(assets.iter().map(StageItem::full), true);

        assert_eq!(index.chunks.len(), 1);
        assert_eq!(index.files[0].pending_chunks.load(Ordering::Acquire), 1);
    }

    #[test]
    fn predownload_status_serialization() {
        let status = PredownloadStatus {
            tag: String::from("2.3.0"),
            finished: false,
            total_blocks: 42
        };

        let json = serde_json::to_string(&status).unwrap();

        assert_eq!(json, r#"{"Tag":"2.3.0","Finished":false,"TotalBlocks":42}"#);

        let read_back: PredownloadStatus = serde_json::from_str(&json).unwrap();

        assert_eq!(read_back, status);
    }
}
