use super::*;
use crate::cache::DiskObserver;
use crate::storage::{
    CheckStatus, FileEntry, MoveFlags, PieceInfo, ResumeData, StorageError, StorageHandle,
    TorrentStorage, ZeroStorage,
};
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const BLOCK: usize = 16384;
const PIECE_LEN: usize = 2 * BLOCK;
const NUM_PIECES: u32 = 4;
const TIMEOUT: Duration = Duration::from_secs(10);

type Slot<T> = Arc<Mutex<Option<Result<T, StorageError>>>>;

fn slot<T: Send + 'static>() -> (Slot<T>, Handler<T>) {
    let slot = Arc::new(Mutex::new(None));
    let sink = slot.clone();
    (slot, Box::new(move |result| *sink.lock() = Some(result)))
}

fn piece_data(piece: u32) -> Vec<u8> {
    (0..PIECE_LEN)
        .map(|i| (i as u8).wrapping_mul(7).wrapping_add((piece as u8).wrapping_mul(31)))
        .collect()
}

fn sha1_of(data: &[u8]) -> [u8; 20] {
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&Sha1::digest(data));
    hash
}

#[derive(Default)]
struct Flag(AtomicBool);

impl DiskObserver for Flag {
    fn on_disk(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

struct Harness {
    disk: DiskIoThread,
    ctx: Arc<ManualContext>,
    temp: TempDir,
}

impl Harness {
    fn new(settings: DiskSettings) -> Self {
        let ctx = Arc::new(ManualContext::new());
        let disk = DiskIoThread::new(settings, ctx.clone()).unwrap();
        Self {
            disk,
            ctx,
            temp: TempDir::new().unwrap(),
        }
    }

    fn torrent(&self) -> StorageHandle {
        let total = PIECE_LEN as u64 * NUM_PIECES as u64;
        let files = vec![FileEntry::new(PathBuf::from("test.dat"), total, 0)];
        let pieces = (0..NUM_PIECES)
            .map(|p| {
                let offset = p as u64 * PIECE_LEN as u64;
                PieceInfo::v1(p, sha1_of(&piece_data(p)), offset, PIECE_LEN as u64)
            })
            .collect();
        let storage =
            TorrentStorage::new(self.temp.path().to_path_buf(), files, pieces, total).unwrap();
        self.disk.add_storage(storage)
    }

    fn wait<T>(&self, slot: &Slot<T>) -> Result<T, StorageError> {
        let deadline = Instant::now() + TIMEOUT;
        loop {
            if let Some(result) = slot.lock().take() {
                return result;
            }
            assert!(Instant::now() < deadline, "timed out waiting for a completion");
            self.ctx.run_one_timeout(Duration::from_millis(20));
        }
    }

    fn pump_until(&self, done: impl Fn() -> bool) {
        let deadline = Instant::now() + TIMEOUT;
        while !done() {
            assert!(Instant::now() < deadline, "timed out waiting for the disk thread");
            self.ctx.run_one_timeout(Duration::from_millis(20));
        }
    }

    fn write(&self, storage: &StorageHandle, piece: u32, offset: u32, data: &[u8]) -> Result<(), StorageError> {
        let mut buffer = self.disk.allocate_buffer("test write", None)?;
        buffer.fill_from(data);
        let (result, handler) = slot();
        self.disk
            .async_write(storage, piece, offset, buffer, JobFlags::default(), handler);
        self.disk.submit_jobs();
        self.wait(&result)
    }

    fn write_piece(&self, storage: &StorageHandle, piece: u32, data: &[u8]) {
        for (i, block) in data.chunks(BLOCK).enumerate() {
            self.write(storage, piece, (i * BLOCK) as u32, block).unwrap();
        }
    }

    fn read(&self, storage: &StorageHandle, piece: u32, start: u32, length: u32) -> Result<Vec<u8>, StorageError> {
        let (result, handler) = slot();
        self.disk.async_read(
            storage,
            PeerRequest::new(piece, start, length),
            JobFlags::default(),
            handler,
        );
        self.disk.submit_jobs();
        self.wait(&result).map(|block| block.to_vec())
    }

    fn hash(&self, storage: &StorageHandle, piece: u32) -> Result<Vec<u8>, StorageError> {
        let (result, handler) = slot();
        self.disk
            .async_hash(storage, piece, JobFlags::default(), handler);
        self.disk.submit_jobs();
        self.wait(&result)
    }
}

#[test]
fn test_write_then_read_hits_cache() {
    let h = Harness::new(DiskSettings::default());
    let storage = h.torrent();
    let data = piece_data(0);

    h.write(&storage, 0, 0, &data[..BLOCK]).unwrap();
    let read = h.read(&storage, 0, 100, 1000).unwrap();
    assert_eq!(read, &data[100..1100]);

    let stats = h.disk.stats();
    assert_eq!(stats.read_hits, 1);
    assert_eq!(stats.blocks_read, 0);
    assert_eq!(stats.jobs_of(JobKind::Write), 1);
    assert_eq!(stats.jobs_of(JobKind::Read), 1);
}

#[test]
fn test_read_miss_goes_to_disk_then_hits() {
    let h = Harness::new(DiskSettings::default());
    let storage = h.disk.add_storage(ZeroStorage::new(PIECE_LEN as u32, PIECE_LEN as u64 * 2));

    let first = h.read(&storage, 1, 0, BLOCK as u32).unwrap();
    assert!(first.iter().all(|&b| b == 0));
    let again = h.read(&storage, 1, 0, BLOCK as u32).unwrap();
    assert_eq!(first, again);

    let stats = h.disk.stats();
    assert_eq!(stats.blocks_read, 1);
    assert_eq!(stats.read_hits, 1);
    assert_eq!(stats.cache.resident_blocks, 1);
}

#[test]
fn test_read_spanning_blocks_sees_dirty_data() {
    let h = Harness::new(DiskSettings::default());
    let storage = h.torrent();
    let data = piece_data(2);

    h.write(&storage, 2, BLOCK as u32, &data[BLOCK..]).unwrap();
    let (flushed, handler) = slot();
    h.disk.async_flush_piece(&storage, 2, handler);
    h.disk.submit_jobs();
    h.wait(&flushed).unwrap();
    assert!(h.disk.clear_piece(&storage, 2));

    // the first block is only in the write cache, the second only on disk
    let fresh = vec![0x5A; BLOCK];
    h.write(&storage, 2, 0, &fresh).unwrap();
    let read = h.read(&storage, 2, (BLOCK - 500) as u32, 1000).unwrap();
    assert_eq!(&read[..500], &fresh[..500]);
    assert_eq!(&read[500..], &data[BLOCK..BLOCK + 500]);
    assert_eq!(h.disk.stats().blocks_read, 1);
}

#[test]
fn test_read_rejects_bad_requests() {
    let h = Harness::new(DiskSettings::default());
    let storage = h.torrent();

    assert_eq!(
        h.read(&storage, 99, 0, 16),
        Err(StorageError::InvalidPieceIndex(99))
    );
    assert_eq!(
        h.read(&storage, 0, 0, 0),
        Err(StorageError::InvalidBlockOffset { piece: 0, offset: 0 })
    );
    assert!(matches!(
        h.read(&storage, 0, (PIECE_LEN - 10) as u32, 20),
        Err(StorageError::InvalidBlockOffset { piece: 0, .. })
    ));
    assert_eq!(h.disk.stats().failed_jobs, 3);
}

#[test]
fn test_hash_complete_piece_flushes_it() {
    let h = Harness::new(DiskSettings::default());
    let storage = h.torrent();
    let data = piece_data(0);

    h.write_piece(&storage, 0, &data);
    let digest = h.hash(&storage, 0).unwrap();
    assert_eq!(digest, sha1_of(&data));

    let on_disk = std::fs::read(h.temp.path().join("test.dat")).unwrap();
    assert_eq!(&on_disk[..PIECE_LEN], &data[..]);
    assert_eq!(h.disk.stats().blocks_written, 2);
}

#[test]
fn test_hash_reads_back_flushed_blocks() {
    let h = Harness::new(DiskSettings::default());
    let storage = h.torrent();
    let data = piece_data(1);

    h.write_piece(&storage, 1, &data);
    let (flushed, handler) = slot();
    h.disk.async_release_files(&storage, handler);
    h.disk.submit_jobs();
    h.wait(&flushed).unwrap();
    assert!(h.disk.clear_piece(&storage, 1));

    assert_eq!(h.hash(&storage, 1).unwrap(), sha1_of(&data));
    assert_eq!(h.disk.stats().read_back, 2);
}

#[test]
fn test_hash_mismatch_fails_and_piece_can_be_cleared() {
    let h = Harness::new(DiskSettings::default());
    let storage = h.torrent();

    h.write_piece(&storage, 1, &vec![0xAB; PIECE_LEN]);
    assert_eq!(h.hash(&storage, 1), Err(StorageError::HashMismatch(1)));
    assert!(h.disk.clear_piece(&storage, 1));
    assert!(h.disk.cache_info(Some(&storage)).is_empty());
}

#[test]
fn test_delete_runs_after_earlier_write() {
    let h = Harness::new(DiskSettings::default());
    let storage = h.torrent();
    let data = piece_data(0);
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut buffer = h.disk.allocate_buffer("test write", None).unwrap();
    buffer.fill_from(&data[..BLOCK]);
    let log = order.clone();
    h.disk
        .async_write(&storage, 0, 0, buffer, JobFlags::default(), move |r| {
            assert!(r.is_ok());
            log.lock().push("write");
        });
    let log = order.clone();
    h.disk.async_delete_files(&storage, move |r| {
        assert!(r.is_ok());
        log.lock().push("delete");
    });
    h.disk.submit_jobs();

    h.pump_until(|| order.lock().len() == 2);
    assert_eq!(*order.lock(), vec!["write", "delete"]);
    assert!(!h.temp.path().join("test.dat").exists());
    assert_eq!(h.disk.stats().cache.resident_blocks, 0);
}

#[test]
fn test_jobs_behind_fence_wait_for_its_completion() {
    let h = Harness::new(DiskSettings::default());
    let storage = h.torrent();
    let data = piece_data(3);
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut buffer = h.disk.allocate_buffer("test write", None).unwrap();
    buffer.fill_from(&data[BLOCK..]);
    let log = order.clone();
    h.disk.async_write(&storage, 3, BLOCK as u32, buffer, JobFlags::default(), move |_| {
        log.lock().push("write");
    });
    let log = order.clone();
    h.disk.async_release_files(&storage, move |_| log.lock().push("release"));
    let log = order.clone();
    let read = Arc::new(Mutex::new(Vec::new()));
    let sink = read.clone();
    h.disk.async_read(
        &storage,
        PeerRequest::new(3, BLOCK as u32, 64),
        JobFlags::default(),
        move |r| {
            if let Ok(block) = r {
                sink.lock().extend_from_slice(&block);
            }
            log.lock().push("read");
        },
    );
    h.disk.submit_jobs();

    h.pump_until(|| order.lock().len() == 3);
    assert_eq!(*order.lock(), vec!["write", "release", "read"]);
    assert_eq!(*read.lock(), &data[BLOCK..BLOCK + 64]);

    let on_disk = std::fs::read(h.temp.path().join("test.dat")).unwrap();
    let start = 3 * PIECE_LEN + BLOCK;
    assert_eq!(&on_disk[start..start + BLOCK], &data[BLOCK..]);
    assert!(h.disk.stats().fences_run >= 1);
}

#[test]
fn test_stop_torrent_drops_pending_hashes() {
    let h = Harness::new(DiskSettings::default());
    let storage = h.torrent();

    let (released, on_release) = slot();
    let (hashed, on_hash) = slot();
    let (stopped, on_stop) = slot();
    h.disk.async_release_files(&storage, on_release);
    h.disk.async_hash(&storage, 0, JobFlags::default(), on_hash);
    h.disk.async_stop_torrent(&storage, on_stop);
    h.disk.submit_jobs();

    assert_eq!(h.wait(&hashed), Err(StorageError::FencedOut(storage.id())));
    assert_eq!(h.wait(&released), Ok(()));
    assert_eq!(h.wait(&stopped), Ok(()));
    assert_eq!(h.disk.stats().jobs_of(JobKind::Hash), 0);
}

#[test]
fn test_move_rename_and_check() {
    let h = Harness::new(DiskSettings::default());
    let storage = h.torrent();
    let data = piece_data(0);
    h.write(&storage, 0, 0, &data[..BLOCK]).unwrap();

    let dest = h.temp.path().join("moved");
    let (moved, handler) = slot();
    h.disk
        .async_move_storage(&storage, dest.clone(), MoveFlags::AlwaysReplaceFiles, handler);
    h.disk.submit_jobs();
    assert_eq!(h.wait(&moved), Ok(dest.clone()));
    assert!(dest.join("test.dat").exists());

    let (renamed, handler) = slot();
    h.disk.async_rename_file(&storage, 0, "renamed.dat", handler);
    h.disk.submit_jobs();
    assert_eq!(h.wait(&renamed), Ok(()));
    assert!(dest.join("renamed.dat").exists());
    assert!(!dest.join("test.dat").exists());

    assert_eq!(h.read(&storage, 0, 0, 64).unwrap(), &data[..64]);

    let (checked, handler) = slot();
    let resume = ResumeData {
        file_sizes: vec![Some(1)],
    };
    h.disk.async_check_files(&storage, Some(resume), handler);
    h.disk.submit_jobs();
    assert_eq!(h.wait(&checked), Ok(CheckStatus::NeedFullCheck));
}

#[test]
fn test_flush_piece_and_file_priority() {
    let h = Harness::new(DiskSettings::default());
    let storage = h.torrent();
    let data = piece_data(2);
    h.write(&storage, 2, 0, &data[..BLOCK]).unwrap();
    assert_eq!(h.disk.stats().blocks_written, 0);

    let (flushed, handler) = slot();
    h.disk.async_flush_piece(&storage, 2, handler);
    let (prioritized, on_priority) = slot();
    h.disk.async_set_file_priority(&storage, vec![4], on_priority);
    h.disk.submit_jobs();
    assert_eq!(h.wait(&flushed), Ok(()));
    assert_eq!(h.wait(&prioritized), Ok(()));

    assert_eq!(h.disk.stats().blocks_written, 1);
    let on_disk = std::fs::read(h.temp.path().join("test.dat")).unwrap();
    assert_eq!(&on_disk[2 * PIECE_LEN..2 * PIECE_LEN + BLOCK], &data[..BLOCK]);
}

#[test]
fn test_clear_piece_job_discards_dirty_blocks() {
    let h = Harness::new(DiskSettings::default());
    let storage = h.torrent();
    h.write(&storage, 0, 0, &piece_data(0)[..BLOCK]).unwrap();

    let (cleared, handler) = slot();
    h.disk.async_clear_piece(&storage, 0, handler);
    h.disk.submit_jobs();
    assert_eq!(h.wait(&cleared), Ok(()));

    let stats = h.disk.stats();
    assert_eq!(stats.cache.dirty_blocks, 0);
    assert_eq!(stats.blocks_written, 0);
}

#[test]
fn test_exhausted_buffers_trim_cache_and_notify_observer() {
    let h = Harness::new(DiskSettings::default().with_cache_size(4));
    let storage = h.torrent();
    let flag = Arc::new(Flag::default());
    let observer: Arc<dyn DiskObserver> = flag.clone();

    for piece in 0..3 {
        let data = piece_data(piece);
        for (i, block) in data.chunks(BLOCK).enumerate() {
            let mut buffer = loop {
                match h.disk.allocate_buffer("test write", Some(&observer)) {
                    Ok(buffer) => break buffer,
                    Err(e) => {
                        assert_eq!(e, StorageError::BufferExhausted);
                        h.pump_until(|| flag.0.swap(false, Ordering::SeqCst));
                    }
                }
            };
            buffer.fill_from(block);
            let (written, handler) = slot();
            h.disk
                .async_write(&storage, piece, (i * BLOCK) as u32, buffer, JobFlags::default(), handler);
            h.disk.submit_jobs();
            assert_eq!(h.wait(&written), Ok(()));
        }
    }

    let stats = h.disk.stats();
    assert!(stats.cache.resident_blocks <= 4);
    assert_eq!(stats.buffer_limit, 4);
    for piece in 0..3 {
        assert_eq!(h.read(&storage, piece, 0, PIECE_LEN as u32).unwrap(), piece_data(piece));
    }
}

#[test]
fn test_abort_cancels_queued_and_later_jobs() {
    let h = Harness::new(DiskSettings::default());
    let storage = h.torrent();

    let (queued, handler) = slot();
    h.disk.async_hash(&storage, 0, JobFlags::default(), handler);
    h.disk.abort(true);
    assert_eq!(h.wait(&queued), Err(StorageError::Cancelled));

    let (late, handler) = slot();
    h.disk.async_flush_piece(&storage, 0, handler);
    h.disk.submit_jobs();
    assert_eq!(h.wait(&late), Err(StorageError::Cancelled));

    let stats = h.disk.stats();
    assert_eq!(stats.generic_threads, 0);
    assert_eq!(stats.hash_threads, 0);
}

#[test]
fn test_abort_flushes_write_cache() {
    let h = Harness::new(DiskSettings::default());
    let storage = h.torrent();
    let data = piece_data(1);
    h.write(&storage, 1, 0, &data[..BLOCK]).unwrap();

    h.disk.abort(true);
    let on_disk = std::fs::read(h.temp.path().join("test.dat")).unwrap();
    assert_eq!(&on_disk[PIECE_LEN..PIECE_LEN + BLOCK], &data[..BLOCK]);
    assert_eq!(h.disk.stats().cache.resident_blocks, 0);
}

#[test]
fn test_set_settings() {
    let h = Harness::new(DiskSettings::default());

    assert_eq!(
        h.disk
            .set_settings(DiskSettings::default().with_block_size(2 * BLOCK)),
        Err(SettingsError::BlockSizeFixed(BLOCK))
    );
    assert!(h
        .disk
        .set_settings(DiskSettings::default().with_cache_size(0))
        .is_err());

    let smaller = DiskSettings::default()
        .with_cache_size(8)
        .with_hashing_threads(PoolSettings::new(0, 0));
    h.disk.set_settings(smaller.clone()).unwrap();
    assert_eq!(h.disk.settings(), smaller);

    let stats = h.disk.stats();
    assert_eq!(stats.cache.capacity, 8);
    assert_eq!(stats.buffer_limit, 8);

    // hashes now run on the generic pool
    let storage = h.torrent();
    let data = piece_data(0);
    h.write_piece(&storage, 0, &data);
    assert_eq!(h.hash(&storage, 0).unwrap(), sha1_of(&data));
    assert_eq!(h.disk.stats().hash_threads, 0);
}

#[test]
fn test_new_rejects_invalid_settings() {
    let ctx = Arc::new(ManualContext::new());
    let result = DiskIoThread::new(DiskSettings::default().with_block_size(3), ctx);
    assert!(matches!(result, Err(SettingsError::InvalidBlockSize(3))));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tokio_context_delivers_completions() {
    let disk = DiskIoThread::new(DiskSettings::default(), Arc::new(TokioContext::current())).unwrap();
    let storage = disk.add_storage(ZeroStorage::new(PIECE_LEN as u32, PIECE_LEN as u64));

    let (tx, rx) = tokio::sync::oneshot::channel();
    disk.async_read(
        &storage,
        PeerRequest::new(0, 0, 128),
        JobFlags {
            force_copy: true,
            ..JobFlags::default()
        },
        move |result| {
            let _ = tx.send(result.map(|block| (block.len(), block.is_pinned())));
        },
    );
    disk.submit_jobs();

    let result = tokio::time::timeout(TIMEOUT, rx).await.unwrap().unwrap();
    assert_eq!(result, Ok((128, false)));
}
