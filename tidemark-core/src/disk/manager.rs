//! Piece manager: the operation surface of one torrent's storage
//!
//! Every operation takes a completion that runs exactly once, on whichever
//! thread finishes the work. Reads and writes go straight to the executor.
//! Structural operations pass through the fence one at a time and claim the
//! slots they touch; I/O arriving for a claimed slot is parked until the
//! claim is released.
//!
//! One mutex guards all mutable state. It is never held while a job runs or
//! while a completion is invoked.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::config::DiskConfig;
use crate::executor::DiskExecutor;
use crate::storage::{
    BackendKind, FileOp, FileOpOutput, ResumeData, StorageBackend, StorageError, StorageMode,
    submit_file_op,
};
use crate::torrent::{PieceDigest, PieceIndex, PieceRequest, SlotIndex, TorrentLayout};

use super::cache::{CacheInfo, ReadCache};
use super::fence::{Claim, Fence, IoTracker};
use super::migrator::{MigrationStep, plan_next_step};
use super::resume::{ResumeVerdict, build_resume_data, compact_slot_count, verify_resume};
use super::scanner::{FullCheckScanner, ScanFailure, hash_slot};
use super::slot_table::SlotTable;
use super::{CheckState, DiskError, DiskOperation, DiskResult};

type Deferred = Box<dyn FnOnce() + Send>;

/// Digest of a piece as stored, and whether it is the expected one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashResult {
    pub digest: PieceDigest,
    pub valid: bool,
}

/// Result of `check_fastresume` or `check_files`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CheckOutcome {
    /// Pieces present and verified
    pub have: Vec<bool>,
    /// Pieces stored away from their home slot
    pub out_of_place: Vec<(PieceIndex, SlotIndex)>,
    /// Why resume data was not used, if it was offered or expected
    pub resume_rejection: Option<String>,
    /// Whether slots were hashed to build the table
    pub full_check: bool,
}

impl CheckOutcome {
    pub fn num_have(&self) -> usize {
        self.have.iter().filter(|&&have| have).count()
    }
}

/// A structural operation waiting for, or holding, the fence.
trait StructuralTask: Send {
    fn run(self: Box<Self>, manager: &Arc<PieceManager>);
    fn cancel(self: Box<Self>, error: DiskError);
}

struct Task<T, B, H> {
    body: B,
    handler: H,
    _output: PhantomData<fn() -> T>,
}

impl<T, B, H> StructuralTask for Task<T, B, H>
where
    T: 'static,
    B: FnOnce(&Arc<PieceManager>, H) + Send + 'static,
    H: FnOnce(DiskResult<T>) + Send + 'static,
{
    fn run(self: Box<Self>, manager: &Arc<PieceManager>) {
        let Task { body, handler, .. } = *self;
        body(manager, handler);
    }

    fn cancel(self: Box<Self>, error: DiskError) {
        let Task { handler, .. } = *self;
        handler(Err(error));
    }
}

struct ManagerState {
    table: SlotTable,
    have: Vec<bool>,
    check_state: CheckState,
    fence: Fence<Box<dyn StructuralTask>>,
    io: IoTracker,
    /// Continuation of a structural step waiting for its claim to go idle
    claim_waiter: Option<Deferred>,
    /// I/O parked behind the active claim
    deferred: VecDeque<Deferred>,
    cache: ReadCache,
    last_piece: Option<PieceIndex>,
    /// Abort flag of the admitted structural task
    cancel: Arc<AtomicBool>,
}

/// Maps pieces to slots for one torrent and drives its storage backend.
///
/// Created behind an `Arc`; operations hold a reference to the manager until
/// their completion has run. The layout is shared with the owner of the
/// torrent, which keeps it alive for as long as the manager exists.
pub struct PieceManager {
    layout: Arc<TorrentLayout>,
    backend: Arc<dyn StorageBackend>,
    executor: Arc<dyn DiskExecutor>,
    config: DiskConfig,
    state: Mutex<ManagerState>,
}

fn empty_table(layout: &TorrentLayout, config: &DiskConfig) -> SlotTable {
    SlotTable::new(
        config.storage_mode,
        layout.num_pieces(),
        compact_slot_count(layout, config),
        layout.has_short_last_piece(),
    )
}

fn write_request(piece: PieceIndex, offset: u32, len: usize) -> DiskResult<PieceRequest> {
    let length = u32::try_from(len).map_err(|_| DiskError::InvalidRequest {
        piece,
        offset,
        length: u32::MAX,
    })?;
    Ok(PieceRequest::new(piece, offset, length))
}

fn slice_request(data: &Bytes, request: &PieceRequest) -> Bytes {
    let start = (request.offset as usize).min(data.len());
    let end = (start + request.length as usize).min(data.len());
    data.slice(start..end)
}

impl PieceManager {
    /// Creates a manager with an empty table; run a check before trusting it.
    pub fn new(
        layout: Arc<TorrentLayout>,
        backend: Arc<dyn StorageBackend>,
        executor: Arc<dyn DiskExecutor>,
        config: DiskConfig,
    ) -> Arc<Self> {
        let state = ManagerState {
            table: empty_table(&layout, &config),
            have: vec![false; layout.num_pieces() as usize],
            check_state: CheckState::None,
            fence: Fence::new(),
            io: IoTracker::new(),
            claim_waiter: None,
            deferred: VecDeque::new(),
            cache: ReadCache::new(config.read_cache_pieces),
            last_piece: None,
            cancel: Arc::new(AtomicBool::new(false)),
        };

        Arc::new(Self {
            layout,
            backend,
            executor,
            config,
            state: Mutex::new(state),
        })
    }

    /// Creates a manager over a backend of `kind` rooted at `save_path`.
    pub fn open(
        layout: Arc<TorrentLayout>,
        save_path: PathBuf,
        kind: BackendKind,
        executor: Arc<dyn DiskExecutor>,
        config: DiskConfig,
    ) -> Arc<Self> {
        let backend = kind.build(Arc::clone(&layout), save_path, &config);
        Self::new(layout, backend, executor, config)
    }

    pub fn layout(&self) -> &Arc<TorrentLayout> {
        &self.layout
    }

    pub fn storage_mode(&self) -> StorageMode {
        self.config.storage_mode
    }

    pub fn check_state(&self) -> CheckState {
        self.state.lock().check_state
    }

    pub fn have_pieces(&self) -> Vec<bool> {
        self.state.lock().have.clone()
    }

    pub fn num_have(&self) -> usize {
        self.state.lock().have.iter().filter(|&&have| have).count()
    }

    pub fn slot_for(&self, piece: PieceIndex) -> Option<SlotIndex> {
        self.state.lock().table.lookup(piece)
    }

    pub fn piece_for(&self, slot: SlotIndex) -> Option<PieceIndex> {
        self.state.lock().table.slot_owner(slot)
    }

    /// Piece most recently read, written or hashed.
    pub fn last_piece(&self) -> Option<PieceIndex> {
        self.state.lock().last_piece
    }

    /// Whether a structural operation is running.
    pub fn has_fence(&self) -> bool {
        self.state.lock().fence.is_raised()
    }

    /// Copy of the current slot table.
    pub fn slot_table(&self) -> SlotTable {
        self.state.lock().table.clone()
    }

    /// Absolute content offset `offset` bytes into `piece` is stored at.
    ///
    /// # Errors
    ///
    /// - `DiskError::UnmappedPiece` - If the piece has no slot
    pub fn physical_offset(&self, piece: PieceIndex, offset: u32) -> DiskResult<u64> {
        let slot = self
            .slot_for(piece)
            .ok_or(DiskError::UnmappedPiece { piece })?;
        Ok(self.backend.physical_offset(slot, offset))
    }

    pub fn cache_info(&self) -> CacheInfo {
        self.state.lock().cache.info()
    }

    pub fn clear_read_cache(&self) {
        self.state.lock().cache.clear();
    }

    pub fn get_cache_info<F>(&self, handler: F)
    where
        F: FnOnce(DiskResult<CacheInfo>) + Send + 'static,
    {
        handler(Ok(self.cache_info()));
    }

    fn check_piece(&self, piece: PieceIndex) -> DiskResult<()> {
        if piece.as_u32() < self.layout.num_pieces() {
            Ok(())
        } else {
            Err(DiskError::InvalidRequest {
                piece,
                offset: 0,
                length: 0,
            })
        }
    }

    fn check_request(&self, request: &PieceRequest) -> DiskResult<()> {
        let valid = request.piece.as_u32() < self.layout.num_pieces()
            && request.length > 0
            && u64::from(request.offset) + u64::from(request.length)
                <= u64::from(self.layout.piece_size(request.piece));
        if valid {
            Ok(())
        } else {
            Err(DiskError::InvalidRequest {
                piece: request.piece,
                offset: request.offset,
                length: request.length,
            })
        }
    }

    fn end_io(&self, slot: SlotIndex) {
        let waiter = {
            let mut state = self.state.lock();
            state.io.end_io(slot);
            if state.io.claim_is_idle() {
                state.claim_waiter.take()
            } else {
                None
            }
        };
        if let Some(waiter) = waiter {
            waiter();
        }
    }

    /// Reads `request.length` bytes of a mapped piece.
    ///
    /// # Errors
    ///
    /// - `DiskError::InvalidRequest` - If the range is empty or leaves the piece
    /// - `DiskError::UnmappedPiece` - If the piece has no slot
    /// - `DiskError::FatalDisk` - If the backend read fails
    pub fn read<F>(self: &Arc<Self>, request: PieceRequest, handler: F)
    where
        F: FnOnce(DiskResult<Bytes>) + Send + 'static,
    {
        if let Err(error) = self.check_request(&request) {
            handler(Err(error));
            return;
        }

        let slot = {
            let mut state = self.state.lock();
            let Some(slot) = state.table.lookup(request.piece) else {
                drop(state);
                handler(Err(DiskError::UnmappedPiece {
                    piece: request.piece,
                }));
                return;
            };
            if state.io.is_claimed(slot) {
                let this = Arc::clone(self);
                state
                    .deferred
                    .push_back(Box::new(move || this.read(request, handler)));
                return;
            }
            state.last_piece = Some(request.piece);
            if let Some(data) = state.cache.get(request.piece) {
                drop(state);
                handler(Ok(slice_request(&data, &request)));
                return;
            }
            state.io.begin_io(slot);
            slot
        };

        let this = Arc::clone(self);
        let op = FileOp::Read {
            slot,
            offset: request.offset,
            length: request.length,
        };
        submit_file_op(
            Arc::clone(&self.backend),
            self.executor.as_ref(),
            op,
            move |result| {
                this.end_io(slot);
                handler(
                    result
                        .map(FileOpOutput::into_data)
                        .map_err(|source| this.io_failure(DiskOperation::Read, slot, source)),
                );
            },
        );
    }

    /// Writes `data` at `offset` within `piece`, allocating a slot on first write.
    ///
    /// # Errors
    ///
    /// - `DiskError::InvalidRequest` - If the data is empty or leaves the piece
    /// - `DiskError::NoSpace` - If compact mode has no slot left
    /// - `DiskError::FatalDisk` - If the backend write fails
    pub fn write<F>(self: &Arc<Self>, piece: PieceIndex, offset: u32, data: Bytes, handler: F)
    where
        F: FnOnce(DiskResult<usize>) + Send + 'static,
    {
        let request = match write_request(piece, offset, data.len()) {
            Ok(request) => request,
            Err(error) => {
                handler(Err(error));
                return;
            }
        };
        if let Err(error) = self.check_request(&request) {
            handler(Err(error));
            return;
        }

        let (slot, reserve) = {
            let mut state = self.state.lock();
            let (slot, reserve) = match state.table.lookup(piece) {
                Some(slot) => (slot, false),
                // Allocation could hand out a slot a structural step is about to use
                None if state.io.has_claim() => {
                    let this = Arc::clone(self);
                    state
                        .deferred
                        .push_back(Box::new(move || this.write(piece, offset, data, handler)));
                    return;
                }
                None => match state.table.allocate_slot_for(piece) {
                    Ok(allocation) => (allocation.slot, allocation.needs_reservation),
                    Err(error) => {
                        drop(state);
                        handler(Err(error.into()));
                        return;
                    }
                },
            };
            if state.io.is_claimed(slot) {
                let this = Arc::clone(self);
                state
                    .deferred
                    .push_back(Box::new(move || this.write(piece, offset, data, handler)));
                return;
            }
            state.cache.invalidate(piece);
            state.last_piece = Some(piece);
            state.io.begin_io(slot);
            (slot, reserve)
        };

        let this = Arc::clone(self);
        self.executor.submit(Box::new(move || {
            let reserved = if reserve {
                this.backend.allocate_slot(slot)
            } else {
                Ok(())
            };
            let result = reserved.and_then(|()| {
                FileOp::Write {
                    slot,
                    offset,
                    buffers: vec![data],
                }
                .perform(this.backend.as_ref())
            });
            this.end_io(slot);
            handler(
                result
                    .map(|output| output.bytes_transferred())
                    .map_err(|source| this.io_failure(DiskOperation::Write, slot, source)),
            );
        }));
    }

    /// Hashes a mapped piece as stored and records whether it verified.
    ///
    /// # Errors
    ///
    /// - `DiskError::UnmappedPiece` - If the piece has no slot
    /// - `DiskError::FatalDisk` - If the slot cannot be read
    pub fn hash_piece<F>(self: &Arc<Self>, piece: PieceIndex, handler: F)
    where
        F: FnOnce(DiskResult<HashResult>) + Send + 'static,
    {
        if let Err(error) = self.check_piece(piece) {
            handler(Err(error));
            return;
        }

        let slot = {
            let mut state = self.state.lock();
            let Some(slot) = state.table.lookup(piece) else {
                drop(state);
                handler(Err(DiskError::UnmappedPiece { piece }));
                return;
            };
            if state.io.is_claimed(slot) {
                let this = Arc::clone(self);
                state
                    .deferred
                    .push_back(Box::new(move || this.hash_piece(piece, handler)));
                return;
            }
            state.last_piece = Some(piece);
            state.io.begin_io(slot);
            slot
        };

        let this = Arc::clone(self);
        self.executor.submit(Box::new(move || {
            let length = this.layout.piece_size(piece) as usize;
            let mut buf = vec![0u8; this.config.hash_block_size.clamp(1, length)];
            let result = hash_slot(this.backend.as_ref(), slot, length, &mut buf, None);
            this.end_io(slot);
            handler(
                result
                    .map(|(digest, _)| this.record_hash(piece, digest))
                    .map_err(|source| this.io_failure(DiskOperation::Hash, slot, source)),
            );
        }));
    }

    /// Reads the whole piece, hashes it, and returns the requested range.
    ///
    /// A piece that verifies stays in the read cache.
    ///
    /// # Errors
    ///
    /// - `DiskError::InvalidRequest` - If the range is empty or leaves the piece
    /// - `DiskError::UnmappedPiece` - If the piece has no slot
    /// - `DiskError::FatalDisk` - If the backend read fails
    pub fn read_and_hash<F>(self: &Arc<Self>, request: PieceRequest, handler: F)
    where
        F: FnOnce(DiskResult<(Bytes, HashResult)>) + Send + 'static,
    {
        if let Err(error) = self.check_request(&request) {
            handler(Err(error));
            return;
        }

        let this = Arc::clone(self);
        self.fetch_piece(request.piece, move |result| {
            handler(result.map(|data| {
                let hash = this.record_hash(request.piece, PieceDigest::of(&data));
                if hash.valid {
                    this.state.lock().cache.insert(request.piece, data.clone());
                }
                (slice_request(&data, &request), hash)
            }));
        });
    }

    /// Loads a mapped piece into the read cache.
    ///
    /// # Errors
    ///
    /// - `DiskError::UnmappedPiece` - If the piece has no slot
    /// - `DiskError::FatalDisk` - If the backend read fails
    pub fn cache_piece<F>(self: &Arc<Self>, piece: PieceIndex, handler: F)
    where
        F: FnOnce(DiskResult<()>) + Send + 'static,
    {
        if let Err(error) = self.check_piece(piece) {
            handler(Err(error));
            return;
        }

        let this = Arc::clone(self);
        self.fetch_piece(piece, move |result| {
            handler(result.map(|data| this.state.lock().cache.insert(piece, data)));
        });
    }

    /// Whole content of a mapped piece, from the cache when present.
    fn fetch_piece<F>(self: &Arc<Self>, piece: PieceIndex, handler: F)
    where
        F: FnOnce(DiskResult<Bytes>) + Send + 'static,
    {
        let slot = {
            let mut state = self.state.lock();
            let Some(slot) = state.table.lookup(piece) else {
                drop(state);
                handler(Err(DiskError::UnmappedPiece { piece }));
                return;
            };
            if state.io.is_claimed(slot) {
                let this = Arc::clone(self);
                state
                    .deferred
                    .push_back(Box::new(move || this.fetch_piece(piece, handler)));
                return;
            }
            state.last_piece = Some(piece);
            if let Some(data) = state.cache.get(piece) {
                drop(state);
                handler(Ok(data));
                return;
            }
            state.io.begin_io(slot);
            slot
        };

        let this = Arc::clone(self);
        let op = FileOp::Read {
            slot,
            offset: 0,
            length: self.layout.piece_size(piece),
        };
        submit_file_op(
            Arc::clone(&self.backend),
            self.executor.as_ref(),
            op,
            move |result| {
                this.end_io(slot);
                handler(
                    result
                        .map(FileOpOutput::into_data)
                        .map_err(|source| this.io_failure(DiskOperation::Read, slot, source)),
                );
            },
        );
    }

    fn record_hash(&self, piece: PieceIndex, digest: PieceDigest) -> HashResult {
        let valid = self.layout.expected_digest(piece) == Some(&digest);
        if !valid {
            debug!("Piece {} failed hash check ({})", piece, digest);
        }
        self.state.lock().have[piece.as_usize()] = valid;
        HashResult { digest, valid }
    }

    fn io_failure(&self, operation: DiskOperation, slot: SlotIndex, source: StorageError) -> DiskError {
        warn!("Disk {} failed on {} at slot {}: {}", operation, self.layout.name(), slot, source);
        DiskError::fatal(operation, Some(slot), source)
    }

    // Structural operations.

    fn submit_structural<T, B, H>(self: &Arc<Self>, body: B, handler: H)
    where
        T: 'static,
        B: FnOnce(&Arc<PieceManager>, H) + Send + 'static,
        H: FnOnce(DiskResult<T>) + Send + 'static,
    {
        let task: Box<dyn StructuralTask> = Box::new(Task {
            body,
            handler,
            _output: PhantomData,
        });
        let ready = {
            let mut state = self.state.lock();
            let ready = state.fence.raise_or_queue(task);
            if ready.is_some() {
                state.cancel = Arc::new(AtomicBool::new(false));
            }
            ready
        };
        if let Some(task) = ready {
            task.run(self);
        }
    }

    fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.state.lock().cancel)
    }

    fn is_cancelled(&self) -> bool {
        self.state.lock().cancel.load(Ordering::Acquire)
    }

    /// Installs `claim` and runs `then` once no claimed slot has I/O in flight.
    fn acquire_claim<F>(&self, claim: Claim, then: F)
    where
        F: FnOnce() + Send + 'static,
    {
        Self::claim_locked(self.state.lock(), claim, then);
    }

    /// Installs `claim` within the caller's critical section.
    fn claim_locked<F>(mut state: MutexGuard<'_, ManagerState>, claim: Claim, then: F)
    where
        F: FnOnce() + Send + 'static,
    {
        state.io.set_claim(claim);
        if state.io.claim_is_idle() {
            drop(state);
            then();
        } else {
            state.claim_waiter = Some(Box::new(then));
        }
    }

    /// Drops the active claim and re-dispatches I/O parked behind it.
    fn release_claim(&self) {
        let deferred = {
            let mut state = self.state.lock();
            state.io.release_claim();
            state.claim_waiter = None;
            std::mem::take(&mut state.deferred)
        };
        for job in deferred {
            job();
        }
    }

    /// Completes the running structural task and admits the next one.
    fn finish_structural<T, H>(self: &Arc<Self>, handler: H, result: DiskResult<T>)
    where
        H: FnOnce(DiskResult<T>),
    {
        self.release_claim();
        handler(result);

        let next = {
            let mut state = self.state.lock();
            let next = state.fence.lower();
            if next.is_some() {
                state.cancel = Arc::new(AtomicBool::new(false));
            }
            next
        };
        if let Some(task) = next {
            task.run(self);
        }
    }

    /// Runs `work` on the executor with every slot claimed.
    fn run_exclusive<T, W, H>(self: &Arc<Self>, work: W, handler: H)
    where
        T: 'static,
        W: FnOnce(&PieceManager) -> DiskResult<T> + Send + 'static,
        H: FnOnce(DiskResult<T>) + Send + 'static,
    {
        self.submit_structural(
            move |manager: &Arc<PieceManager>, handler: H| {
                let this = Arc::clone(manager);
                manager.acquire_claim(Claim::Exclusive, move || {
                    let job_manager = Arc::clone(&this);
                    this.executor.submit(Box::new(move || {
                        let result = work(job_manager.as_ref());
                        job_manager.finish_structural(handler, result);
                    }));
                });
            },
            handler,
        );
    }

    fn initialize_storage(&self) -> DiskResult<()> {
        let allocate_now = self.config.allocate_files && self.config.storage_mode == StorageMode::Full;
        self.backend
            .initialize(allocate_now)
            .map_err(|source| DiskError::fatal(DiskOperation::Initialize, None, source))
    }

    fn install(&self, table: SlotTable, have: Vec<bool>, check_state: CheckState) {
        let mut state = self.state.lock();
        state.table = table;
        state.have = have;
        state.check_state = check_state;
        state.cache.clear();
    }

    /// Establishes the slot table from `resume`, falling back to a full check.
    ///
    /// Without resume data, or with a record that does not match the files,
    /// storage that holds no files starts empty. Otherwise a full check runs
    /// when `DiskConfig::auto_full_check` is set. In compact mode with
    /// `DiskConfig::auto_migrate`, out-of-place pieces are migrated after the
    /// check completes.
    ///
    /// # Errors
    ///
    /// - `DiskError::NeedFullCheck` - If the record was rejected and automatic checks are off
    /// - `DiskError::Aborted` - If `abort` was called during the full check
    /// - `DiskError::FatalDisk` - If file metadata or a slot cannot be read
    pub fn check_fastresume<F>(self: &Arc<Self>, resume: Option<ResumeData>, handler: F)
    where
        F: FnOnce(DiskResult<CheckOutcome>) + Send + 'static,
    {
        self.submit_check(move |manager| manager.run_fastresume_check(resume.as_ref()), handler);
    }

    /// Rebuilds the slot table by hashing every slot.
    ///
    /// # Errors
    ///
    /// - `DiskError::Aborted` - If `abort` was called during the check
    /// - `DiskError::FatalDisk` - If a slot cannot be read; pieces found
    ///   before the failure stay mapped
    pub fn check_files<F>(self: &Arc<Self>, handler: F)
    where
        F: FnOnce(DiskResult<CheckOutcome>) + Send + 'static,
    {
        self.submit_check(PieceManager::run_full_check, handler);
    }

    fn submit_check<W, H>(self: &Arc<Self>, check: W, handler: H)
    where
        W: FnOnce(&PieceManager) -> DiskResult<CheckOutcome> + Send + 'static,
        H: FnOnce(DiskResult<CheckOutcome>) + Send + 'static,
    {
        self.submit_structural(
            move |manager: &Arc<PieceManager>, handler: H| {
                let this = Arc::clone(manager);
                manager.acquire_claim(Claim::Exclusive, move || {
                    let job_manager = Arc::clone(&this);
                    this.executor.submit(Box::new(move || {
                        let result = check(job_manager.as_ref());
                        job_manager.complete_check(handler, result);
                    }));
                });
            },
            handler,
        );
    }

    fn run_fastresume_check(&self, resume: Option<&ResumeData>) -> DiskResult<CheckOutcome> {
        let verdict = match resume {
            Some(resume) => verify_resume(&self.layout, &self.config, self.backend.as_ref(), resume)
                .map_err(|source| DiskError::fatal(DiskOperation::VerifyResume, None, source))?,
            None => ResumeVerdict::Rejected {
                reason: "no resume data".to_string(),
            },
        };

        let reason = match verdict {
            ResumeVerdict::Accepted { table, have } => {
                self.initialize_storage()?;
                let out_of_place = table.out_of_place();
                let check_state = if out_of_place.is_empty() {
                    CheckState::Finished
                } else {
                    CheckState::ExpandPieces
                };
                debug!(
                    "Resume data accepted for {}: {} pieces, {} out of place",
                    self.layout.name(),
                    have.iter().filter(|&&have| have).count(),
                    out_of_place.len()
                );
                self.install(table, have.clone(), check_state);
                return Ok(CheckOutcome {
                    have,
                    out_of_place,
                    resume_rejection: None,
                    full_check: false,
                });
            }
            ResumeVerdict::Rejected { reason } => reason,
        };

        let has_files = self
            .backend
            .has_any_file()
            .map_err(|source| DiskError::fatal(DiskOperation::VerifyResume, None, source))?;
        if !has_files {
            debug!("No files on disk for {}, starting empty", self.layout.name());
            self.initialize_storage()?;
            let have = vec![false; self.layout.num_pieces() as usize];
            self.install(empty_table(&self.layout, &self.config), have.clone(), CheckState::Finished);
            return Ok(CheckOutcome {
                have,
                out_of_place: Vec::new(),
                resume_rejection: Some(reason),
                full_check: false,
            });
        }

        if !self.config.auto_full_check {
            return Err(DiskError::NeedFullCheck { reason });
        }

        let mut outcome = self.run_full_check()?;
        outcome.resume_rejection = Some(reason);
        Ok(outcome)
    }

    fn run_full_check(&self) -> DiskResult<CheckOutcome> {
        self.state.lock().check_state = CheckState::FullCheck;
        let cancel = self.cancel_flag();

        let scanner = FullCheckScanner::new(
            &self.layout,
            self.backend.as_ref(),
            self.config.storage_mode,
            compact_slot_count(&self.layout, &self.config),
            self.config.hash_block_size,
            cancel.as_ref(),
        );

        match scanner.scan() {
            Ok(report) => {
                let check_state = if self.config.storage_mode == StorageMode::Compact
                    && !report.out_of_place.is_empty()
                {
                    CheckState::ExpandPieces
                } else {
                    CheckState::Finished
                };
                self.install(report.table, report.have.clone(), check_state);
                self.initialize_storage()?;
                Ok(CheckOutcome {
                    have: report.have,
                    out_of_place: report.out_of_place,
                    resume_rejection: None,
                    full_check: true,
                })
            }
            Err(ScanFailure { report, error }) => {
                // Pieces found before the failure remain readable
                self.install(report.table, report.have, CheckState::None);
                Err(error)
            }
        }
    }

    fn complete_check<H>(self: &Arc<Self>, handler: H, result: DiskResult<CheckOutcome>)
    where
        H: FnOnce(DiskResult<CheckOutcome>) + Send + 'static,
    {
        let needs_migration = self.config.storage_mode == StorageMode::Compact
            && self.config.auto_migrate
            && result
                .as_ref()
                .is_ok_and(|outcome| !outcome.out_of_place.is_empty());
        if needs_migration && self.is_cancelled() {
            debug!("Skipping automatic migration of {} after abort", self.layout.name());
        } else if needs_migration {
            // Queued behind the fence this check still holds
            self.migrate(|result| match result {
                Ok(steps) => debug!("Automatic migration finished after {} steps", steps),
                Err(error) => warn!("Automatic migration failed: {}", error),
            });
        }
        self.finish_structural(handler, result);
    }

    /// Moves every out-of-place piece to its home slot.
    ///
    /// Completes with the number of steps performed. Steps claim only the
    /// slots they relocate, so I/O on other slots continues meanwhile. A
    /// no-op in full mode.
    ///
    /// # Errors
    ///
    /// - `DiskError::Aborted` - If `abort` was called between steps
    /// - `DiskError::FatalDisk` - If a relocation fails; the pieces it
    ///   involved lose their slot and must be downloaded again
    pub fn migrate<F>(self: &Arc<Self>, handler: F)
    where
        F: FnOnce(DiskResult<u32>) + Send + 'static,
    {
        self.submit_structural(
            |manager: &Arc<PieceManager>, handler: F| {
                if manager.config.storage_mode == StorageMode::Full {
                    manager.finish_structural(handler, Ok(0));
                    return;
                }
                manager.migration_step(0, handler);
            },
            handler,
        );
    }

    fn migration_step<H>(self: &Arc<Self>, completed: u32, handler: H)
    where
        H: FnOnce(DiskResult<u32>) + Send + 'static,
    {
        if self.is_cancelled() {
            debug!("Migration of {} aborted after {} steps", self.layout.name(), completed);
            self.finish_structural(handler, Err(DiskError::Aborted));
            return;
        }

        // Planned and claimed under one lock so no write can allocate a planned slot
        let mut state = self.state.lock();
        let Some(step) = plan_next_step(&state.table) else {
            if state.check_state == CheckState::ExpandPieces {
                state.check_state = CheckState::Finished;
            }
            drop(state);
            debug!("Migration of {} finished after {} steps", self.layout.name(), completed);
            self.finish_structural(handler, Ok(completed));
            return;
        };
        state.check_state = CheckState::ExpandPieces;

        let this = Arc::clone(self);
        Self::claim_locked(state, Claim::slots(step.slots()), move || {
            let job_manager = Arc::clone(&this);
            this.executor.submit(Box::new(move || {
                let moved = step.apply_storage(job_manager.backend.as_ref());
                match job_manager.commit_step(step, moved) {
                    Ok(()) => {
                        job_manager.release_claim();
                        job_manager.migration_step(completed + 1, handler);
                    }
                    Err(error) => job_manager.finish_structural(handler, Err(error)),
                }
            }));
        });
    }

    fn commit_step(&self, step: MigrationStep, moved: Result<(), StorageError>) -> DiskResult<()> {
        let mut state = self.state.lock();
        for piece in step.pieces(&state.table) {
            state.cache.invalidate(piece);
        }

        let slots = step.slots();
        let result = moved
            .map_err(|source| DiskError::fatal(DiskOperation::Migrate, slots.first().copied(), source))
            .and_then(|()| step.apply_table(&mut state.table).map_err(DiskError::from));
        match result {
            Ok(()) => {
                debug!("Migration step done: {:?}", step);
                Ok(())
            }
            Err(error) => {
                // Slot contents no longer match the table; drop every piece involved
                warn!("Migration step {:?} failed: {}", step, error);
                for &slot in &slots {
                    if let Ok(Some(piece)) = state.table.release_slot(slot) {
                        state.have[piece.as_usize()] = false;
                    }
                }
                Err(error)
            }
        }
    }

    /// Forgets a piece that failed verification so it is downloaded again.
    ///
    /// In compact mode its slot returns to the free pool.
    pub fn mark_failed<F>(self: &Arc<Self>, piece: PieceIndex, handler: F)
    where
        F: FnOnce(DiskResult<()>) + Send + 'static,
    {
        if let Err(error) = self.check_piece(piece) {
            handler(Err(error));
            return;
        }

        self.submit_structural(
            move |manager: &Arc<PieceManager>, handler: F| {
                let slot = manager.slot_for(piece);
                let claim = Claim::slots(slot);
                let this = Arc::clone(manager);
                manager.acquire_claim(claim, move || {
                    {
                        let mut state = this.state.lock();
                        state.have[piece.as_usize()] = false;
                        state.cache.invalidate(piece);
                        if let Some(slot) = slot {
                            if let Err(error) = state.table.release_slot(slot) {
                                debug!("Releasing slot {} of failed piece {}: {}", slot, piece, error);
                            }
                        }
                    }
                    this.finish_structural(handler, Ok(()));
                });
            },
            handler,
        );
    }

    /// Renames file `index` to `new_name`, relative to the save path.
    ///
    /// # Errors
    ///
    /// - `DiskError::FatalDisk` - If the file cannot be renamed
    pub fn rename_file<F>(self: &Arc<Self>, index: usize, new_name: PathBuf, handler: F)
    where
        F: FnOnce(DiskResult<()>) + Send + 'static,
    {
        self.run_exclusive(
            move |manager| {
                manager
                    .backend
                    .rename_file(index, &new_name)
                    .map_err(|source| DiskError::fatal(DiskOperation::RenameFile, None, source))
            },
            handler,
        );
    }

    /// Moves all files below `new_path`.
    ///
    /// # Errors
    ///
    /// - `DiskError::FatalDisk` - If a file cannot be moved; files already
    ///   moved are put back
    pub fn move_storage<F>(self: &Arc<Self>, new_path: PathBuf, handler: F)
    where
        F: FnOnce(DiskResult<()>) + Send + 'static,
    {
        self.run_exclusive(
            move |manager| {
                manager
                    .backend
                    .move_storage(&new_path)
                    .map_err(|source| DiskError::fatal(DiskOperation::MoveStorage, None, source))
            },
            handler,
        );
    }

    pub fn release_files<F>(self: &Arc<Self>, handler: F)
    where
        F: FnOnce(DiskResult<()>) + Send + 'static,
    {
        self.run_exclusive(
            |manager| {
                manager
                    .backend
                    .release_files()
                    .map_err(|source| DiskError::fatal(DiskOperation::ReleaseFiles, None, source))
            },
            handler,
        );
    }

    /// Removes every file and resets the table, have set and cache.
    ///
    /// # Errors
    ///
    /// - `DiskError::FatalDisk` - If a file cannot be removed
    pub fn delete_files<F>(self: &Arc<Self>, handler: F)
    where
        F: FnOnce(DiskResult<()>) + Send + 'static,
    {
        self.run_exclusive(
            |manager| {
                let result = manager
                    .backend
                    .delete_files()
                    .map_err(|source| DiskError::fatal(DiskOperation::DeleteFiles, None, source));
                let have = vec![false; manager.layout.num_pieces() as usize];
                manager.install(empty_table(&manager.layout, &manager.config), have, CheckState::None);
                result
            },
            handler,
        );
    }

    /// Snapshot of the table, have set and file fingerprints.
    ///
    /// # Errors
    ///
    /// - `DiskError::FatalDisk` - If file metadata cannot be read
    pub fn save_resume_data<F>(self: &Arc<Self>, handler: F)
    where
        F: FnOnce(DiskResult<ResumeData>) + Send + 'static,
    {
        self.run_exclusive(
            |manager| {
                let (table, have) = {
                    let state = manager.state.lock();
                    (state.table.clone(), state.have.clone())
                };
                build_resume_data(&manager.layout, &table, &have, manager.backend.as_ref())
                    .map_err(|source| DiskError::fatal(DiskOperation::SaveResume, None, source))
            },
            handler,
        );
    }

    pub fn finalize_file<F>(self: &Arc<Self>, index: usize, handler: F)
    where
        F: FnOnce(DiskResult<()>) + Send + 'static,
    {
        self.run_exclusive(
            move |manager| {
                manager
                    .backend
                    .finalize_file(index)
                    .map_err(|source| DiskError::fatal(DiskOperation::FinalizeFile, None, source))
            },
            handler,
        );
    }

    /// Stops a running check or migration at the next slot boundary and
    /// cancels queued structural operations with `DiskError::Aborted`.
    ///
    /// Backend I/O already submitted runs to completion.
    pub fn abort(&self) {
        let cancelled = {
            let mut state = self.state.lock();
            state.cancel.store(true, Ordering::Release);
            state.fence.drain()
        };
        if !cancelled.is_empty() {
            debug!(
                "Abort cancelled {} queued operations for {}",
                cancelled.len(),
                self.layout.name()
            );
        }
        for task in cancelled {
            task.cancel(DiskError::Aborted);
        }
    }
}
