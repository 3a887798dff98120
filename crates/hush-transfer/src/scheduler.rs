//! Adaptive multipart upload scheduler.
//!
//! A block is one cipher chunk. Every part request carries a whole number of
//! blocks; after each acknowledged request the number of blocks per part is
//! steered towards the target request duration using an exponential moving
//! average with a dead band and a per-step ratio clamp.
//!
//! Measured durations are normalised to the current block count before they
//! enter the average (parts issued before a resize carry the old count), and
//! the average is rescaled whenever the block count changes.

use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{FuturesUnordered, StreamExt};
use hush_core::config::TransferConfig;
use hush_core::FinalizedTransfer;
use hush_crypto::ChunkReader;
use hush_storage::{StoreResult, TransferStore, UploadId};
use tokio::io::AsyncRead;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SchedulerError;

/// Progress callback type (bytes_done, bytes_total, message)
pub type ProgressFn = Box<dyn Fn(u64, u64, &str) + Send + Sync>;

/// EMA weight of the newest sample
const ALPHA: f64 = 0.5;
/// Relative band around the target in which the block count is left alone
const DEAD_BAND: f64 = 0.10;
const MIN_STEP_RATIO: f64 = 0.5;
const MAX_STEP_RATIO: f64 = 2.0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleParams {
    pub initial_blocks: u32,
    pub max_blocks: u32,
    pub max_parallelism: usize,
    pub target: Duration,
    /// Largest part a single request may carry
    pub max_part_bytes: u64,
}

impl ScheduleParams {
    pub fn from_config(cfg: &TransferConfig) -> Self {
        Self {
            initial_blocks: cfg.initial_multipart_read_blocks,
            max_blocks: cfg.maximum_multipart_read_blocks,
            max_parallelism: cfg.maximum_multipart_parallelism,
            target: Duration::from_millis(cfg.target_multipart_upload_milliseconds),
            max_part_bytes: cfg.upload_buffer_bytes(),
        }
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.max_blocks == 0 || self.initial_blocks == 0 {
            return Err(SchedulerError::InvalidParams(
                "block counts must be at least 1".into(),
            ));
        }
        if self.max_parallelism == 0 {
            return Err(SchedulerError::InvalidParams(
                "parallelism must be at least 1".into(),
            ));
        }
        if self.target.is_zero() {
            return Err(SchedulerError::InvalidParams("target must be positive".into()));
        }
        if self.max_part_bytes == 0 {
            return Err(SchedulerError::InvalidParams(
                "part size limit must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ScheduleParams {
    fn default() -> Self {
        Self::from_config(&TransferConfig::default())
    }
}

/// Per-upload controller state
#[derive(Debug, Clone)]
pub struct UploadScheduleState {
    current_blocks: u32,
    smoothed_ms: Option<f64>,
    target_ms: f64,
    min_blocks: u32,
    max_blocks: u32,
}

impl UploadScheduleState {
    /// `chunk_size` is the ciphertext size of a full block; it caps the
    /// block count so a part never exceeds `max_part_bytes`.
    pub fn new(params: &ScheduleParams, chunk_size: u64) -> Self {
        let byte_cap = (params.max_part_bytes / chunk_size.max(1)).max(1);
        let max_blocks = u64::from(params.max_blocks.max(1)).min(byte_cap) as u32;
        Self {
            current_blocks: params.initial_blocks.clamp(1, max_blocks),
            smoothed_ms: None,
            target_ms: params.target.as_secs_f64() * 1000.0,
            min_blocks: 1,
            max_blocks,
        }
    }

    pub fn current_blocks(&self) -> u32 {
        self.current_blocks
    }

    pub fn max_blocks(&self) -> u32 {
        self.max_blocks
    }

    /// Smoothed request duration at the current block count
    pub fn smoothed_ms(&self) -> Option<f64> {
        self.smoothed_ms
    }

    /// Feed one completed request that carried `part_blocks` blocks and
    /// return the block count for the next part.
    pub fn record(&mut self, elapsed: Duration, part_blocks: u32) -> u32 {
        if part_blocks == 0 {
            return self.current_blocks;
        }
        let current = f64::from(self.current_blocks);
        let measured = elapsed.as_secs_f64() * 1000.0 * current / f64::from(part_blocks);
        let smoothed = match self.smoothed_ms {
            None => measured,
            Some(prev) => ALPHA * measured + (1.0 - ALPHA) * prev,
        };

        let low = self.target_ms * (1.0 - DEAD_BAND);
        let high = self.target_ms * (1.0 + DEAD_BAND);
        let next = if smoothed < low || smoothed > high {
            let ratio = (self.target_ms / smoothed).clamp(MIN_STEP_RATIO, MAX_STEP_RATIO);
            (current * ratio)
                .round()
                .clamp(f64::from(self.min_blocks), f64::from(self.max_blocks)) as u32
        } else {
            self.current_blocks
        };

        self.smoothed_ms = Some(smoothed * f64::from(next) / current);
        if next != self.current_blocks {
            debug!(
                from = self.current_blocks,
                to = next,
                smoothed_ms = smoothed,
                "resizing parts"
            );
        }
        self.current_blocks = next;
        next
    }
}

/// Ciphertext chunks in stream order
#[async_trait]
pub trait ChunkSource: Send {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, SchedulerError>;

    /// Size of every chunk but the last
    fn chunk_size(&self) -> u64;

    fn total_size(&self) -> u64;
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> ChunkSource for ChunkReader<R> {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, SchedulerError> {
        match ChunkReader::next_chunk(self).await {
            Ok(chunk) => Ok(chunk.map(|(bytes, _)| Bytes::from(bytes))),
            Err(e) => Err(SchedulerError::Source(e.to_string())),
        }
    }

    fn chunk_size(&self) -> u64 {
        ChunkReader::chunk_size(self) as u64
    }

    fn total_size(&self) -> u64 {
        ChunkReader::total_size(self)
    }
}

/// Outcome of a finalized multipart upload
#[derive(Debug, Clone)]
pub struct UploadSummary {
    pub finalized: FinalizedTransfer,
    pub parts: u64,
    pub bytes: u64,
    /// Blocks per part when the upload finished
    pub final_blocks: u32,
    pub peak_in_flight: usize,
}

pub struct MultipartScheduler {
    params: ScheduleParams,
    progress: Option<ProgressFn>,
}

impl MultipartScheduler {
    pub fn new(params: ScheduleParams) -> Self {
        Self {
            params,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn params(&self) -> &ScheduleParams {
        &self.params
    }

    /// Upload every chunk of `source` as parts of `upload` and finalize.
    ///
    /// On any failure or cancellation the session is aborted and nothing is
    /// finalized.
    pub async fn upload<S, C>(
        &self,
        store: &S,
        upload: &UploadId,
        source: &mut C,
        cancel: &CancellationToken,
    ) -> Result<UploadSummary, SchedulerError>
    where
        S: TransferStore + ?Sized,
        C: ChunkSource + ?Sized,
    {
        match self.run(store, upload, source, cancel).await {
            Ok(summary) => {
                info!(
                    upload = %upload,
                    parts = summary.parts,
                    bytes = summary.bytes,
                    final_blocks = summary.final_blocks,
                    "multipart upload finalized"
                );
                Ok(summary)
            }
            Err(e) => {
                warn!(upload = %upload, error = %e, "multipart upload failed, aborting");
                if let Err(abort_err) = store.abort_upload(upload).await {
                    warn!(upload = %upload, error = %abort_err, "abort failed");
                }
                Err(e)
            }
        }
    }

    async fn run<S, C>(
        &self,
        store: &S,
        upload: &UploadId,
        source: &mut C,
        cancel: &CancellationToken,
    ) -> Result<UploadSummary, SchedulerError>
    where
        S: TransferStore + ?Sized,
        C: ChunkSource + ?Sized,
    {
        self.params.validate()?;

        let chunk_size = source.chunk_size().max(1);
        let total = source.total_size();
        let mut state = UploadScheduleState::new(&self.params, chunk_size);
        let mut in_flight = FuturesUnordered::new();

        let mut pending = source.next_chunk().await?;
        let mut exhausted = pending.is_none();
        let mut next_index = 0u64;
        let mut acked_bytes = 0u64;
        let mut peak_in_flight = 0usize;

        loop {
            if !exhausted && in_flight.len() < self.params.max_parallelism {
                let blocks = state.current_blocks();
                // Parts already issued keep making progress while this one
                // is read from the source.
                let (bytes, count) = {
                    let assemble = assemble_part(
                        &mut *source,
                        &mut pending,
                        blocks,
                        self.params.max_part_bytes,
                    );
                    tokio::pin!(assemble);
                    loop {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return Err(SchedulerError::Cancelled),
                            Some(done) = in_flight.next() => {
                                self.acknowledge(done, &mut state, &mut acked_bytes, total)?;
                            }
                            assembled = &mut assemble => break assembled?,
                        }
                    }
                };

                let last = pending.is_none();
                exhausted = last;
                let index = next_index;
                next_index += 1;
                let len = bytes.len() as u64;

                in_flight.push(async move {
                    let started = Instant::now();
                    let result = store.upload_part(upload, index, bytes, last).await;
                    PartOutcome {
                        index,
                        blocks: count,
                        bytes: len,
                        elapsed: started.elapsed(),
                        result,
                    }
                });
                peak_in_flight = peak_in_flight.max(in_flight.len());
                continue;
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(upload = %upload, in_flight = in_flight.len(), "upload cancelled");
                    return Err(SchedulerError::Cancelled);
                }
                Some(done) = in_flight.next() => {
                    self.acknowledge(done, &mut state, &mut acked_bytes, total)?;
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(SchedulerError::Cancelled);
        }

        let finalized = store
            .finalize_upload(upload)
            .await
            .map_err(SchedulerError::Finalize)?;

        Ok(UploadSummary {
            finalized,
            parts: next_index,
            bytes: acked_bytes,
            final_blocks: state.current_blocks(),
            peak_in_flight,
        })
    }

    fn acknowledge(
        &self,
        done: PartOutcome,
        state: &mut UploadScheduleState,
        acked_bytes: &mut u64,
        total: u64,
    ) -> Result<(), SchedulerError> {
        let PartOutcome {
            index,
            blocks,
            bytes,
            elapsed,
            result,
        } = done;
        result.map_err(|source| SchedulerError::Part { index, source })?;
        *acked_bytes += bytes;
        state.record(elapsed, blocks);
        debug!(
            index,
            blocks,
            bytes,
            elapsed_ms = elapsed.as_millis() as u64,
            next_blocks = state.current_blocks(),
            "part acknowledged"
        );
        if let Some(progress) = &self.progress {
            progress(*acked_bytes, total, &format!("part {index}"));
        }
        Ok(())
    }
}

struct PartOutcome {
    index: u64,
    blocks: u32,
    bytes: u64,
    elapsed: Duration,
    result: StoreResult<()>,
}

/// Pull whole chunks from `source` into one part of at most `blocks` chunks
/// and `max_part_bytes` bytes. A single chunk always fits. The chunk that
/// would overflow the part is left in `pending`.
async fn assemble_part<C: ChunkSource + ?Sized>(
    source: &mut C,
    pending: &mut Option<Bytes>,
    blocks: u32,
    max_part_bytes: u64,
) -> Result<(Bytes, u32), SchedulerError> {
    let mut part = BytesMut::new();
    let mut count = 0u32;
    while let Some(chunk) = pending.take() {
        let over_budget = part.len() as u64 + chunk.len() as u64 > max_part_bytes;
        if count > 0 && (count >= blocks || over_budget) {
            *pending = Some(chunk);
            break;
        }
        part.extend_from_slice(&chunk);
        count += 1;
        *pending = source.next_chunk().await?;
    }
    Ok((part.freeze(), count))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use hush_core::TransferEnvelope;
    use hush_storage::{PartStream, StoreError, StoreResult};
    use proptest::prelude::*;
    use uuid::Uuid;

    use super::*;

    struct MemoryChunks {
        chunks: std::vec::IntoIter<Bytes>,
        chunk_size: u64,
        total: u64,
    }

    impl MemoryChunks {
        fn uniform(count: usize, chunk_size: usize) -> Self {
            let chunks: Vec<Bytes> = (0..count)
                .map(|i| Bytes::from(vec![(i % 251) as u8; chunk_size]))
                .collect();
            Self {
                total: (count * chunk_size) as u64,
                chunks: chunks.into_iter(),
                chunk_size: chunk_size as u64,
            }
        }
    }

    #[async_trait]
    impl ChunkSource for MemoryChunks {
        async fn next_chunk(&mut self) -> Result<Option<Bytes>, SchedulerError> {
            Ok(self.chunks.next())
        }

        fn chunk_size(&self) -> u64 {
            self.chunk_size
        }

        fn total_size(&self) -> u64 {
            self.total
        }
    }

    #[derive(Default)]
    struct MockStore {
        chunk_size: u64,
        latency_per_block: Duration,
        fail_at: Option<u64>,
        cancel_at: Option<(u64, CancellationToken)>,
        parts: Mutex<Vec<(u64, u64, bool)>>,
        started: AtomicUsize,
        active: AtomicUsize,
        peak: AtomicUsize,
        finalized: AtomicUsize,
        aborted: AtomicUsize,
    }

    impl MockStore {
        fn new(chunk_size: u64, latency_per_block: Duration) -> Self {
            Self {
                chunk_size,
                latency_per_block,
                ..Default::default()
            }
        }

        fn recorded(&self) -> Vec<(u64, u64, bool)> {
            let mut parts = self.parts.lock().unwrap().clone();
            parts.sort_by_key(|(index, _, _)| *index);
            parts
        }
    }

    #[async_trait]
    impl TransferStore for MockStore {
        async fn begin_upload(&self, envelope: &TransferEnvelope) -> StoreResult<UploadId> {
            Ok(UploadId {
                transfer_id: envelope.id,
                session: Uuid::new_v4(),
            })
        }

        async fn upload_part(
            &self,
            _upload: &UploadId,
            index: u64,
            bytes: Bytes,
            last: bool,
        ) -> StoreResult<()> {
            self.started.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let blocks = (bytes.len() as u64).div_ceil(self.chunk_size.max(1)) as u32;
            tokio::time::sleep(self.latency_per_block * blocks).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            if let Some((at, token)) = &self.cancel_at {
                if *at == index {
                    token.cancel();
                }
            }
            if self.fail_at == Some(index) {
                return Err(StoreError::InvalidUpload(format!("part {index} rejected")));
            }
            self.parts
                .lock()
                .unwrap()
                .push((index, bytes.len() as u64, last));
            Ok(())
        }

        async fn finalize_upload(&self, upload: &UploadId) -> StoreResult<FinalizedTransfer> {
            self.finalized.fetch_add(1, Ordering::SeqCst);
            let parts = self.recorded();
            Ok(FinalizedTransfer {
                transfer_id: upload.transfer_id,
                expires_at: 0,
                ciphertext_size: parts.iter().map(|(_, len, _)| len).sum(),
                parts: parts.len() as u64,
            })
        }

        async fn abort_upload(&self, _upload: &UploadId) -> StoreResult<()> {
            self.aborted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn fetch_preview(&self, transfer_id: Uuid) -> StoreResult<TransferEnvelope> {
            Err(StoreError::NotFound(transfer_id))
        }

        async fn fetch_parts(&self, transfer_id: Uuid) -> StoreResult<PartStream> {
            Err(StoreError::NotFound(transfer_id))
        }

        async fn delete(&self, _transfer_id: Uuid) -> StoreResult<()> {
            Ok(())
        }
    }

    /// Chunks that take a while to produce, noting how many part uploads had
    /// started by the time each one was ready.
    struct SlowChunks {
        inner: MemoryChunks,
        delay: Duration,
        store: Arc<MockStore>,
        started_at_read: Vec<usize>,
    }

    #[async_trait]
    impl ChunkSource for SlowChunks {
        async fn next_chunk(&mut self) -> Result<Option<Bytes>, SchedulerError> {
            tokio::time::sleep(self.delay).await;
            self.started_at_read
                .push(self.store.started.load(Ordering::SeqCst));
            self.inner.next_chunk().await
        }

        fn chunk_size(&self) -> u64 {
            self.inner.chunk_size()
        }

        fn total_size(&self) -> u64 {
            self.inner.total_size()
        }
    }

    fn upload_id() -> UploadId {
        UploadId {
            transfer_id: Uuid::new_v4(),
            session: Uuid::new_v4(),
        }
    }

    fn params(initial: u32, max: u32, parallelism: usize, target_ms: u64) -> ScheduleParams {
        ScheduleParams {
            initial_blocks: initial,
            max_blocks: max,
            max_parallelism: parallelism,
            target: Duration::from_millis(target_ms),
            max_part_bytes: 64 * 1024 * 1024,
        }
    }

    #[test]
    fn test_state_respects_byte_cap() {
        let mut p = params(8, 64, 4, 2000);
        p.max_part_bytes = 10_000;
        let state = UploadScheduleState::new(&p, 3_000);
        assert_eq!(state.max_blocks(), 3);
        assert_eq!(state.current_blocks(), 3);
    }

    #[test]
    fn test_oversize_chunk_still_gets_one_block() {
        let mut p = params(4, 64, 4, 2000);
        p.max_part_bytes = 100;
        let state = UploadScheduleState::new(&p, 1_000);
        assert_eq!(state.max_blocks(), 1);
        assert_eq!(state.current_blocks(), 1);
    }

    #[test]
    fn test_record_grows_at_most_double() {
        let mut state = UploadScheduleState::new(&params(4, 64, 4, 2000), 1000);
        assert_eq!(state.record(Duration::from_millis(10), 4), 8);
        assert_eq!(state.record(Duration::from_millis(10), 8), 16);
    }

    #[test]
    fn test_record_shrinks_at_most_half() {
        let mut state = UploadScheduleState::new(&params(32, 64, 4, 2000), 1000);
        assert_eq!(state.record(Duration::from_secs(60), 32), 16);
    }

    #[test]
    fn test_dead_band_holds_steady() {
        let mut state = UploadScheduleState::new(&params(10, 64, 4, 2000), 1000);
        assert_eq!(state.record(Duration::from_millis(2150), 10), 10);
        assert_eq!(state.record(Duration::from_millis(1850), 10), 10);
    }

    #[test]
    fn test_first_sample_seeds_average() {
        let mut state = UploadScheduleState::new(&params(10, 64, 4, 2000), 1000);
        state.record(Duration::from_millis(2000), 10);
        let smoothed = state.smoothed_ms().unwrap();
        assert!((smoothed - 2000.0).abs() < 1e-6);
    }

    #[test]
    fn test_stale_part_is_normalised() {
        let mut state = UploadScheduleState::new(&params(4, 64, 4, 2000), 1000);
        state.record(Duration::from_millis(400), 4);
        assert_eq!(state.current_blocks(), 8);
        // a part issued before the resize, still at 100ms per block
        state.record(Duration::from_millis(400), 4);
        assert_eq!(state.current_blocks(), 16);
    }

    #[test]
    fn test_invalid_params_rejected() {
        assert!(params(0, 4, 1, 10).validate().is_err());
        assert!(params(1, 4, 0, 10).validate().is_err());
        assert!(params(1, 4, 1, 0).validate().is_err());
        assert!(params(1, 4, 1, 10).validate().is_ok());
    }

    proptest! {
        #[test]
        fn prop_blocks_stay_in_bounds(
            initial in 1u32..100,
            max in 1u32..100,
            samples in proptest::collection::vec((0u64..120_000, 1u32..200), 1..50),
        ) {
            let mut state = UploadScheduleState::new(&params(initial, max, 4, 2000), 1000);
            prop_assert!(state.current_blocks() >= 1 && state.current_blocks() <= max);
            let mut previous = state.current_blocks();
            for (ms, blocks) in samples {
                let next = state.record(Duration::from_millis(ms), blocks);
                prop_assert!(next >= 1 && next <= state.max_blocks());
                prop_assert!(next <= previous * 2);
                prop_assert!(2 * next + 1 >= previous);
                previous = next;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_converges_to_target() {
        let store = MockStore::new(1000, Duration::from_millis(100));
        let mut source = MemoryChunks::uniform(400, 1000);
        let scheduler = MultipartScheduler::new(params(4, 64, 4, 2000));

        let summary = scheduler
            .upload(&store, &upload_id(), &mut source, &CancellationToken::new())
            .await
            .unwrap();

        assert!(
            (18..=22).contains(&summary.final_blocks),
            "final blocks {}",
            summary.final_blocks
        );
        assert_eq!(summary.bytes, 400_000);
        assert_eq!(store.finalized.load(Ordering::SeqCst), 1);
        assert_eq!(store.aborted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_bounded_by_parallelism() {
        let store = MockStore::new(1000, Duration::from_millis(50));
        let mut source = MemoryChunks::uniform(120, 1000);
        let scheduler = MultipartScheduler::new(params(2, 8, 3, 2000));

        let summary = scheduler
            .upload(&store, &upload_id(), &mut source, &CancellationToken::new())
            .await
            .unwrap();

        assert!(summary.peak_in_flight <= 3);
        assert!(store.peak.load(Ordering::SeqCst) <= 3);
        assert!(store.peak.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parts_are_contiguous_and_last_is_flagged() {
        let store = MockStore::new(1000, Duration::from_millis(10));
        let mut source = MemoryChunks::uniform(37, 1000);
        let scheduler = MultipartScheduler::new(params(3, 8, 4, 2000));

        let summary = scheduler
            .upload(&store, &upload_id(), &mut source, &CancellationToken::new())
            .await
            .unwrap();

        let parts = store.recorded();
        assert_eq!(parts.len() as u64, summary.parts);
        for (expected, (index, len, _)) in parts.iter().enumerate() {
            assert_eq!(*index, expected as u64);
            assert_eq!(len % 1000, 0, "parts never split a chunk");
        }
        let flagged: Vec<_> = parts.iter().filter(|(_, _, last)| *last).collect();
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].0, summary.parts - 1);
        assert_eq!(summary.finalized.ciphertext_size, 37_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_chunk_upload() {
        let store = MockStore::new(1000, Duration::from_millis(10));
        let mut source = MemoryChunks::uniform(1, 20);
        let scheduler = MultipartScheduler::new(params(4, 8, 4, 2000));

        let summary = scheduler
            .upload(&store, &upload_id(), &mut source, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.parts, 1);
        assert_eq!(store.recorded(), vec![(0, 20, true)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_byte_cap_sends_one_chunk_per_part() {
        let store = MockStore::new(1000, Duration::from_millis(10));
        let mut source = MemoryChunks::uniform(5, 1000);
        let mut p = params(4, 8, 2, 2000);
        p.max_part_bytes = 1500;

        let summary = MultipartScheduler::new(p)
            .upload(&store, &upload_id(), &mut source, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.parts, 5);
        assert!(store.recorded().iter().all(|(_, len, _)| *len == 1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_part_failure_aborts_without_finalize() {
        let mut store = MockStore::new(1000, Duration::from_millis(10));
        store.fail_at = Some(2);
        let mut source = MemoryChunks::uniform(50, 1000);
        let scheduler = MultipartScheduler::new(params(2, 8, 2, 2000));

        let err = scheduler
            .upload(&store, &upload_id(), &mut source, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, SchedulerError::Part { index: 2, .. }));
        assert_eq!(store.aborted.load(Ordering::SeqCst), 1);
        assert_eq!(store.finalized.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_upload_aborts() {
        let token = CancellationToken::new();
        let mut store = MockStore::new(1000, Duration::from_millis(10));
        store.cancel_at = Some((1, token.clone()));
        let mut source = MemoryChunks::uniform(200, 1000);
        let scheduler = MultipartScheduler::new(params(1, 1, 1, 2000));

        let err = scheduler
            .upload(&store, &upload_id(), &mut source, &token)
            .await
            .unwrap_err();

        assert!(matches!(err, SchedulerError::Cancelled));
        assert_eq!(store.aborted.load(Ordering::SeqCst), 1);
        assert_eq!(store.finalized.load(Ordering::SeqCst), 0);
        assert!(store.recorded().len() < 200);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let token = CancellationToken::new();
        token.cancel();
        let store = MockStore::new(1000, Duration::ZERO);
        let mut source = MemoryChunks::uniform(3, 1000);

        let err = MultipartScheduler::new(params(1, 4, 2, 2000))
            .upload(&store, &upload_id(), &mut source, &token)
            .await
            .unwrap_err();

        assert!(matches!(err, SchedulerError::Cancelled));
        assert!(store.recorded().is_empty());
        assert_eq!(store.aborted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_reports_acknowledged_bytes() {
        let store = MockStore::new(1000, Duration::from_millis(10));
        let mut source = MemoryChunks::uniform(10, 1000);
        let seen = std::sync::Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        MultipartScheduler::new(params(2, 4, 2, 2000))
            .with_progress(Box::new(move |done, total, _| {
                sink.lock().unwrap().push((done, total));
            }))
            .upload(&store, &upload_id(), &mut source, &CancellationToken::new())
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.last(), Some(&(10_000, 10_000)));
        assert!(seen.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_issued_parts_upload_while_source_is_read() {
        let store = Arc::new(MockStore::new(1000, Duration::from_millis(10)));
        let mut source = SlowChunks {
            inner: MemoryChunks::uniform(12, 1000),
            delay: Duration::from_millis(100),
            store: store.clone(),
            started_at_read: Vec::new(),
        };
        let scheduler = MultipartScheduler::new(params(1, 1, 4, 2000));

        let summary = scheduler
            .upload(&*store, &upload_id(), &mut source, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.parts, 12);
        // part 0 is issued once chunk 1 is read; it must be running before
        // the parts behind it have been assembled
        assert!(source.started_at_read[2] >= 1, "{:?}", source.started_at_read);
        assert!(summary.peak_in_flight < 4);
        assert_eq!(store.recorded().len(), 12);
        assert_eq!(store.finalized.load(Ordering::SeqCst), 1);
    }
}
