//! Concurrent extract-and-match over several frame producers.
//!
//! All producers for a request are launched before any output is read, so
//! the expensive decode/seek work runs in parallel. Bitmaps are then decoded
//! in request order and each pairwise comparison is dispatched to the
//! blocking pool the moment both of its frames are available.

use std::fmt;
use std::sync::Arc;

use coersion_common::config::FfmpegConfig;
use coersion_common::frame::FrameRequest;
use tokio::task::JoinError;
use tracing::{debug, info};

use crate::bitmap::{BitmapDecoder, DecodeError};
use crate::compare::{compare, CompareError};
use crate::group::TaskGroup;
use crate::pixel::{MatchResult, PixelGrid};
use crate::task::{FrameJob, FrameProcess, FrameTask, TaskError};

/// Two frame indices within one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pair(pub usize, pub usize);

impl Pair {
    /// The later of the two frames; the pair can run once it is decoded.
    fn ready_after(self) -> usize {
        self.0.max(self.1)
    }
}

impl fmt::Display for Pair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} and {}", self.0, self.1)
    }
}

const PAIR_01: Pair = Pair(0, 1);
const PAIR_12: Pair = Pair(1, 2);
const PAIR_20: Pair = Pair(2, 0);

/// Results of a three-way match over the cyclic pairing 0-1, 1-2, 2-0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComparisonSet {
    pub pair01: MatchResult,
    pub pair12: MatchResult,
    pub pair20: MatchResult,
}

impl ComparisonSet {
    pub fn pairs(&self) -> [(Pair, MatchResult); 3] {
        [
            (PAIR_01, self.pair01),
            (PAIR_12, self.pair12),
            (PAIR_20, self.pair20),
        ]
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MatchError {
    #[error("frame {index}: {source}")]
    Launch {
        index: usize,
        #[source]
        source: TaskError,
    },
    #[error("frame {index}: {source}")]
    Process {
        index: usize,
        #[source]
        source: TaskError,
    },
    #[error("frame {index}: failed to decode bitmap: {source}")]
    Decode {
        index: usize,
        #[source]
        source: DecodeError,
    },
    #[error("frames {pair}: {source}")]
    Compare {
        pair: Pair,
        #[source]
        source: CompareError,
    },
    #[error("comparison task failed: {0}")]
    Join(#[from] JoinError),
}

impl MatchError {
    /// Index of the frame that caused the failure, if a single frame did.
    pub fn frame_index(&self) -> Option<usize> {
        match self {
            MatchError::Launch { index, .. }
            | MatchError::Process { index, .. }
            | MatchError::Decode { index, .. } => Some(*index),
            MatchError::Compare { .. } | MatchError::Join(_) => None,
        }
    }
}

/// Producers launched for one request, in request order.
///
/// Any process still held when this is dropped (an error path, or the caller
/// abandoning the future) is detached so it can finish and be reaped.
struct InFlight {
    processes: Vec<Option<FrameProcess>>,
    next: usize,
}

impl InFlight {
    fn start(requests: &[FrameRequest], config: &FfmpegConfig) -> Result<Self, MatchError> {
        let mut flight = InFlight {
            processes: Vec::with_capacity(requests.len()),
            next: 0,
        };
        for (index, request) in requests.iter().enumerate() {
            let task = FrameTask::new(FrameJob::bitmap(request.clone()), config);
            let process = task
                .start()
                .map_err(|source| MatchError::Launch { index, source })?;
            flight.processes.push(Some(process));
        }
        Ok(flight)
    }

    fn next(&mut self) -> Option<(usize, FrameProcess)> {
        let index = self.next;
        let process = self.processes.get_mut(index)?.take()?;
        self.next += 1;
        Some((index, process))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        for process in self.processes.iter_mut().filter_map(Option::take) {
            debug!(source = process.source(), pid = process.id(), "detaching frame producer");
            process.detach();
        }
    }
}

/// Read one producer's bitmap and reap the process.
///
/// Anything the producer writes after the pixel data is read and discarded
/// so it can exit normally. A producer that died is reported as a process
/// failure even though the decoder saw the stream end first.
async fn fetch_grid(
    index: usize,
    mut process: FrameProcess,
    request: &FrameRequest,
) -> Result<PixelGrid, MatchError> {
    let mut stdout = process
        .take_output()
        .map_err(|source| MatchError::Process { index, source })?;
    let (width, height) = request.dimensions();
    let decoded = BitmapDecoder::new(&mut stdout)
        .expect_dimensions(width, height)
        .decode()
        .await;
    if decoded.is_ok() {
        match tokio::io::copy(&mut stdout, &mut tokio::io::sink()).await {
            Ok(0) => {}
            Ok(trailing) => debug!(index, trailing, "discarded bytes after bitmap"),
            Err(e) => debug!(index, error = %e, "failed to drain producer output"),
        }
    }
    drop(stdout);
    let exited = process.wait().await;

    match (decoded, exited) {
        (Ok(grid), Ok(_)) => Ok(grid),
        (Ok(_), Err(source)) => Err(MatchError::Process { index, source }),
        (Err(decode), Err(source)) if decode.is_truncation() => {
            Err(MatchError::Process { index, source })
        }
        (Err(source), _) => Err(MatchError::Decode { index, source }),
    }
}

/// Runs frame extraction and comparison against one producer configuration.
#[derive(Debug, Clone)]
pub struct FramePipeline {
    config: FfmpegConfig,
}

impl FramePipeline {
    pub fn new(config: FfmpegConfig) -> Self {
        Self { config }
    }

    /// Run one producer to completion and return its raw output.
    pub async fn extract(&self, job: FrameJob) -> Result<Vec<u8>, TaskError> {
        let bytes = FrameTask::new(job, &self.config).start()?.output().await?;
        debug!(bytes = bytes.len(), "frame extracted");
        Ok(bytes)
    }

    /// Extract and decode a single frame.
    pub async fn pixels(&self, request: &FrameRequest) -> Result<PixelGrid, MatchError> {
        let process = FrameTask::new(FrameJob::bitmap(request.clone()), &self.config)
            .start()
            .map_err(|source| MatchError::Launch { index: 0, source })?;
        fetch_grid(0, process, request).await
    }

    pub async fn match_two(
        &self,
        first: &FrameRequest,
        second: &FrameRequest,
        tolerance: u16,
    ) -> Result<MatchResult, MatchError> {
        let requests = [first.clone(), second.clone()];
        let results = self.run(&requests, &[PAIR_01], tolerance).await?;
        Ok(results[0])
    }

    /// Compare three frames pairwise. The 0-1 comparison starts as soon as
    /// frames 0 and 1 are decoded, overlapping with the decode of frame 2.
    pub async fn match_three(
        &self,
        first: &FrameRequest,
        second: &FrameRequest,
        third: &FrameRequest,
        tolerance: u16,
    ) -> Result<ComparisonSet, MatchError> {
        let requests = [first.clone(), second.clone(), third.clone()];
        let results = self
            .run(&requests, &[PAIR_01, PAIR_12, PAIR_20], tolerance)
            .await?;
        Ok(ComparisonSet {
            pair01: results[0],
            pair12: results[1],
            pair20: results[2],
        })
    }

    /// Launch every producer, decode frames in order, dispatch each pair as
    /// soon as its later frame is ready, then join. Results follow `pairs`.
    async fn run(
        &self,
        requests: &[FrameRequest],
        pairs: &[Pair],
        tolerance: u16,
    ) -> Result<Vec<MatchResult>, MatchError> {
        let mut flight = InFlight::start(requests, &self.config)?;
        let mut grids: Vec<Arc<PixelGrid>> = Vec::with_capacity(requests.len());
        let mut group = TaskGroup::new();
        let mut dispatched = Vec::with_capacity(pairs.len());

        while let Some((index, process)) = flight.next() {
            let grid = fetch_grid(index, process, &requests[index]).await?;
            debug!(index, width = grid.width(), height = grid.height(), "frame decoded");
            grids.push(Arc::new(grid));

            for (at, &pair) in pairs.iter().enumerate() {
                if pair.ready_after() != index {
                    continue;
                }
                let a = Arc::clone(&grids[pair.0]);
                let b = Arc::clone(&grids[pair.1]);
                group.spawn_blocking(move || {
                    compare(&a, &b, tolerance).map_err(|source| MatchError::Compare { pair, source })
                });
                dispatched.push(at);
                debug!(%pair, "comparison dispatched");
            }
        }

        let mut results = vec![MatchResult::default(); pairs.len()];
        for (at, outcome) in dispatched.into_iter().zip(group.join().await?) {
            results[at] = outcome?;
        }

        info!(
            frames = requests.len(),
            comparisons = results.len(),
            tolerance,
            "match complete"
        );
        Ok(results)
    }
}
