//! Per-plane correction graph.
//!
//! A run is decomposed into independent `(channel, z)` tasks. Each task
//! reads one plane, applies the method, hands the result to a
//! [`PlaneSink`] and returns partial statistics; partials are combined with
//! an associative reduction so no task waits on any other.

use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use ndarray::{s, Array2, Array4};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde_json::{Map, Value};
use sparc_protocol::{ChannelSummary, QcMetrics};
use tracing::{debug, info};

use crate::error::{PreprocessError, Result};
use crate::method::{BackgroundMethod, MethodParams};
use crate::stats::RunningStats;
use crate::volume::{PlaneSource, Precision};

/// Background estimate and clipped difference for one plane.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrectedPlane {
    pub background: Array2<f64>,
    pub corrected: Array2<f64>,
}

/// One unit of work: output channel `channel` is computed from
/// `source_channel` of the input volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneTask {
    pub channel: usize,
    pub source_channel: usize,
    pub z: usize,
}

/// Destination for finished planes. Called concurrently from pool threads.
pub trait PlaneSink: Sync {
    fn write_plane(&self, task: &PlaneTask, plane: &CorrectedPlane) -> Result<()>;
}

/// Build the worker-local pool that executes plane tasks.
pub fn build_pool(threads: Option<usize>) -> Result<ThreadPool> {
    let pool = ThreadPoolBuilder::new()
        .num_threads(threads.unwrap_or(0))
        .thread_name(|i| format!("sparc-plane-{i}"))
        .build()?;
    Ok(pool)
}

#[derive(Debug, Clone)]
struct QcAccumulator {
    raw: RunningStats,
    background: RunningStats,
    corrected: RunningStats,
    per_channel: Vec<RunningStats>,
}

impl QcAccumulator {
    fn new(channels: usize) -> Self {
        Self {
            raw: RunningStats::new(),
            background: RunningStats::new(),
            corrected: RunningStats::new(),
            per_channel: vec![RunningStats::new(); channels],
        }
    }

    fn merge(self, other: QcAccumulator) -> QcAccumulator {
        QcAccumulator {
            raw: self.raw.merge(other.raw),
            background: self.background.merge(other.background),
            corrected: self.corrected.merge(other.corrected),
            per_channel: self
                .per_channel
                .into_iter()
                .zip(other.per_channel)
                .map(|(a, b)| a.merge(b))
                .collect(),
        }
    }

    fn finish(&self) -> QcMetrics {
        QcMetrics {
            raw: self.raw.finish(),
            background: self.background.finish(),
            corrected: self.corrected.finish(),
            per_channel: self
                .per_channel
                .iter()
                .enumerate()
                .map(|(channel_index, stats)| ChannelSummary {
                    channel_index,
                    stats: stats.finish(),
                })
                .collect(),
        }
    }
}

/// A validated correction run over a plane source.
pub struct CorrectionGraph<'a> {
    source: &'a dyn PlaneSource,
    params: MethodParams,
    channels: Vec<usize>,
    precision: Precision,
}

impl<'a> CorrectionGraph<'a> {
    /// `channels` selects input channels in output order; `None` keeps all.
    pub fn new(source: &'a dyn PlaneSource, params: MethodParams, channels: Option<&[usize]>) -> Result<Self> {
        let [available, _, _, _] = source.shape();
        let channels = match channels {
            Some([]) => return Err(PreprocessError::EmptyChannelSelection),
            Some(selection) => {
                if let Some(&index) = selection.iter().find(|&&c| c >= available) {
                    return Err(PreprocessError::ChannelOutOfRange { index, available });
                }
                selection.to_vec()
            }
            None => (0..available).collect(),
        };
        Ok(Self {
            source,
            params,
            channels,
            precision: Precision::for_input(source.pixel_type()),
        })
    }

    pub fn method(&self) -> BackgroundMethod {
        self.params.method()
    }

    pub fn params(&self) -> &MethodParams {
        &self.params
    }

    pub fn channels(&self) -> &[usize] {
        &self.channels
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    /// `[selected channels, z, y, x]`
    pub fn output_shape(&self) -> [usize; 4] {
        let [_, z, y, x] = self.source.shape();
        [self.channels.len(), z, y, x]
    }

    pub fn tasks(&self) -> Vec<PlaneTask> {
        let [_, depth, _, _] = self.source.shape();
        self.channels
            .iter()
            .enumerate()
            .flat_map(|(channel, &source_channel)| {
                (0..depth).map(move |z| PlaneTask {
                    channel,
                    source_channel,
                    z,
                })
            })
            .collect()
    }

    fn run_task(&self, task: &PlaneTask, sink: &(impl PlaneSink + ?Sized)) -> Result<QcAccumulator> {
        let raw = self.source.read_plane(task.source_channel, task.z)?;
        let mut plane = self.params.correct_plane(raw.view());
        if self.precision == Precision::F32 {
            let precision = self.precision;
            plane.background.mapv_inplace(|v| precision.round(v));
            plane.corrected.mapv_inplace(|v| precision.round(v));
        }
        sink.write_plane(task, &plane)?;

        let mut acc = QcAccumulator::new(self.channels.len());
        acc.raw.extend(raw.iter());
        acc.background.extend(plane.background.iter());
        let corrected = RunningStats::from_values(plane.corrected.iter());
        acc.corrected = corrected;
        acc.per_channel[task.channel] = corrected;
        Ok(acc)
    }

    /// Run every task on `pool`, streaming planes into `sink`.
    pub fn execute(&self, pool: &ThreadPool, sink: &(impl PlaneSink + ?Sized)) -> Result<QcMetrics> {
        let tasks = self.tasks();
        let started = Instant::now();
        debug!(
            method = %self.method(),
            tasks = tasks.len(),
            threads = pool.current_num_threads(),
            "Executing correction graph"
        );

        let channel_count = self.channels.len();
        let acc = pool.install(|| {
            tasks
                .par_iter()
                .map(|task| self.run_task(task, sink))
                .try_reduce(|| QcAccumulator::new(channel_count), |a, b| Ok(a.merge(b)))
        })?;

        info!(
            method = %self.method(),
            planes = tasks.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Correction graph finished"
        );
        Ok(acc.finish())
    }
}

/// Collects planes into dense arrays.
pub struct MemorySink {
    background: Mutex<Array4<f64>>,
    corrected: Mutex<Array4<f64>>,
}

impl MemorySink {
    pub fn new(shape: [usize; 4]) -> Self {
        let [c, z, y, x] = shape;
        Self {
            background: Mutex::new(Array4::zeros((c, z, y, x))),
            corrected: Mutex::new(Array4::zeros((c, z, y, x))),
        }
    }

    /// `(background, corrected)`
    pub fn into_arrays(self) -> (Array4<f64>, Array4<f64>) {
        (
            self.background.into_inner().unwrap_or_else(PoisonError::into_inner),
            self.corrected.into_inner().unwrap_or_else(PoisonError::into_inner),
        )
    }
}

impl PlaneSink for MemorySink {
    fn write_plane(&self, task: &PlaneTask, plane: &CorrectedPlane) -> Result<()> {
        self.background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .slice_mut(s![task.channel, task.z, .., ..])
            .assign(&plane.background);
        self.corrected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .slice_mut(s![task.channel, task.z, .., ..])
            .assign(&plane.corrected);
        Ok(())
    }
}

/// Fully materialized result of [`compute_background`].
#[derive(Debug, Clone)]
pub struct BackgroundComputation {
    pub background: Array4<f64>,
    pub corrected: Array4<f64>,
    pub precision: Precision,
    pub channels: Vec<usize>,
    pub qc_metrics: QcMetrics,
}

/// Run `method` over `source` and keep both outputs in memory.
///
/// Callers that persist results should drive [`CorrectionGraph::execute`]
/// with a store-backed sink instead.
pub fn compute_background(
    source: &dyn PlaneSource,
    method: &str,
    params: &Map<String, Value>,
    channels: Option<&[usize]>,
) -> Result<BackgroundComputation> {
    let method: BackgroundMethod = method.parse()?;
    let graph = CorrectionGraph::new(source, MethodParams::from_values(method, params), channels)?;
    let pool = build_pool(None)?;
    let sink = MemorySink::new(graph.output_shape());
    let qc_metrics = graph.execute(&pool, &sink)?;
    let (background, corrected) = sink.into_arrays();
    Ok(BackgroundComputation {
        background,
        corrected,
        precision: graph.precision(),
        channels: graph.channels().to_vec(),
        qc_metrics,
    })
}
