/// 分析工作线程 (Analysis Worker)
/// 职责: 接收节流后的帧 → 解码 → 分类 → 上报百分比
///
/// 投递端与工作线程之间是容量为1的邮箱: 槽位被占用时新帧替换旧帧,
/// 工作线程空闲后总是拿到最新的一帧。
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use tracing::{debug, info, warn};

use super::context::PipelineContext;
use super::reporter::{LatestPercentage, RatioReporter};
use crate::input::{Frame, FrameThrottle};

/// `submit` 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// 节流跳过
    Throttled,
    /// 放入空槽
    Queued,
    /// 替换了槽中尚未处理的旧帧
    Replaced { dropped_frame_id: u64 },
    /// 工作线程已停止
    Closed,
}

#[derive(Default)]
struct PipelineStats {
    submitted: AtomicU64,
    throttled: AtomicU64,
    replaced: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
}

/// 统计快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub submitted: u64,
    pub throttled: u64,
    pub replaced: u64,
    pub processed: u64,
    pub failed: u64,
}

impl PipelineStats {
    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            throttled: self.throttled.load(Ordering::Relaxed),
            replaced: self.replaced.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

pub struct FramePipeline {
    throttle: FrameThrottle,
    tx: Option<Sender<Frame>>,
    rx: Receiver<Frame>, // 投递端持有, 用于驱逐旧帧
    latest: LatestPercentage,
    stats: Arc<PipelineStats>,
    worker: Option<JoinHandle<()>>,
    closed: bool, // 工作线程已退出 (只记录一次日志)
}

impl FramePipeline {
    /// 启动工作线程
    pub fn spawn(
        context: PipelineContext,
        reporter: RatioReporter,
        throttle_interval: u32,
    ) -> std::io::Result<Self> {
        let (tx, rx) = crossbeam_channel::bounded::<Frame>(1);
        let latest = reporter.latest();
        let stats = Arc::new(PipelineStats::default());

        let worker = {
            let rx = rx.clone();
            let stats = stats.clone();
            std::thread::Builder::new()
                .name("redwatch-worker".into())
                .spawn(move || worker_loop(context, reporter, rx, stats))?
        };

        Ok(Self {
            throttle: FrameThrottle::new(throttle_interval),
            tx: Some(tx),
            rx,
            latest,
            stats,
            worker: Some(worker),
            closed: false,
        })
    }

    /// 投递一帧 (采集线程调用, 不阻塞)
    pub fn submit(&mut self, frame: Frame) -> SubmitOutcome {
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);

        let (counter, run) = self.throttle.tick();
        if !run {
            self.stats.throttled.fetch_add(1, Ordering::Relaxed);
            return SubmitOutcome::Throttled;
        }

        // 投递端自己持有接收端, 通道不会断开; 以线程是否结束为准
        if self.worker.as_ref().map_or(true, |w| w.is_finished()) {
            if !self.closed {
                self.closed = true;
                warn!(
                    frame_id = frame.frame_id,
                    "pipeline worker stopped, frames are no longer analyzed"
                );
            }
            return SubmitOutcome::Closed;
        }
        let Some(tx) = &self.tx else {
            return SubmitOutcome::Closed;
        };

        let mut frame = frame;
        let mut dropped = None;
        loop {
            match tx.try_send(frame) {
                Ok(()) => break,
                Err(TrySendError::Full(back)) => {
                    frame = back;
                    if let Ok(old) = self.rx.try_recv() {
                        self.stats.replaced.fetch_add(1, Ordering::Relaxed);
                        dropped = Some(old.frame_id);
                    }
                }
                Err(TrySendError::Disconnected(_)) => return SubmitOutcome::Closed,
            }
        }

        match dropped {
            Some(dropped_frame_id) => {
                debug!(counter, dropped_frame_id, "pending frame replaced");
                SubmitOutcome::Replaced { dropped_frame_id }
            }
            None => SubmitOutcome::Queued,
        }
    }

    pub fn latest(&self) -> LatestPercentage {
        self.latest.clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// 关闭邮箱, 等待工作线程处理完手头的帧后退出
    pub fn shutdown(mut self) -> StatsSnapshot {
        self.close();
        self.stats.snapshot()
    }

    fn close(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("pipeline worker panicked");
            }
        }
    }
}

impl Drop for FramePipeline {
    fn drop(&mut self) {
        self.close();
    }
}

fn worker_loop(
    mut context: PipelineContext,
    mut reporter: RatioReporter,
    rx: Receiver<Frame>,
    stats: Arc<PipelineStats>,
) {
    info!(backend = %context.backend(), "pipeline worker started");

    let mut window_start = Instant::now();
    let mut window_frames = 0u64;
    let mut window_busy = 0f64;

    for frame in rx.iter() {
        let frame_id = frame.frame_id;
        let start = Instant::now();

        match context.analyze(frame) {
            Ok(result) => {
                stats.processed.fetch_add(1, Ordering::Relaxed);
                if let Some(update) = reporter.report(frame_id, result, context.backend()) {
                    debug!(
                        frame_id,
                        percentage = update.percentage,
                        red = update.red_count,
                        total = update.total_count,
                        elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
                        "frame analyzed"
                    );
                }
            }
            Err(e) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(frame_id, "frame skipped: {}", e);
            }
        }

        window_frames += 1;
        window_busy += start.elapsed().as_secs_f64();

        // 每秒输出一次吞吐统计
        let elapsed = window_start.elapsed().as_secs_f64();
        if elapsed >= 1.0 {
            let snapshot = stats.snapshot();
            info!(
                fps = (window_frames as f64 / elapsed * 10.0).round() / 10.0,
                avg_ms = (window_busy * 1e5 / window_frames as f64).round() / 100.0,
                backend = %context.backend(),
                processed = snapshot.processed,
                replaced = snapshot.replaced,
                failed = snapshot.failed,
                "analysis throughput"
            );
            window_start = Instant::now();
            window_frames = 0;
            window_busy = 0.0;
        }
    }

    info!(
        decoded = context.decoder().decoded_frames(),
        "pipeline worker stopped"
    );
}
