/// 比例上报 (Ratio Reporter)
/// 职责: 分类结果 → 截断百分比 → 最新值句柄 + 订阅者
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Sender, TrySendError};
use tracing::{debug, trace};

use crate::analysis::{Backend, ClassificationResult};

/// 每个已处理帧的百分比更新
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PercentageUpdate {
    pub frame_id: u64,
    pub percentage: u8,
    pub red_count: u64,
    pub total_count: u64,
    pub backend: Backend,
}

/// 百分比订阅者, 每个已处理帧恰好通知一次
pub trait PercentageSubscriber: Send {
    fn on_percentage(&mut self, update: PercentageUpdate);
}

/// 跨线程订阅: 发送失败只丢弃这一条更新
impl PercentageSubscriber for Sender<PercentageUpdate> {
    fn on_percentage(&mut self, update: PercentageUpdate) {
        match self.try_send(update) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                trace!(frame_id = update.frame_id, "subscriber channel full, update dropped")
            }
            Err(TrySendError::Disconnected(_)) => {
                trace!(frame_id = update.frame_id, "subscriber gone")
            }
        }
    }
}

/// 尚未发布 (百分比字节不会是 0xFF)
const NO_VALUE: u64 = u64::MAX;

/// 最新百分比的共享只读句柄 (UI线程轮询)
///
/// 帧序号与百分比打包在同一个原子量里 (`frame_id << 8 | percentage`),
/// 读者总是看到成对的值。帧序号只保留低56位。
#[derive(Clone)]
pub struct LatestPercentage {
    inner: Arc<AtomicU64>,
}

impl LatestPercentage {
    fn new() -> Self {
        Self {
            inner: Arc::new(AtomicU64::new(NO_VALUE)),
        }
    }

    /// (帧序号, 百分比), 尚未处理任何帧时为 `None`
    pub fn snapshot(&self) -> Option<(u64, u8)> {
        match self.inner.load(Ordering::Acquire) {
            NO_VALUE => None,
            packed => Some((packed >> 8, packed as u8)),
        }
    }

    /// 尚未处理任何帧时为 `None`
    pub fn get(&self) -> Option<u8> {
        self.snapshot().map(|(_, percentage)| percentage)
    }

    /// 产生当前值的帧序号
    pub fn frame_id(&self) -> Option<u64> {
        self.snapshot().map(|(frame_id, _)| frame_id)
    }

    fn publish(&self, frame_id: u64, percentage: u8) {
        self.inner
            .store((frame_id << 8) | percentage as u64, Ordering::Release);
    }
}

impl std::fmt::Debug for LatestPercentage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("LatestPercentage").field(&self.get()).finish()
    }
}

pub struct RatioReporter {
    latest: LatestPercentage,
    last_frame_id: Option<u64>,
    subscribers: Vec<Box<dyn PercentageSubscriber>>,
}

impl RatioReporter {
    pub fn new() -> Self {
        Self {
            latest: LatestPercentage::new(),
            last_frame_id: None,
            subscribers: Vec::new(),
        }
    }

    pub fn latest(&self) -> LatestPercentage {
        self.latest.clone()
    }

    pub fn subscribe(&mut self, subscriber: Box<dyn PercentageSubscriber>) {
        self.subscribers.push(subscriber);
    }

    /// 上报一帧结果
    ///
    /// 帧序号不大于上一次上报的结果被丢弃, 返回 `None`。
    pub fn report(
        &mut self,
        frame_id: u64,
        result: ClassificationResult,
        backend: Backend,
    ) -> Option<PercentageUpdate> {
        if self.last_frame_id.is_some_and(|last| frame_id <= last) {
            debug!(frame_id, last = ?self.last_frame_id, "stale result discarded");
            return None;
        }
        self.last_frame_id = Some(frame_id);

        let update = PercentageUpdate {
            frame_id,
            percentage: result.percentage(),
            red_count: result.red_count(),
            total_count: result.total_count(),
            backend,
        };
        self.latest.publish(frame_id, update.percentage);
        for subscriber in &mut self.subscribers {
            subscriber.on_percentage(update);
        }
        Some(update)
    }
}

impl Default for RatioReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(red: u64, total: u64) -> ClassificationResult {
        ClassificationResult::new(red, total).unwrap()
    }

    #[test]
    fn test_latest_starts_empty() {
        let reporter = RatioReporter::new();
        assert_eq!(reporter.latest().get(), None);
        assert_eq!(reporter.latest().frame_id(), None);
    }

    #[test]
    fn test_report_publishes_truncated_percentage() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut reporter = RatioReporter::new();
        reporter.subscribe(Box::new(tx));
        let latest = reporter.latest();

        let update = reporter.report(7, result(2, 3), Backend::Scalar).unwrap();
        assert_eq!(update.percentage, 66);
        assert_eq!(latest.get(), Some(66));
        assert_eq!(latest.frame_id(), Some(7));
        assert_eq!(rx.try_recv().unwrap(), update);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_snapshot_pairs_id_with_value() {
        let mut reporter = RatioReporter::new();
        let latest = reporter.latest();
        assert_eq!(latest.snapshot(), None);

        let id = (1u64 << 40) + 3;
        reporter.report(id, result(1, 1), Backend::Scalar);
        assert_eq!(latest.snapshot(), Some((id, 100)));
        reporter.report(id + 1, result(0, 1), Backend::Scalar);
        assert_eq!(latest.snapshot(), Some((id + 1, 0)));
    }

    #[test]
    fn test_out_of_order_results_are_discarded() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut reporter = RatioReporter::new();
        reporter.subscribe(Box::new(tx));

        assert!(reporter.report(10, result(1, 1), Backend::Scalar).is_some());
        assert!(reporter.report(10, result(0, 1), Backend::Scalar).is_none());
        assert!(reporter.report(5, result(0, 1), Backend::Scalar).is_none());
        assert!(reporter.report(20, result(0, 1), Backend::Scalar).is_some());

        let ids: Vec<u64> = rx.try_iter().map(|u| u.frame_id).collect();
        assert_eq!(ids, vec![10, 20]);
        assert_eq!(reporter.latest().get(), Some(0));
    }

    #[test]
    fn test_dropped_subscriber_does_not_block_others() {
        let (gone_tx, gone_rx) = crossbeam_channel::bounded(1);
        drop(gone_rx);
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut reporter = RatioReporter::new();
        reporter.subscribe(Box::new(gone_tx));
        reporter.subscribe(Box::new(tx));

        reporter.report(0, result(1, 2), Backend::Simd);
        assert_eq!(rx.try_recv().unwrap().percentage, 50);
    }
}
