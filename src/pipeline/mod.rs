/// 帧处理流水线 (Frame Processing Pipeline)
///
/// 两线程架构:
/// - 采集线程: `FramePipeline::submit` 节流后投递到单槽邮箱, 从不阻塞
/// - 工作线程: 独占 `PipelineContext`, 解码 → 分类 → 上报, 一次一帧
pub mod context;
pub mod reporter;
pub mod worker;

pub use context::PipelineContext;
pub use reporter::{LatestPercentage, PercentageSubscriber, PercentageUpdate, RatioReporter};
pub use worker::{FramePipeline, StatsSnapshot, SubmitOutcome};
