//! 实时红色像素占比分析 (Live red-pixel ratio)
//!
//! 采集帧 → 节流 → 解码为RGBA8 → 逐像素红色判定 (标量/AVX2/GPU) → 百分比 → 订阅者/报警

pub mod alarm; // 报警触发
pub mod analysis; // 红色判定与计数
pub mod config; // 流水线配置
pub mod error; // 错误类型
pub mod input; // 帧/解码/帧源
pub mod pipeline; // 工作线程与上报

pub use crate::alarm::{AlarmError, AlarmState, AlarmTrigger, AudioSink, LogAudioSink};
pub use crate::analysis::{Backend, ClassificationResult, RedClassifier};
pub use crate::config::{BackendPreference, ConfigArgs, PipelineConfig};
pub use crate::error::{DecodeError, PipelineError};
pub use crate::input::{Frame, FrameSource, ImageDecoder, PixelBuffer, PixelFormat};
pub use crate::pipeline::{
    FramePipeline, LatestPercentage, PercentageSubscriber, PercentageUpdate, PipelineContext,
    RatioReporter, SubmitOutcome,
};
