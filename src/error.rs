//! 错误类型 (Error types)
//!
//! 单帧失败只影响这一帧: 解码失败、分配失败、设备超时都在帧处理边界被吞掉,
//! 最坏的结果是百分比读数保持上一帧的值。

use std::time::Duration;

use thiserror::Error;

use crate::input::PixelFormat;

/// 帧无法解释 (Unusable frame)
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame has zero dimensions: {width}x{height}")]
    ZeroDimensions { width: u32, height: u32 },

    #[error("frame too large: {width}x{height}, max side {max}")]
    TooLarge { width: u32, height: u32, max: u32 },

    #[error("{format:?} frame {width}x{height} needs {expected} bytes, got {actual}")]
    BufferSize {
        format: PixelFormat,
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
}

/// 帧处理流水线错误
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),

    /// GPU后端不可用 (无适配器/着色器编译失败/设备丢失)
    #[error("classifier unavailable: {0}")]
    ClassifierUnavailable(String),

    #[error("allocation of {bytes} bytes failed")]
    Allocation { bytes: usize },

    #[error("device did not complete within {0:?}")]
    DeviceTimeout(Duration),

    #[error("device execution failed: {0}")]
    Device(String),
}

impl PipelineError {
    /// 是否应当降级到CPU分类器
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::ClassifierUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
