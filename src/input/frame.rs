use std::sync::Arc;

use super::decoder::MAX_FRAME_SIDE;
use crate::error::DecodeError;

/// 采集像素格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 8位交错 RGBA
    Rgba8,
    /// 8位交错 BGRA (CoreVideo默认)
    Bgra8,
    /// YUV420P 三平面 (BT.601 全范围)
    Yuv420p,
    /// Y平面 + 交错CbCr平面 (ARKit capturedImage)
    Nv12,
}

impl PixelFormat {
    /// 紧凑排列时的帧字节数 (溢出时饱和)
    pub fn frame_len(&self, width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        let luma = w.saturating_mul(h);
        match self {
            Self::Rgba8 | Self::Bgra8 => luma.saturating_mul(4),
            Self::Yuv420p | Self::Nv12 => {
                luma.saturating_add(chroma_len(w, h).saturating_mul(2))
            }
        }
    }
}

/// 4:2:0 单个色度平面的采样数
pub(crate) fn chroma_len(width: usize, height: usize) -> usize {
    width.div_ceil(2).saturating_mul(height.div_ceil(2))
}

/// 采集帧 (帧源 → 解码器)
///
/// 由解码器按值消费一次,之后释放。
#[derive(Clone)]
pub struct Frame {
    pub frame_id: u64, // 采集序号,单调递增
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn new(frame_id: u64, width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Self {
        Self {
            frame_id,
            width,
            height,
            format,
            data,
        }
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("frame_id", &self.frame_id)
            .field("size", &format_args!("{}x{}", self.width, self.height))
            .field("format", &self.format)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// 解码后的 RGBA8 图像
///
/// 字节存储由解码器池化: 最后一个引用释放后回到池中复用。
#[derive(Clone)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    data: Arc<Vec<u8>>,
}

impl PixelBuffer {
    pub(crate) fn from_shared(width: u32, height: u32, data: Arc<Vec<u8>>) -> Self {
        debug_assert_eq!(data.len(), width as usize * height as usize * 4);
        Self {
            width,
            height,
            data,
        }
    }

    /// 直接从 RGBA 字节构造 (测试与静态图像使用)
    pub fn from_rgba(width: u32, height: u32, data: Vec<u8>) -> Result<Self, DecodeError> {
        if width == 0 || height == 0 {
            return Err(DecodeError::ZeroDimensions { width, height });
        }
        if width > MAX_FRAME_SIDE || height > MAX_FRAME_SIDE {
            return Err(DecodeError::TooLarge {
                width,
                height,
                max: MAX_FRAME_SIDE,
            });
        }
        let expected = PixelFormat::Rgba8.frame_len(width, height);
        if data.len() != expected {
            return Err(DecodeError::BufferSize {
                format: PixelFormat::Rgba8,
                width,
                height,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self::from_shared(width, height, Arc::new(data)))
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl std::fmt::Debug for PixelBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PixelBuffer")
            .field("size", &format_args!("{}x{}", self.width, self.height))
            .finish_non_exhaustive()
    }
}
