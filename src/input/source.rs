//! 帧源 (Frame Source)
//!
//! 真实的采集会话 (AR/相机) 在本crate之外,通过 [`FrameSource`] 接入。
//! 这里提供两个本地实现: 合成测试帧与静态图片回放。

use std::path::Path;

use image::RgbaImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

use super::frame::{Frame, PixelFormat};

/// 按采集顺序产生帧, `None` 表示流结束
pub trait FrameSource {
    fn next_frame(&mut self) -> Option<Frame>;
}

/// 合成帧源: 随机背景 + 左侧宽度往复变化的红色区域
///
/// 红色覆盖率在一个周期内从 0 线性升到 100% 再回落,用于驱动报警阈值穿越。
pub struct SyntheticSource {
    width: u32,
    height: u32,
    format: PixelFormat,
    period: u64,
    next_id: u64,
    limit: Option<u64>,
    rng: StdRng,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32, format: PixelFormat, seed: u64) -> Self {
        Self {
            width,
            height,
            format,
            period: 120,
            next_id: 0,
            limit: None,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// 覆盖率往复一次所需帧数
    pub fn with_period(mut self, period: u64) -> Self {
        self.period = period.max(2);
        self
    }

    pub fn with_limit(mut self, frames: u64) -> Self {
        self.limit = Some(frames);
        self
    }

    /// 当前帧红色区域占宽度的比例 (三角波)
    fn coverage(&self, frame_id: u64) -> f64 {
        let half = self.period / 2;
        let phase = frame_id % self.period;
        if phase <= half {
            phase as f64 / half as f64
        } else {
            (self.period - phase) as f64 / half as f64
        }
    }

    fn render_rgba(&mut self, frame_id: u64) -> Vec<u8> {
        let (w, h) = (self.width as usize, self.height as usize);
        let red_cols = (w as f64 * self.coverage(frame_id)).round() as usize;
        let mut rgba = Vec::with_capacity(w * h * 4);
        for _ in 0..h {
            for x in 0..w {
                let px = if x < red_cols {
                    [
                        self.rng.gen_range(200..=255),
                        self.rng.gen_range(0..8),
                        self.rng.gen_range(0..8),
                        255,
                    ]
                } else {
                    [
                        self.rng.gen_range(0..120),
                        self.rng.gen_range(60..200),
                        self.rng.gen_range(60..200),
                        255,
                    ]
                };
                rgba.extend_from_slice(&px);
            }
        }
        rgba
    }
}

impl FrameSource for SyntheticSource {
    fn next_frame(&mut self) -> Option<Frame> {
        if self.limit.is_some_and(|limit| self.next_id >= limit) {
            return None;
        }
        let frame_id = self.next_id;
        self.next_id += 1;

        let rgba = self.render_rgba(frame_id);
        let (w, h) = (self.width as usize, self.height as usize);
        let data = match self.format {
            PixelFormat::Rgba8 => rgba,
            PixelFormat::Bgra8 => rgba
                .chunks_exact(4)
                .flat_map(|p| [p[2], p[1], p[0], p[3]])
                .collect(),
            PixelFormat::Yuv420p => rgba_to_yuv420p(&rgba, w, h),
            PixelFormat::Nv12 => rgba_to_nv12(&rgba, w, h),
        };
        Some(Frame::new(frame_id, self.width, self.height, self.format, data))
    }
}

/// 静态图片回放: 同一张图作为连续 RGBA 帧输出
pub struct StillImageSource {
    image: RgbaImage,
    next_id: u64,
    limit: Option<u64>,
}

impl StillImageSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, image::ImageError> {
        let path = path.as_ref();
        let image = image::open(path)?.to_rgba8();
        info!(
            path = %path.display(),
            width = image.width(),
            height = image.height(),
            "still image loaded"
        );
        Ok(Self::from_image(image))
    }

    pub fn from_image(image: RgbaImage) -> Self {
        Self {
            image,
            next_id: 0,
            limit: None,
        }
    }

    pub fn with_limit(mut self, frames: u64) -> Self {
        self.limit = Some(frames);
        self
    }
}

impl FrameSource for StillImageSource {
    fn next_frame(&mut self) -> Option<Frame> {
        if self.limit.is_some_and(|limit| self.next_id >= limit) {
            return None;
        }
        let frame_id = self.next_id;
        self.next_id += 1;
        Some(Frame::new(
            frame_id,
            self.image.width(),
            self.image.height(),
            PixelFormat::Rgba8,
            self.image.as_raw().clone(),
        ))
    }
}

/// RGB → YCbCr (BT.601 全范围)
fn rgb_to_ycbcr(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let (r, g, b) = (r as f32, g as f32, b as f32);
    let y = 0.299 * r + 0.587 * g + 0.114 * b;
    let cb = 128.0 - 0.168736 * r - 0.331264 * g + 0.5 * b;
    let cr = 128.0 + 0.5 * r - 0.418688 * g - 0.081312 * b;
    (
        y.round().clamp(0.0, 255.0) as u8,
        cb.round().clamp(0.0, 255.0) as u8,
        cr.round().clamp(0.0, 255.0) as u8,
    )
}

/// 4:2:0 下采样取每个2x2块左上角像素的色度
fn chroma_planes(rgba: &[u8], width: usize, height: usize) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
    let mut y_plane = Vec::with_capacity(width * height);
    for px in rgba.chunks_exact(4) {
        y_plane.push(rgb_to_ycbcr(px[0], px[1], px[2]).0);
    }
    let (cw, ch) = (width.div_ceil(2), height.div_ceil(2));
    let mut cb = Vec::with_capacity(cw * ch);
    let mut cr = Vec::with_capacity(cw * ch);
    for cy in 0..ch {
        for cx in 0..cw {
            let idx = ((cy * 2) * width + cx * 2) * 4;
            let (_, u, v) = rgb_to_ycbcr(rgba[idx], rgba[idx + 1], rgba[idx + 2]);
            cb.push(u);
            cr.push(v);
        }
    }
    (y_plane, cb, cr)
}

fn rgba_to_yuv420p(rgba: &[u8], width: usize, height: usize) -> Vec<u8> {
    let (mut data, cb, cr) = chroma_planes(rgba, width, height);
    data.extend_from_slice(&cb);
    data.extend_from_slice(&cr);
    data
}

fn rgba_to_nv12(rgba: &[u8], width: usize, height: usize) -> Vec<u8> {
    let (mut data, cb, cr) = chroma_planes(rgba, width, height);
    for (u, v) in cb.into_iter().zip(cr) {
        data.push(u);
        data.push(v);
    }
    data
}
