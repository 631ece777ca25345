//! 红色像素判定与比例计算
//!
//! 判定谓词固定: `r > 50 && g < 20 && b < 20`, alpha 忽略。

use std::fmt;
use std::time::Duration;

use tracing::{info, warn};

use super::red_ratio_simd::SimdClassifier;
use crate::config::BackendPreference;
use crate::error::Result;
use crate::input::PixelBuffer;

/// R 通道下限 (严格大于)
pub const RED_MIN: u8 = 50;
/// G 通道上限 (严格小于)
pub const GREEN_MAX: u8 = 20;
/// B 通道上限 (严格小于)
pub const BLUE_MAX: u8 = 20;

#[inline(always)]
pub fn is_red(r: u8, g: u8, b: u8) -> bool {
    r > RED_MIN && g < GREEN_MAX && b < BLUE_MAX
}

/// 单帧分类结果, 保证 `0 <= red_count <= total_count` 且 `total_count > 0`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassificationResult {
    red_count: u64,
    total_count: u64,
}

impl ClassificationResult {
    pub fn new(red_count: u64, total_count: u64) -> Option<Self> {
        (total_count > 0 && red_count <= total_count).then_some(Self {
            red_count,
            total_count,
        })
    }

    pub fn red_count(&self) -> u64 {
        self.red_count
    }

    pub fn total_count(&self) -> u64 {
        self.total_count
    }

    /// 截断取整的百分比 `floor(red*100/total)`, 范围 [0,100]
    pub fn percentage(&self) -> u8 {
        (self.red_count as u128 * 100 / self.total_count as u128) as u8
    }

    pub fn fraction(&self) -> f64 {
        self.red_count as f64 / self.total_count as f64
    }
}

/// 实际运行的分类后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    Scalar,
    Simd,
    Gpu,
}

impl Backend {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Scalar => "scalar",
            Self::Simd => "simd",
            Self::Gpu => "gpu",
        }
    }

    pub fn is_cpu(&self) -> bool {
        !matches!(self, Self::Gpu)
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 红色分类器: 一次一帧, 由工作线程独占
pub trait RedClassifier: Send {
    fn backend(&self) -> Backend;

    fn classify(&mut self, image: &PixelBuffer) -> Result<ClassificationResult>;
}

/// 标量逐像素计数
pub(crate) fn count_red_scalar(rgba: &[u8]) -> u64 {
    rgba.chunks_exact(4)
        .filter(|px| is_red(px[0], px[1], px[2]))
        .count() as u64
}

/// 按 (PixelBuffer尺寸, 红色计数) 组装结果
pub(crate) fn result_for(image: &PixelBuffer, red_count: u64) -> Result<ClassificationResult> {
    ClassificationResult::new(red_count, image.pixel_count()).ok_or_else(|| {
        crate::error::PipelineError::Device(format!(
            "red count {} exceeds {} pixels",
            red_count,
            image.pixel_count()
        ))
    })
}

/// 标量分类器 (规范实现)
#[derive(Debug, Default, Clone, Copy)]
pub struct ScalarClassifier;

impl RedClassifier for ScalarClassifier {
    fn backend(&self) -> Backend {
        Backend::Scalar
    }

    fn classify(&mut self, image: &PixelBuffer) -> Result<ClassificationResult> {
        result_for(image, count_red_scalar(image.as_bytes()))
    }
}

/// 当前机器上最快的CPU分类器
pub fn best_cpu_classifier() -> Box<dyn RedClassifier> {
    match SimdClassifier::new() {
        Some(simd) => Box::new(simd),
        None => Box::new(ScalarClassifier),
    }
}

/// 按偏好创建分类器, 不可用时降级
///
/// - Auto: GPU (若编译启用且有适配器) → AVX2 → 标量
/// - Gpu: 同 Auto, 但GPU不可用时给出警告
pub fn create_classifier(
    preference: BackendPreference,
    gpu_timeout: Duration,
) -> Box<dyn RedClassifier> {
    let classifier: Box<dyn RedClassifier> = match preference {
        BackendPreference::Cpu => Box::new(ScalarClassifier),
        BackendPreference::Simd => match SimdClassifier::new() {
            Some(simd) => Box::new(simd),
            None => {
                warn!("AVX2 not detected, using scalar classifier");
                Box::new(ScalarClassifier)
            }
        },
        BackendPreference::Auto | BackendPreference::Gpu => {
            #[cfg(feature = "gpu")]
            {
                match super::red_ratio_wgpu::WgpuRedClassifier::new(gpu_timeout) {
                    Ok(gpu) => return Box::new(gpu),
                    Err(e) if preference == BackendPreference::Gpu => {
                        warn!("GPU classifier unavailable, falling back to CPU: {}", e)
                    }
                    Err(e) => info!("GPU classifier unavailable: {}", e),
                }
            }
            #[cfg(not(feature = "gpu"))]
            {
                let _ = gpu_timeout;
                if preference == BackendPreference::Gpu {
                    warn!("built without the `gpu` feature, falling back to CPU");
                }
            }
            best_cpu_classifier()
        }
    };
    info!(backend = %classifier.backend(), "red classifier ready");
    classifier
}
