/// 红色像素分析 (Red Pixel Analysis)
///
/// - red_ratio: 判定谓词、结果类型、标量分类器与后端选择
/// - red_ratio_simd: AVX2 分类器 (运行时检测)
/// - red_ratio_wgpu: GPU 计算着色器分类器 (feature = "gpu")
pub mod red_ratio;
pub mod red_ratio_simd;
#[cfg(feature = "gpu")]
pub mod red_ratio_wgpu;

pub use red_ratio::{
    create_classifier, is_red, Backend, ClassificationResult, RedClassifier, ScalarClassifier,
    BLUE_MAX, GREEN_MAX, RED_MIN,
};
pub use red_ratio_simd::SimdClassifier;
#[cfg(feature = "gpu")]
pub use red_ratio_wgpu::{GpuError, WgpuRedClassifier};
