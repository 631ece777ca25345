/// SIMD优化的红色像素计数
/// 每次迭代处理8个RGBA像素 (32字节), 尾部走标量路径

#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::*;

use super::red_ratio::{count_red_scalar, result_for, Backend, ClassificationResult, RedClassifier};
#[cfg(target_arch = "x86_64")]
use super::red_ratio::{BLUE_MAX, GREEN_MAX, RED_MIN};
use crate::error::Result;
use crate::input::PixelBuffer;

/// 运行时检测 AVX2 后计数, 否则回退标量
pub fn count_red(rgba: &[u8]) -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2") {
            return unsafe { count_red_avx2(rgba) };
        }
    }
    count_red_scalar(rgba)
}

/// AVX2 计数
///
/// 无符号字节比较通过异或 0x80 转成有符号比较:
/// `a > b (u8)` 等价于 `(a^0x80) > (b^0x80) (i8)`
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn count_red_avx2(rgba: &[u8]) -> u64 {
    let bias = _mm256_set1_epi8(i8::MIN);

    // 每个像素 u32 小端: byte0=R byte1=G byte2=B byte3=A
    let r_min = _mm256_set1_epi32(((RED_MIN ^ 0x80) as u32) as i32);
    let gb_max = _mm256_set1_epi32(
        ((((GREEN_MAX ^ 0x80) as u32) << 8) | (((BLUE_MAX ^ 0x80) as u32) << 16)) as i32,
    );
    let sel_r = _mm256_set1_epi32(0x0000_00FF);
    let sel_gb = _mm256_set1_epi32(0x00FF_FF00);
    let sel_a = _mm256_set1_epi32(0xFF00_0000u32 as i32);
    let all_ones = _mm256_set1_epi32(-1);

    let chunks = rgba.len() / 32;
    let mut count = 0u64;

    for i in 0..chunks {
        let px = _mm256_loadu_si256(rgba.as_ptr().add(i * 32) as *const __m256i);
        let biased = _mm256_xor_si256(px, bias);

        let gt = _mm256_cmpgt_epi8(biased, r_min);
        let lt = _mm256_cmpgt_epi8(gb_max, biased);

        // R取gt, G/B取lt, A恒真
        let mask = _mm256_or_si256(
            _mm256_or_si256(_mm256_and_si256(gt, sel_r), _mm256_and_si256(lt, sel_gb)),
            sel_a,
        );
        let hit = _mm256_cmpeq_epi32(mask, all_ones);
        let bits = _mm256_movemask_ps(_mm256_castsi256_ps(hit)) as u32;
        count += bits.count_ones() as u64;
    }

    count + count_red_scalar(&rgba[chunks * 32..])
}

/// AVX2 分类器, 仅在CPU支持时可构造
#[derive(Debug, Clone, Copy)]
pub struct SimdClassifier {
    _private: (),
}

impl SimdClassifier {
    pub fn new() -> Option<Self> {
        #[cfg(target_arch = "x86_64")]
        {
            if is_x86_feature_detected!("avx2") {
                return Some(Self { _private: () });
            }
        }
        None
    }
}

impl RedClassifier for SimdClassifier {
    fn backend(&self) -> Backend {
        Backend::Simd
    }

    fn classify(&mut self, image: &PixelBuffer) -> Result<ClassificationResult> {
        result_for(image, count_red(image.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_simd_matches_scalar_on_random_pixels() {
        let mut rng = StdRng::seed_from_u64(42);
        // 偏向阈值附近, 覆盖边界值
        let pick = |rng: &mut StdRng| -> u8 {
            match rng.gen_range(0..4) {
                0 => rng.gen_range(15..25),
                1 => rng.gen_range(45..56),
                2 => rng.gen(),
                _ => [0, 19, 20, 21, 49, 50, 51, 127, 128, 255][rng.gen_range(0..10)],
            }
        };
        for len in [0usize, 1, 7, 8, 9, 63, 64, 1000] {
            let rgba: Vec<u8> = (0..len * 4).map(|_| pick(&mut rng)).collect();
            assert_eq!(count_red(&rgba), count_red_scalar(&rgba), "len {}", len);
        }
    }

    #[test]
    fn test_simd_boundary_values() {
        let pixels: Vec<u8> = [
            [51u8, 19, 19, 0],
            [50, 0, 0, 255],
            [255, 20, 0, 255],
            [255, 0, 20, 255],
            [128, 0, 0, 128],
            [255, 255, 255, 255],
            [200, 0, 0, 255],
            [0, 0, 0, 0],
        ]
        .iter()
        .flatten()
        .copied()
        .collect();
        assert_eq!(count_red(&pixels), 3);
    }

    #[test]
    fn test_simd_classifier_when_available() {
        let Some(mut classifier) = SimdClassifier::new() else {
            return;
        };
        let image = PixelBuffer::from_rgba(4, 4, [255u8, 0, 0, 255].repeat(16)).unwrap();
        let result = classifier.classify(&image).unwrap();
        assert_eq!(result.percentage(), 100);
        assert_eq!(classifier.backend(), Backend::Simd);
    }
}
