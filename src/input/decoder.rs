/// 图像解码器: 采集帧 → RGBA8 像素缓冲
/// Image decoder: capture frame → RGBA8 pixel buffer
///
/// YUV 转换使用 BT.601 全范围定点系数 (×128),标量与 AVX2 两条路径逐字节一致。
use std::sync::Arc;

#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::*;

use tracing::debug;

use super::frame::{chroma_len, Frame, PixelBuffer, PixelFormat};
use crate::error::{DecodeError, PipelineError};

/// 单边最大像素数
pub const MAX_FRAME_SIDE: u32 = 8192;

pub struct ImageDecoder {
    buffer: Arc<Vec<u8>>, // 池化输出缓冲,尺寸不变且无人持有时复用
    decoded_frames: u64,
    reallocations: u64,
}

impl ImageDecoder {
    pub fn new() -> Self {
        Self {
            buffer: Arc::new(Vec::new()),
            decoded_frames: 0,
            reallocations: 0,
        }
    }

    pub fn decoded_frames(&self) -> u64 {
        self.decoded_frames
    }

    /// 输出缓冲重新分配的次数
    pub fn reallocations(&self) -> u64 {
        self.reallocations
    }

    /// 解码一帧。帧在此被消费。
    pub fn decode(&mut self, frame: Frame) -> Result<PixelBuffer, PipelineError> {
        validate(&frame)?;

        let (w, h) = (frame.width as usize, frame.height as usize);
        let required = w * h * 4;

        // 只在尺寸变化或上一帧缓冲仍被持有时重新分配
        if Arc::strong_count(&self.buffer) > 1 || self.buffer.len() != required {
            self.buffer = Arc::new(allocate(required)?);
            self.reallocations += 1;
            debug!(
                width = frame.width,
                height = frame.height,
                bytes = required,
                "decode buffer allocated"
            );
        }

        let out = match Arc::get_mut(&mut self.buffer) {
            Some(out) => out.as_mut_slice(),
            None => return Err(PipelineError::Allocation { bytes: required }),
        };

        let luma = w * h;
        let chroma = chroma_len(w, h);
        match frame.format {
            PixelFormat::Rgba8 => rgba_to_rgba_premultiplied(&frame.data, out),
            PixelFormat::Bgra8 => bgra_to_rgba_premultiplied(&frame.data, out),
            PixelFormat::Yuv420p => {
                let (y_plane, uv) = frame.data.split_at(luma);
                let (u_plane, v_plane) = uv.split_at(chroma);
                yuv420p_to_rgba(y_plane, u_plane, v_plane, out, w, h);
            }
            PixelFormat::Nv12 => {
                let (y_plane, uv_plane) = frame.data.split_at(luma);
                nv12_to_rgba(y_plane, uv_plane, out, w, h);
            }
        }

        self.decoded_frames += 1;
        Ok(PixelBuffer::from_shared(
            frame.width,
            frame.height,
            Arc::clone(&self.buffer),
        ))
    }
}

impl Default for ImageDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn validate(frame: &Frame) -> Result<(), DecodeError> {
    let (width, height) = (frame.width, frame.height);
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
    let expected = frame.format.frame_len(width, height);
    if frame.data.len() != expected {
        return Err(DecodeError::BufferSize {
            format: frame.format,
            width,
            height,
            expected,
            actual: frame.data.len(),
        });
    }
    Ok(())
}

fn allocate(bytes: usize) -> Result<Vec<u8>, PipelineError> {
    let mut data = Vec::new();
    data.try_reserve_exact(bytes)
        .map_err(|_| PipelineError::Allocation { bytes })?;
    data.resize(bytes, 255); // 预填充alpha=255
    Ok(data)
}

/// 预乘alpha (与 premultipliedLast 绘制上下文一致,不透明像素不变)
#[inline(always)]
fn premultiply(c: u8, a: u8) -> u8 {
    ((c as u32 * a as u32 + 127) / 255) as u8
}

fn rgba_to_rgba_premultiplied(src: &[u8], out: &mut [u8]) {
    for (s, d) in src.chunks_exact(4).zip(out.chunks_exact_mut(4)) {
        let a = s[3];
        if a == 255 {
            d.copy_from_slice(s);
        } else {
            d[0] = premultiply(s[0], a);
            d[1] = premultiply(s[1], a);
            d[2] = premultiply(s[2], a);
            d[3] = a;
        }
    }
}

fn bgra_to_rgba_premultiplied(src: &[u8], out: &mut [u8]) {
    for (s, d) in src.chunks_exact(4).zip(out.chunks_exact_mut(4)) {
        let a = s[3];
        d[0] = premultiply(s[2], a);
        d[1] = premultiply(s[1], a);
        d[2] = premultiply(s[0], a);
        d[3] = a;
    }
}

/// BT.601 全范围定点转换 (系数×128,算术右移)
#[inline(always)]
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y = y as i32;
    let u = u as i32 - 128;
    let v = v as i32 - 128;
    [
        (y + ((v * 179) >> 7)).clamp(0, 255) as u8,
        (y + ((u * -44) >> 7) + ((v * -91) >> 7)).clamp(0, 255) as u8,
        (y + ((u * 227) >> 7)).clamp(0, 255) as u8,
    ]
}

/// YUV420P → RGBA, 有AVX2时走向量路径
pub(crate) fn yuv420p_to_rgba(
    y_plane: &[u8],
    u_plane: &[u8],
    v_plane: &[u8],
    out: &mut [u8],
    width: usize,
    height: usize,
) {
    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2") {
            // 平面长度已由 validate 保证
            unsafe { yuv420p_to_rgba_avx2(y_plane, u_plane, v_plane, out, width, height) };
            return;
        }
    }
    yuv420p_to_rgba_scalar(y_plane, u_plane, v_plane, out, width, height);
}

/// 标量版本YUV转换(fallback)
pub(crate) fn yuv420p_to_rgba_scalar(
    y_plane: &[u8],
    u_plane: &[u8],
    v_plane: &[u8],
    out: &mut [u8],
    width: usize,
    height: usize,
) {
    let uv_stride = width.div_ceil(2);
    for row in 0..height {
        let y_row = row * width;
        let uv_row = (row >> 1) * uv_stride;
        for x in 0..width {
            let uv = uv_row + (x >> 1);
            let rgb = yuv_to_rgb(y_plane[y_row + x], u_plane[uv], v_plane[uv]);
            let idx = (y_row + x) * 4;
            out[idx..idx + 3].copy_from_slice(&rgb);
            out[idx + 3] = 255;
        }
    }
}

/// NV12 (Y + 交错CbCr) → RGBA
pub(crate) fn nv12_to_rgba(y_plane: &[u8], uv_plane: &[u8], out: &mut [u8], width: usize, height: usize) {
    let uv_stride = width.div_ceil(2) * 2;
    for row in 0..height {
        let y_row = row * width;
        let uv_row = (row >> 1) * uv_stride;
        for x in 0..width {
            let uv = uv_row + (x >> 1) * 2;
            let rgb = yuv_to_rgb(y_plane[y_row + x], uv_plane[uv], uv_plane[uv + 1]);
            let idx = (y_row + x) * 4;
            out[idx..idx + 3].copy_from_slice(&rgb);
            out[idx + 3] = 255;
        }
    }
}

/// AVX2优化版本YUV转换(16像素并行)
///
/// 调用方保证: y_plane ≥ w*h, u/v_plane ≥ ceil(w/2)*ceil(h/2), out ≥ w*h*4
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn yuv420p_to_rgba_avx2(
    y_plane: &[u8],
    u_plane: &[u8],
    v_plane: &[u8],
    out: &mut [u8],
    width: usize,
    height: usize,
) {
    let chunks = width / 16;
    let uv_stride = width.div_ceil(2);

    // BT.601系数(乘以128以避免浮点)
    let coef_r_v = _mm_set1_epi16(179); // 1.402 * 128
    let coef_g_u = _mm_set1_epi16(-44); // -0.344 * 128
    let coef_g_v = _mm_set1_epi16(-91); // -0.714 * 128
    let coef_b_u = _mm_set1_epi16(227); // 1.772 * 128
    let bias = _mm_set1_epi16(128);
    let alpha = _mm_set1_epi8(-1);

    for row in 0..height {
        let y_row = row * width;
        let uv_row = (row >> 1) * uv_stride;
        let out_row = y_row * 4;

        for chunk in 0..chunks {
            let x = chunk * 16;
            let y_ptr = y_plane.as_ptr().add(y_row + x);
            let u_ptr = u_plane.as_ptr().add(uv_row + (x >> 1));
            let v_ptr = v_plane.as_ptr().add(uv_row + (x >> 1));

            // 16个Y, 8个U/V(4:2:0子采样)扩展为16个
            let y_vec = _mm_loadu_si128(y_ptr as *const __m128i);
            let u_raw = _mm_loadl_epi64(u_ptr as *const __m128i);
            let v_raw = _mm_loadl_epi64(v_ptr as *const __m128i);
            let u_dup = _mm_unpacklo_epi8(u_raw, u_raw);
            let v_dup = _mm_unpacklo_epi8(v_raw, v_raw);

            let out_ptr = out.as_mut_ptr().add(out_row + x * 4);

            for half in 0..2 {
                let (y_16, u_16, v_16) = if half == 0 {
                    (
                        _mm_cvtepu8_epi16(y_vec),
                        _mm_cvtepu8_epi16(u_dup),
                        _mm_cvtepu8_epi16(v_dup),
                    )
                } else {
                    (
                        _mm_cvtepu8_epi16(_mm_srli_si128(y_vec, 8)),
                        _mm_cvtepu8_epi16(_mm_srli_si128(u_dup, 8)),
                        _mm_cvtepu8_epi16(_mm_srli_si128(v_dup, 8)),
                    )
                };
                let u_bias = _mm_sub_epi16(u_16, bias);
                let v_bias = _mm_sub_epi16(v_16, bias);

                let r_off = _mm_srai_epi16(_mm_mullo_epi16(v_bias, coef_r_v), 7);
                let g_off_u = _mm_srai_epi16(_mm_mullo_epi16(u_bias, coef_g_u), 7);
                let g_off_v = _mm_srai_epi16(_mm_mullo_epi16(v_bias, coef_g_v), 7);
                let b_off = _mm_srai_epi16(_mm_mullo_epi16(u_bias, coef_b_u), 7);

                let r = _mm_add_epi16(y_16, r_off);
                let g = _mm_add_epi16(y_16, _mm_add_epi16(g_off_u, g_off_v));
                let b = _mm_add_epi16(y_16, b_off);

                // 饱和转换为u8
                let r_u8 = _mm_packus_epi16(r, r);
                let g_u8 = _mm_packus_epi16(g, g);
                let b_u8 = _mm_packus_epi16(b, b);

                // 交错RGBA
                let rg = _mm_unpacklo_epi8(r_u8, g_u8);
                let ba = _mm_unpacklo_epi8(b_u8, alpha);
                let rgba_0 = _mm_unpacklo_epi16(rg, ba);
                let rgba_1 = _mm_unpackhi_epi16(rg, ba);

                let dst = out_ptr.add(half * 32);
                _mm_storeu_si128(dst as *mut __m128i, rgba_0);
                _mm_storeu_si128(dst.add(16) as *mut __m128i, rgba_1);
            }
        }

        // 处理剩余像素
        for x in chunks * 16..width {
            let uv = uv_row + (x >> 1);
            let rgb = yuv_to_rgb(y_plane[y_row + x], u_plane[uv], v_plane[uv]);
            let idx = out_row + x * 4;
            out[idx..idx + 3].copy_from_slice(&rgb);
            out[idx + 3] = 255;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn yuv_frame(frame_id: u64, width: u32, height: u32, seed: u64) -> Frame {
        let mut rng = StdRng::seed_from_u64(seed);
        let len = PixelFormat::Yuv420p.frame_len(width, height);
        let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
        Frame::new(frame_id, width, height, PixelFormat::Yuv420p, data)
    }

    #[test]
    fn test_yuv_vector_path_matches_scalar() {
        // 宽度不是16的倍数,覆盖尾部
        for (w, h) in [(37usize, 9usize), (64, 4), (15, 3), (1, 1)] {
            let frame = yuv_frame(0, w as u32, h as u32, (w * 31 + h) as u64);
            let chroma = chroma_len(w, h);
            let (y_plane, uv) = frame.data.split_at(w * h);
            let (u_plane, v_plane) = uv.split_at(chroma);

            let mut dispatched = vec![0u8; w * h * 4];
            let mut scalar = vec![0u8; w * h * 4];
            yuv420p_to_rgba(y_plane, u_plane, v_plane, &mut dispatched, w, h);
            yuv420p_to_rgba_scalar(y_plane, u_plane, v_plane, &mut scalar, w, h);
            assert_eq!(dispatched, scalar, "{}x{}", w, h);
        }
    }

    #[test]
    fn test_decode_is_deterministic() {
        let mut decoder = ImageDecoder::new();
        let a = decoder.decode(yuv_frame(0, 33, 17, 7)).unwrap();
        let a_bytes = a.as_bytes().to_vec();
        drop(a);
        let b = decoder.decode(yuv_frame(1, 33, 17, 7)).unwrap();
        assert_eq!(a_bytes, b.as_bytes());
    }

    #[test]
    fn test_neutral_chroma_gives_gray() {
        let (w, h) = (4u32, 2u32);
        let mut data = vec![90u8; (w * h) as usize];
        data.extend(vec![128u8; 4]); // Cb/Cr 交错
        let mut decoder = ImageDecoder::new();
        let buffer = decoder
            .decode(Frame::new(0, w, h, PixelFormat::Nv12, data))
            .unwrap();
        for px in buffer.as_bytes().chunks_exact(4) {
            assert_eq!(px, &[90, 90, 90, 255]);
        }
    }

    #[test]
    fn test_full_red_chroma_decodes_as_red() {
        // 纯红 (255,0,0) 在 BT.601 全范围下约为 Y=76 Cb=85 Cr=255
        let (w, h) = (2u32, 2u32);
        let mut data = vec![76u8; 4];
        data.push(85);
        data.push(255);
        let mut decoder = ImageDecoder::new();
        let buffer = decoder
            .decode(Frame::new(0, w, h, PixelFormat::Yuv420p, data))
            .unwrap();
        let px = &buffer.as_bytes()[..4];
        assert!(px[0] > 200 && px[1] < 20 && px[2] < 20, "{:?}", px);
    }

    #[test]
    fn test_bgra_is_swizzled() {
        let data = vec![10, 20, 30, 255, 1, 2, 3, 255];
        let mut decoder = ImageDecoder::new();
        let buffer = decoder
            .decode(Frame::new(0, 2, 1, PixelFormat::Bgra8, data))
            .unwrap();
        assert_eq!(buffer.as_bytes(), &[30, 20, 10, 255, 3, 2, 1, 255]);
    }

    #[test]
    fn test_translucent_rgba_is_premultiplied() {
        let data = vec![200, 100, 0, 128, 255, 0, 0, 255];
        let mut decoder = ImageDecoder::new();
        let buffer = decoder
            .decode(Frame::new(0, 2, 1, PixelFormat::Rgba8, data))
            .unwrap();
        assert_eq!(buffer.as_bytes(), &[100, 50, 0, 128, 255, 0, 0, 255]);
    }

    #[test]
    fn test_rejects_unusable_frames() {
        let mut decoder = ImageDecoder::new();

        let zero = Frame::new(0, 0, 10, PixelFormat::Rgba8, Vec::new());
        assert!(matches!(
            decoder.decode(zero),
            Err(PipelineError::Decode(DecodeError::ZeroDimensions { .. }))
        ));

        let short = Frame::new(1, 4, 4, PixelFormat::Nv12, vec![0; 10]);
        assert!(matches!(
            decoder.decode(short),
            Err(PipelineError::Decode(DecodeError::BufferSize { expected: 24, actual: 10, .. }))
        ));

        let huge = Frame::new(2, MAX_FRAME_SIDE + 1, 1, PixelFormat::Rgba8, Vec::new());
        assert!(matches!(
            decoder.decode(huge),
            Err(PipelineError::Decode(DecodeError::TooLarge { .. }))
        ));
        assert_eq!(decoder.decoded_frames(), 0);
    }

    #[test]
    fn test_buffer_reused_once_released() {
        let mut decoder = ImageDecoder::new();
        for id in 0..5 {
            let buffer = decoder.decode(yuv_frame(id, 16, 16, id)).unwrap();
            drop(buffer);
        }
        assert_eq!(decoder.reallocations(), 1);

        // 仍被持有时必须重新分配,旧数据不被覆盖
        let held = decoder.decode(yuv_frame(5, 16, 16, 1)).unwrap();
        let snapshot = held.as_bytes().to_vec();
        let _next = decoder.decode(yuv_frame(6, 16, 16, 2)).unwrap();
        assert_eq!(decoder.reallocations(), 2);
        assert_eq!(held.as_bytes(), snapshot.as_slice());
    }
}
