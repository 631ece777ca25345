/// GPU加速的红色像素计数 (使用wgpu)
///
/// 每个线程判定一个像素, 16x16 工作组先在组内原子累加,
/// 再由组内第一个线程向全局计数器做一次 atomicAdd。
/// 第二个入口 `finalize_red_fraction` 写出浮点比例。
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, info};
use wgpu::util::DeviceExt;

use super::red_ratio::{result_for, Backend, ClassificationResult, RedClassifier};
use super::red_ratio_simd::count_red;
use crate::error::{PipelineError, Result};
use crate::input::PixelBuffer;

const WORKGROUP_SIZE: u32 = 16;

/// GPU 后端错误
#[derive(Debug, Error)]
pub enum GpuError {
    #[error("no GPU adapter available")]
    NotAvailable,

    #[error("device request failed: {0}")]
    DeviceRequest(String),

    #[error("shader compilation failed: {0}")]
    ShaderCompilation(String),

    #[error("frame needs {bytes} bytes, device binding limit is {limit}")]
    FrameTooLarge { bytes: u64, limit: u64 },

    #[error("buffer mapping failed: {0}")]
    BufferMapping(String),

    #[error("device lost")]
    DeviceLost,

    #[error("GPU did not complete within {0:?}")]
    Timeout(Duration),
}

impl From<GpuError> for PipelineError {
    fn from(e: GpuError) -> Self {
        match e {
            GpuError::Timeout(limit) => PipelineError::DeviceTimeout(limit),
            GpuError::BufferMapping(msg) => PipelineError::Device(msg),
            GpuError::FrameTooLarge { bytes, .. } => PipelineError::Allocation {
                bytes: bytes as usize,
            },
            other => PipelineError::ClassifierUnavailable(other.to_string()),
        }
    }
}

/// 参数结构 (16字节对齐)
#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct RedParams {
    width: u32,
    height: u32,
    total: u32,
    _padding: u32,
}

/// 缓存的输入缓冲区及其绑定组, 帧尺寸不变时复用
struct InputBinding {
    bytes: u64,
    buffer: wgpu::Buffer,
    bind_group: wgpu::BindGroup,
}

/// GPU 红色分类器
///
/// 设备/队列/管线只初始化一次, 由工作线程独占。
pub struct WgpuRedClassifier {
    device: wgpu::Device,
    queue: wgpu::Queue,
    analyze: wgpu::ComputePipeline,
    finalize: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
    params: wgpu::Buffer,
    output: wgpu::Buffer,
    input: Option<InputBinding>,
    max_binding: u64,
    timeout: Duration,
    lost: Arc<AtomicBool>,
}

impl WgpuRedClassifier {
    /// 选择适配器, 编译着色器, 创建两个计算管线
    ///
    /// 注意: 使用pollster::block_on内部处理异步,外部是同步调用
    pub fn new(timeout: Duration) -> std::result::Result<Self, GpuError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or(GpuError::NotAvailable)?;

        let adapter_info = adapter.get_info();
        debug!(
            name = %adapter_info.name,
            device_type = ?adapter_info.device_type,
            backend = ?adapter_info.backend,
            "GPU adapter found"
        );

        // 申请适配器支持的最大绑定尺寸, 8192x8192 帧需要 256MB
        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("redwatch"),
                required_features: wgpu::Features::empty(),
                required_limits: adapter.limits(),
                ..Default::default()
            },
            None,
        ))
        .map_err(|e| GpuError::DeviceRequest(e.to_string()))?;

        let lost = Arc::new(AtomicBool::new(false));
        {
            let lost = lost.clone();
            device.set_device_lost_callback(move |reason, message| {
                error!(?reason, %message, "GPU device lost");
                lost.store(true, Ordering::Release);
            });
        }
        device.on_uncaptured_error(Box::new(|e: wgpu::Error| {
            error!("uncaptured wgpu error: {}", e);
        }));

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Red Ratio Shader"),
            source: wgpu::ShaderSource::Wgsl(RED_RATIO_SHADER.into()),
        });
        let layout = create_bind_group_layout(&device);
        let analyze = create_pipeline(&device, &layout, &shader, "analyze_red_percentage");
        let finalize = create_pipeline(&device, &layout, &shader, "finalize_red_fraction");
        if let Some(e) = pollster::block_on(device.pop_error_scope()) {
            return Err(GpuError::ShaderCompilation(e.to_string()));
        }

        let params = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Red Params"),
            size: std::mem::size_of::<RedParams>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let output = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Red Output"),
            size: 8,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let limits = device.limits();
        let max_binding =
            (limits.max_storage_buffer_binding_size as u64).min(limits.max_buffer_size);

        info!(
            adapter = %adapter_info.name,
            max_binding,
            "GPU red classifier initialized"
        );

        Ok(Self {
            device,
            queue,
            analyze,
            finalize,
            layout,
            params,
            output,
            input: None,
            max_binding,
            timeout,
            lost,
        })
    }

    /// 上传像素并取回 (red_count, fraction)
    fn run(&mut self, image: &PixelBuffer) -> std::result::Result<(u32, f32), GpuError> {
        if self.lost.load(Ordering::Acquire) {
            return Err(GpuError::DeviceLost);
        }

        let pixels = image.as_bytes();
        let bytes = pixels.len() as u64;
        if bytes > self.max_binding || image.pixel_count() > u32::MAX as u64 {
            return Err(GpuError::FrameTooLarge {
                bytes,
                limit: self.max_binding,
            });
        }

        let binding = match self.input.take() {
            Some(binding) if binding.bytes == bytes => {
                self.queue.write_buffer(&binding.buffer, 0, pixels);
                binding
            }
            _ => self.bind_input(pixels),
        };

        let params = RedParams {
            width: image.width(),
            height: image.height(),
            total: image.pixel_count() as u32,
            _padding: 0,
        };
        self.queue
            .write_buffer(&self.params, 0, bytemuck::bytes_of(&params));
        self.queue.write_buffer(&self.output, 0, &[0u8; 8]);

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Red Readback"),
            size: 8,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Red Ratio Encoder"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Red Ratio Pass"),
                timestamp_writes: None,
            });
            pass.set_bind_group(0, &binding.bind_group, &[]);

            pass.set_pipeline(&self.analyze);
            pass.dispatch_workgroups(
                image.width().div_ceil(WORKGROUP_SIZE),
                image.height().div_ceil(WORKGROUP_SIZE),
                1,
            );

            pass.set_pipeline(&self.finalize);
            pass.dispatch_workgroups(1, 1, 1);
        }
        encoder.copy_buffer_to_buffer(&self.output, 0, &staging, 0, 8);
        self.queue.submit(Some(encoder.finish()));
        self.input = Some(binding);

        // 完成通知走 oneshot, 轮询到截止时间为止
        let slice = staging.slice(..);
        let (tx, mut rx) = futures::channel::oneshot::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });

        let deadline = Instant::now() + self.timeout;
        let mapped = loop {
            self.device.poll(wgpu::Maintain::Poll);
            match rx.try_recv() {
                Ok(Some(result)) => break result,
                Ok(None) => {}
                Err(_) => return Err(GpuError::BufferMapping("map callback dropped".into())),
            }
            if self.lost.load(Ordering::Acquire) {
                return Err(GpuError::DeviceLost);
            }
            if Instant::now() >= deadline {
                return Err(GpuError::Timeout(self.timeout));
            }
            std::thread::sleep(Duration::from_micros(200));
        };
        mapped.map_err(|e| GpuError::BufferMapping(e.to_string()))?;

        let data = slice.get_mapped_range();
        let words: [u32; 2] = [
            u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
        ];
        drop(data);
        staging.unmap();

        Ok((words[0], f32::from_bits(words[1])))
    }

    fn bind_input(&self, pixels: &[u8]) -> InputBinding {
        let buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Red Pixels"),
                contents: pixels,
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            });
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Red Ratio Bind Group"),
            layout: &self.layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.params.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: self.output.as_entire_binding(),
                },
            ],
        });
        debug!(bytes = pixels.len(), "GPU input buffer allocated");
        InputBinding {
            bytes: pixels.len() as u64,
            buffer,
            bind_group,
        }
    }
}

impl RedClassifier for WgpuRedClassifier {
    fn backend(&self) -> Backend {
        Backend::Gpu
    }

    /// 超出绑定上限的帧只在这一帧改用CPU计数, 后端保持GPU
    fn classify(&mut self, image: &PixelBuffer) -> Result<ClassificationResult> {
        match self.run(image) {
            Ok((red_count, fraction)) => {
                debug!(red_count, fraction, "GPU classification done");
                result_for(image, red_count as u64)
            }
            Err(GpuError::FrameTooLarge { bytes, limit }) => {
                debug!(bytes, limit, "frame exceeds GPU binding limit, counting on CPU");
                result_for(image, count_red(image.as_bytes()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn create_bind_group_layout(device: &wgpu::Device) -> wgpu::BindGroupLayout {
    let storage = |binding, read_only| wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    };
    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("Red Ratio Bind Group Layout"),
        entries: &[
            // 参数
            wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            },
            // 打包的RGBA像素
            storage(1, true),
            // 计数 + 比例
            storage(2, false),
        ],
    })
}

fn create_pipeline(
    device: &wgpu::Device,
    layout: &wgpu::BindGroupLayout,
    shader: &wgpu::ShaderModule,
    entry_point: &str,
) -> wgpu::ComputePipeline {
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some("Red Ratio Pipeline Layout"),
        bind_group_layouts: &[layout],
        push_constant_ranges: &[],
    });

    device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(entry_point),
        layout: Some(&pipeline_layout),
        module: shader,
        entry_point: Some(entry_point),
        compilation_options: wgpu::PipelineCompilationOptions::default(),
        cache: None,
    })
}

/// WGSL计算着色器
///
/// 像素按小端 u32 打包: R 在最低字节。所有线程都要到达屏障, 越界线程只跳过判定。
const RED_RATIO_SHADER: &str = r#"
struct RedParams {
    width: u32,
    height: u32,
    total: u32,
    _padding: u32,
}

struct RedOutput {
    red_count: atomic<u32>,
    fraction: f32,
}

@group(0) @binding(0) var<uniform> params: RedParams;
@group(0) @binding(1) var<storage, read> pixels: array<u32>;
@group(0) @binding(2) var<storage, read_write> result: RedOutput;

var<workgroup> local_count: atomic<u32>;

fn is_red(px: u32) -> bool {
    let r = px & 0xFFu;
    let g = (px >> 8u) & 0xFFu;
    let b = (px >> 16u) & 0xFFu;
    return r > 50u && g < 20u && b < 20u;
}

@compute @workgroup_size(16, 16)
fn analyze_red_percentage(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(local_invocation_index) lid: u32,
) {
    if (lid == 0u) {
        atomicStore(&local_count, 0u);
    }
    workgroupBarrier();

    if (gid.x < params.width && gid.y < params.height) {
        if (is_red(pixels[gid.y * params.width + gid.x])) {
            atomicAdd(&local_count, 1u);
        }
    }
    workgroupBarrier();

    if (lid == 0u) {
        let n = atomicLoad(&local_count);
        if (n > 0u) {
            atomicAdd(&result.red_count, n);
        }
    }
}

@compute @workgroup_size(1)
fn finalize_red_fraction() {
    let red = atomicLoad(&result.red_count);
    result.fraction = f32(red) / f32(params.total);
}
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::red_ratio::count_red_scalar;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn gpu() -> Option<WgpuRedClassifier> {
        match WgpuRedClassifier::new(Duration::from_secs(5)) {
            Ok(gpu) => Some(gpu),
            Err(e) => {
                eprintln!("skipping GPU test: {}", e);
                None
            }
        }
    }

    #[test]
    fn test_gpu_errors_map_to_pipeline_errors() {
        assert!(PipelineError::from(GpuError::NotAvailable).is_unavailable());
        assert!(PipelineError::from(GpuError::ShaderCompilation("x".into())).is_unavailable());
        assert!(PipelineError::from(GpuError::DeviceLost).is_unavailable());
        assert!(matches!(
            PipelineError::from(GpuError::Timeout(Duration::from_millis(10))),
            PipelineError::DeviceTimeout(_)
        ));
        let too_large = PipelineError::from(GpuError::FrameTooLarge { bytes: 64, limit: 32 });
        assert!(!too_large.is_unavailable());
    }

    #[test]
    fn test_oversized_frame_counted_on_cpu() {
        let Some(mut gpu) = gpu() else { return };
        gpu.max_binding = 16;
        let mut data = [255u8, 0, 0, 255].repeat(3);
        data.extend_from_slice(&[0, 0, 0, 255]);
        let image = PixelBuffer::from_rgba(2, 2, data.clone()).unwrap();
        // 16 字节恰好在上限内
        assert_eq!(gpu.classify(&image).unwrap().red_count(), 3);

        let wide = PixelBuffer::from_rgba(4, 2, data.repeat(2)).unwrap();
        let result = gpu.classify(&wide).unwrap();
        assert_eq!(result.red_count(), 6);
        assert_eq!(gpu.backend(), Backend::Gpu);
        // 下一帧仍走GPU
        assert_eq!(gpu.classify(&image).unwrap().red_count(), 3);
    }

    #[test]
    fn test_gpu_uniform_frames() {
        let Some(mut gpu) = gpu() else { return };
        let red = PixelBuffer::from_rgba(33, 17, [255u8, 0, 0, 255].repeat(33 * 17)).unwrap();
        let black = PixelBuffer::from_rgba(33, 17, [0u8, 0, 0, 255].repeat(33 * 17)).unwrap();
        assert_eq!(gpu.classify(&red).unwrap().percentage(), 100);
        assert_eq!(gpu.classify(&black).unwrap().percentage(), 0);
    }

    #[test]
    fn test_gpu_matches_scalar() {
        let Some(mut gpu) = gpu() else { return };
        let mut rng = StdRng::seed_from_u64(9);
        for (w, h) in [(1u32, 1u32), (16, 16), (100, 37), (640, 480)] {
            let data: Vec<u8> = (0..w * h)
                .flat_map(|_| {
                    [
                        rng.gen_range(40..=255u8),
                        rng.gen_range(0..40u8),
                        rng.gen_range(0..40u8),
                        255,
                    ]
                })
                .collect();
            let expected = count_red_scalar(&data);
            let image = PixelBuffer::from_rgba(w, h, data).unwrap();
            let result = gpu.classify(&image).unwrap();
            assert_eq!(result.red_count(), expected, "{}x{}", w, h);
        }
    }
}
