//! 流水线配置 - JSON文件 + 命令行覆盖

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, ValueEnum};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::input::DEFAULT_THROTTLE_INTERVAL;

/// 分类后端偏好
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendPreference {
    /// GPU 优先, 否则最快的CPU实现
    #[default]
    Auto,
    /// 标量CPU
    Cpu,
    /// AVX2 CPU
    Simd,
    /// GPU (需要 `gpu` feature)
    Gpu,
}

/// 流水线参数配置
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub throttle_interval: u32,      // 每N帧处理一帧
    pub alarm_threshold: u8,         // 报警阈值 (百分比, 严格大于)
    pub backend: BackendPreference,  // 分类后端
    pub gpu_timeout_ms: u64,         // GPU完成等待上限
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            throttle_interval: DEFAULT_THROTTLE_INTERVAL,
            alarm_threshold: 50,
            backend: BackendPreference::Auto,
            gpu_timeout_ms: 2000,
        }
    }
}

impl PipelineConfig {
    /// 从JSON文件加载配置
    ///
    /// 解析失败时使用默认值; 文件不存在时写出一份默认配置。
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(json) => match serde_json::from_str(&json) {
                Ok(config) => {
                    info!(path = %path.display(), "config loaded");
                    Self::sanitized(config)
                }
                Err(e) => {
                    warn!(path = %path.display(), "config parse failed, using defaults: {}", e);
                    Self::default()
                }
            },
            Err(_) => {
                info!(path = %path.display(), "config not found, writing defaults");
                let config = Self::default();
                if let Err(e) = config.save(path) {
                    warn!("failed to save default config: {}", e);
                }
                config
            }
        }
    }

    /// 阈值超出 0..=100 时截到 100
    fn sanitized(mut config: Self) -> Self {
        if config.alarm_threshold > 100 {
            warn!(
                alarm_threshold = config.alarm_threshold,
                "alarm threshold above 100, clamped"
            );
            config.alarm_threshold = 100;
        }
        config
    }

    /// 保存配置到JSON文件
    pub fn save(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path.as_ref(), json)?;
        info!(path = %path.as_ref().display(), "config saved");
        Ok(())
    }

    pub fn gpu_timeout(&self) -> Duration {
        Duration::from_millis(self.gpu_timeout_ms)
    }

    /// 命令行参数覆盖文件中的值
    pub fn apply(&mut self, overrides: &ConfigArgs) {
        if let Some(interval) = overrides.throttle_interval {
            self.throttle_interval = interval;
        }
        if let Some(threshold) = overrides.alarm_threshold {
            self.alarm_threshold = threshold;
        }
        if let Some(backend) = overrides.backend {
            self.backend = backend;
        }
        if let Some(timeout) = overrides.gpu_timeout_ms {
            self.gpu_timeout_ms = timeout;
        }
    }

    /// 打印当前配置
    pub fn log_summary(&self) {
        info!(
            throttle_interval = self.throttle_interval,
            alarm_threshold = self.alarm_threshold,
            backend = ?self.backend,
            gpu_timeout_ms = self.gpu_timeout_ms,
            "pipeline config"
        );
    }
}

/// 可由命令行覆盖的配置项
#[derive(Args, Debug, Clone, Default)]
pub struct ConfigArgs {
    /// 配置文件路径
    #[arg(long, default_value = "redwatch.json")]
    pub config: PathBuf,

    /// 每N帧分析一帧
    #[arg(long)]
    pub throttle_interval: Option<u32>,

    /// 报警阈值 (0-100)
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=100))]
    pub alarm_threshold: Option<u8>,

    /// 分类后端
    #[arg(long, value_enum)]
    pub backend: Option<BackendPreference>,

    /// GPU等待超时 (毫秒)
    #[arg(long)]
    pub gpu_timeout_ms: Option<u64>,
}

impl ConfigArgs {
    /// 加载配置文件并应用命令行覆盖
    pub fn resolve(&self) -> PipelineConfig {
        let mut config = PipelineConfig::load(&self.config);
        config.apply(self);
        config
    }
}
