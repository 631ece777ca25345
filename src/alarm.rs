//! 报警触发 (Alarm Trigger)
//!
//! 百分比严格大于阈值时循环播放报警音, 回落到阈值及以下时暂停。无迟滞。

use thiserror::Error;
use tracing::{info, warn};

use crate::pipeline::{PercentageSubscriber, PercentageUpdate};

/// 默认报警阈值 (百分比)
pub const DEFAULT_ALARM_THRESHOLD: u8 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmState {
    Idle,
    Alerting,
}

/// 报警音加载失败
#[derive(Debug, Error)]
pub enum AlarmError {
    #[error("alert sound not found: {0}")]
    SoundMissing(String),

    #[error("audio output unavailable: {0}")]
    Output(String),
}

/// 音频输出 (平台播放器由调用方提供)
pub trait AudioSink: Send {
    /// 预加载报警音, 构造时调用一次
    fn load(&mut self) -> Result<(), AlarmError>;
    fn play(&mut self);
    fn pause(&mut self);
}

/// 只写日志的音频输出
#[derive(Debug, Default)]
pub struct LogAudioSink {
    playing: bool,
}

impl AudioSink for LogAudioSink {
    fn load(&mut self) -> Result<(), AlarmError> {
        info!("alert sound ready");
        Ok(())
    }

    fn play(&mut self) {
        if !self.playing {
            self.playing = true;
            warn!("🔊 red alert: playing alarm");
        }
    }

    fn pause(&mut self) {
        if self.playing {
            self.playing = false;
            info!("🔇 alarm paused");
        }
    }
}

pub struct AlarmTrigger<S: AudioSink> {
    sink: S,
    threshold: u8,
    state: AlarmState,
}

impl<S: AudioSink> AlarmTrigger<S> {
    pub fn new(mut sink: S, threshold: u8) -> Self {
        if let Err(e) = sink.load() {
            warn!("alert sound failed to load: {}", e);
        }
        Self {
            sink,
            threshold,
            state: AlarmState::Idle,
        }
    }

    pub fn state(&self) -> AlarmState {
        self.state
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// 按新百分比求状态, 状态变化时驱动音频
    pub fn evaluate(&mut self, percentage: u8) -> AlarmState {
        let next = if percentage > self.threshold {
            AlarmState::Alerting
        } else {
            AlarmState::Idle
        };
        if next != self.state {
            match next {
                AlarmState::Alerting => self.sink.play(),
                AlarmState::Idle => self.sink.pause(),
            }
            info!(percentage, threshold = self.threshold, state = ?next, "alarm state changed");
            self.state = next;
        }
        next
    }
}

impl<S: AudioSink> PercentageSubscriber for AlarmTrigger<S> {
    fn on_percentage(&mut self, update: PercentageUpdate) {
        self.evaluate(update.percentage);
    }
}
