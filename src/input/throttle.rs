/// 帧节流器 (Frame Throttle)
///
/// 实时逐像素分析代价太高,只处理每第 N 帧。

/// 默认节流间隔: 每10帧处理一次
pub const DEFAULT_THROTTLE_INTERVAL: u32 = 10;

/// 计数器是否命中处理帧 (O(1), 纯函数)
#[inline]
pub fn should_process(counter: u64, interval: u32) -> bool {
    interval <= 1 || counter % interval as u64 == 0
}

#[derive(Debug, Clone)]
pub struct FrameThrottle {
    interval: u32,
    counter: u64,
}

impl FrameThrottle {
    /// `interval` 为 0 时按 1 处理 (每帧都处理)
    pub fn new(interval: u32) -> Self {
        Self {
            interval: interval.max(1),
            counter: 0,
        }
    }

    pub fn interval(&self) -> u32 {
        self.interval
    }

    /// 返回本帧的计数值与是否处理,然后计数器回绕自增
    pub fn tick(&mut self) -> (u64, bool) {
        let counter = self.counter;
        self.counter = self.counter.wrapping_add(1);
        (counter, should_process(counter, self.interval))
    }
}

impl Default for FrameThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_THROTTLE_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_tenth_frame_of_thirty() {
        let processed: Vec<u64> = (0..30).filter(|&c| should_process(c, 10)).collect();
        assert_eq!(processed, vec![0, 10, 20]);
    }

    #[test]
    fn test_tick_matches_pure_policy() {
        let mut throttle = FrameThrottle::default();
        let processed: Vec<u64> = (0..30)
            .map(|_| throttle.tick())
            .filter(|&(_, run)| run)
            .map(|(c, _)| c)
            .collect();
        assert_eq!(processed, vec![0, 10, 20]);
    }

    #[test]
    fn test_zero_interval_processes_every_frame() {
        let mut throttle = FrameThrottle::new(0);
        assert_eq!(throttle.interval(), 1);
        assert!((0..5).all(|_| throttle.tick().1));
    }

    #[test]
    fn test_counter_wraps_on_overflow() {
        let mut throttle = FrameThrottle {
            interval: 10,
            counter: u64::MAX,
        };
        assert_eq!(throttle.tick().0, u64::MAX);
        assert_eq!(throttle.tick(), (0, true));
    }
}
