/// 视频输入系统 (Video Input System)
///
/// - Frame/PixelFormat: 采集帧与像素格式
/// - FrameThrottle: 每第N帧才进入分析
/// - ImageDecoder: 采集帧 → RGBA8 像素缓冲 (缓冲池复用)
/// - FrameSource: 帧源接口 (合成帧/静态图片)
pub mod decoder;
pub mod frame;
pub mod source;
pub mod throttle;

pub use decoder::{ImageDecoder, MAX_FRAME_SIDE};
pub use frame::{Frame, PixelBuffer, PixelFormat};
pub use source::{FrameSource, StillImageSource, SyntheticSource};
pub use throttle::{should_process, FrameThrottle, DEFAULT_THROTTLE_INTERVAL};
