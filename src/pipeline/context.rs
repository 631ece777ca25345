/// 流水线上下文: 解码器 + 分类器, 由工作线程独占
use tracing::warn;

use crate::analysis::red_ratio::best_cpu_classifier;
use crate::analysis::{create_classifier, Backend, ClassificationResult, RedClassifier};
use crate::config::PipelineConfig;
use crate::error::Result;
use crate::input::{Frame, ImageDecoder};

pub struct PipelineContext {
    decoder: ImageDecoder,
    classifier: Box<dyn RedClassifier>,
    demoted: bool,
}

impl PipelineContext {
    pub fn new(config: &PipelineConfig) -> Self {
        Self::with_classifier(create_classifier(config.backend, config.gpu_timeout()))
    }

    pub fn with_classifier(classifier: Box<dyn RedClassifier>) -> Self {
        Self {
            decoder: ImageDecoder::new(),
            classifier,
            demoted: false,
        }
    }

    pub fn backend(&self) -> Backend {
        self.classifier.backend()
    }

    pub fn decoder(&self) -> &ImageDecoder {
        &self.decoder
    }

    /// 单帧: 解码 → 分类
    ///
    /// 分类器报告不可用时永久降级到CPU, 并用CPU重算本帧。
    pub fn analyze(&mut self, frame: Frame) -> Result<ClassificationResult> {
        let image = self.decoder.decode(frame)?;
        match self.classifier.classify(&image) {
            Err(e) if e.is_unavailable() && !self.demoted => {
                warn!(
                    from = %self.classifier.backend(),
                    "classifier unavailable, demoting to CPU: {}",
                    e
                );
                self.classifier = best_cpu_classifier();
                self.demoted = true;
                self.classifier.classify(&image)
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::input::PixelFormat;

    struct UnavailableClassifier;

    impl RedClassifier for UnavailableClassifier {
        fn backend(&self) -> Backend {
            Backend::Gpu
        }

        fn classify(
            &mut self,
            _image: &crate::input::PixelBuffer,
        ) -> Result<ClassificationResult> {
            Err(PipelineError::ClassifierUnavailable("shader rejected".into()))
        }
    }

    /// 依次返回设备超时/设备错误/分配失败
    struct FailingGpuClassifier {
        calls: u32,
    }

    impl RedClassifier for FailingGpuClassifier {
        fn backend(&self) -> Backend {
            Backend::Gpu
        }

        fn classify(
            &mut self,
            _image: &crate::input::PixelBuffer,
        ) -> Result<ClassificationResult> {
            self.calls += 1;
            Err(match self.calls % 3 {
                1 => PipelineError::DeviceTimeout(std::time::Duration::from_millis(5)),
                2 => PipelineError::Device("map failed".into()),
                _ => PipelineError::Allocation { bytes: 16 },
            })
        }
    }

    fn red_frame(frame_id: u64) -> Frame {
        Frame::new(frame_id, 2, 2, PixelFormat::Rgba8, [255u8, 0, 0, 255].repeat(4))
    }

    #[test]
    fn test_analyze_counts_red_pixels() {
        let mut context = PipelineContext::with_classifier(Box::new(
            crate::analysis::ScalarClassifier,
        ));
        let result = context.analyze(red_frame(0)).unwrap();
        assert_eq!(result.percentage(), 100);
        assert_eq!(context.decoder().decoded_frames(), 1);
    }

    #[test]
    fn test_unavailable_classifier_falls_back_to_cpu() {
        let mut context = PipelineContext::with_classifier(Box::new(UnavailableClassifier));
        assert_eq!(context.backend(), Backend::Gpu);

        let result = context.analyze(red_frame(0)).unwrap();
        assert_eq!(result.percentage(), 100);
        assert!(context.backend().is_cpu());

        // 降级是永久的
        assert!(context.analyze(red_frame(1)).is_ok());
        assert!(context.backend().is_cpu());
    }

    #[test]
    fn test_per_frame_device_errors_do_not_demote() {
        let mut context =
            PipelineContext::with_classifier(Box::new(FailingGpuClassifier { calls: 0 }));
        assert!(matches!(
            context.analyze(red_frame(0)),
            Err(PipelineError::DeviceTimeout(_))
        ));
        assert!(matches!(
            context.analyze(red_frame(1)),
            Err(PipelineError::Device(_))
        ));
        assert!(matches!(
            context.analyze(red_frame(2)),
            Err(PipelineError::Allocation { .. })
        ));
        assert_eq!(context.backend(), Backend::Gpu);
    }

    #[test]
    fn test_decode_error_keeps_classifier() {
        let mut context = PipelineContext::with_classifier(Box::new(
            crate::analysis::ScalarClassifier,
        ));
        let bad = Frame::new(0, 2, 2, PixelFormat::Rgba8, vec![0; 3]);
        assert!(matches!(context.analyze(bad), Err(PipelineError::Decode(_))));
        assert_eq!(context.backend(), Backend::Scalar);
    }
}
