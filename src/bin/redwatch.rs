/// 红色占比监控 (Red Watch)
///
/// 系统架构:
/// 1. 主线程:   帧源按帧率采集并投递 (节流 + 单槽邮箱)
/// 2. 分析线程: 解码 → 红色判定 → 百分比上报 → 报警
/// 3. 标签线程: 打印 "% of red N"
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use clap::{Parser, ValueEnum};
use mimalloc::MiMalloc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use redwatch_rs::input::{StillImageSource, SyntheticSource};
use redwatch_rs::{
    AlarmTrigger, ConfigArgs, FramePipeline, FrameSource, LogAudioSink, PipelineContext,
    PixelFormat, RatioReporter,
};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// 合成帧像素格式
#[derive(Debug, Clone, Copy, ValueEnum)]
enum SourceFormat {
    Rgba,
    Bgra,
    Yuv420p,
    Nv12,
}

impl From<SourceFormat> for PixelFormat {
    fn from(format: SourceFormat) -> Self {
        match format {
            SourceFormat::Rgba => PixelFormat::Rgba8,
            SourceFormat::Bgra => PixelFormat::Bgra8,
            SourceFormat::Yuv420p => PixelFormat::Yuv420p,
            SourceFormat::Nv12 => PixelFormat::Nv12,
        }
    }
}

/// 红色占比监控参数
#[derive(Parser, Debug)]
#[command(author, version, about = "实时红色像素占比监控", long_about = None)]
struct Cli {
    /// 静态图片 (不指定则使用合成帧)
    #[arg(short, long)]
    image: Option<PathBuf>,

    /// 合成帧格式
    #[arg(long, value_enum, default_value = "nv12")]
    format: SourceFormat,

    /// 合成帧宽度
    #[arg(long, default_value_t = 640)]
    width: u32,

    /// 合成帧高度
    #[arg(long, default_value_t = 480)]
    height: u32,

    /// 合成帧随机种子
    #[arg(long, default_value_t = 7)]
    seed: u64,

    /// 采集总帧数
    #[arg(short = 'n', long, default_value_t = 600)]
    frames: u64,

    /// 采集帧率
    #[arg(long, default_value_t = 60)]
    fps: u32,

    #[command(flatten)]
    config: ConfigArgs,
}

fn main() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();
    let config = cli.config.resolve();
    config.log_summary();

    let mut source: Box<dyn FrameSource> = match &cli.image {
        Some(path) => Box::new(
            StillImageSource::open(path)
                .with_context(|| format!("failed to open {}", path.display()))?
                .with_limit(cli.frames),
        ),
        None => {
            info!(
                width = cli.width,
                height = cli.height,
                format = ?cli.format,
                "using synthetic frames"
            );
            Box::new(
                SyntheticSource::new(cli.width, cli.height, cli.format.into(), cli.seed)
                    .with_limit(cli.frames),
            )
        }
    };

    // ========== 订阅者 ==========
    let (label_tx, label_rx) = crossbeam_channel::bounded(16);
    let mut reporter = RatioReporter::new();
    reporter.subscribe(Box::new(label_tx));
    reporter.subscribe(Box::new(AlarmTrigger::new(
        LogAudioSink::default(),
        config.alarm_threshold,
    )));

    // ========== 启动分析线程 ==========
    let context = PipelineContext::new(&config);
    let mut pipeline = FramePipeline::spawn(context, reporter, config.throttle_interval)
        .context("failed to start analysis worker")?;
    let latest = pipeline.latest();

    // ========== 标签线程 ==========
    let label = std::thread::Builder::new()
        .name("redwatch-label".into())
        .spawn(move || {
            for update in label_rx.iter() {
                println!("% of red {}", update.percentage);
            }
        })
        .context("failed to start label thread")?;

    // ========== 采集循环 ==========
    let frame_interval = Duration::from_secs_f64(1.0 / cli.fps.max(1) as f64);
    let mut next_due = Instant::now();
    while let Some(frame) = source.next_frame() {
        let now = Instant::now();
        if next_due > now {
            std::thread::sleep(next_due - now);
        }
        next_due += frame_interval;
        pipeline.submit(frame);
    }

    let stats = pipeline.shutdown();
    label.join().map_err(|_| anyhow!("label thread panicked"))?;

    info!(
        submitted = stats.submitted,
        throttled = stats.throttled,
        replaced = stats.replaced,
        processed = stats.processed,
        failed = stats.failed,
        last = ?latest.get(),
        "capture finished"
    );
    Ok(())
}
