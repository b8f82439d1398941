mod agent;
mod config;
mod data;
mod environment;
mod gui;
mod model_artifacts;
mod pipeline;
mod plot;
mod runner;
mod worker;

use clap::{Parser, ValueEnum};
use config::{EPOCHS_DEFAULT, RunConfig, WINDOW_HEIGHT, WINDOW_TITLE, WINDOW_WIDTH};
use eframe::egui;
use pipeline::{DataSource, DqnPipeline, TradingPipeline};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug, ValueEnum)]
enum GuiRendererChoice {
    Auto,
    Wgpu,
    Glow,
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "DQN Trader: train a Deep Q-Network trading agent on daily stock history",
    after_help = "EXAMPLES:
    # Launch the window
    cargo run --release

    # One cycle without a window
    cargo run --release -- --headless --symbol AAPL --split-ratio 0.8 --epochs 5

    # Offline, on a seeded random walk
    cargo run --release -- --headless --symbol TEST --synthetic 400"
)]
struct Args {
    /// Run one train+test cycle without opening a window
    #[arg(long)]
    headless: bool,

    /// Ticker symbol for --headless
    #[arg(long)]
    symbol: Option<String>,

    /// Train/test split ratio for --headless
    #[arg(long, default_value_t = 0.8)]
    split_ratio: f64,

    /// Training epochs for --headless
    #[arg(long, default_value_t = EPOCHS_DEFAULT)]
    epochs: usize,

    /// Use this many synthetic daily rows instead of downloading history
    #[arg(long)]
    synthetic: Option<usize>,

    /// Seed for --synthetic
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// GUI renderer backend (auto|wgpu|glow). Useful for RDP compatibility.
    #[arg(long, value_enum, default_value_t = GuiRendererChoice::Wgpu)]
    gui_renderer: GuiRendererChoice,

    /// Enable GUI safe mode for remote desktop (disables vsync/MSAA and hardware acceleration).
    #[arg(long)]
    gui_safe_mode: bool,

    /// Directory for trained and success models (overrides DQN_TRADER_MODEL_DIR)
    #[arg(long)]
    model_dir: Option<std::path::PathBuf>,

    /// Do not write a JSON run log under log/
    #[arg(long)]
    no_run_log: bool,

    /// Use CUDA GPU acceleration (requires --features cuda at compile time)
    #[arg(long)]
    cuda: bool,
}

/// A plain blue tile so the window never falls back to the platform default icon.
fn window_icon() -> egui::IconData {
    const SIZE: u32 = 32;
    let mut rgba = Vec::with_capacity((SIZE * SIZE * 4) as usize);
    for y in 0..SIZE {
        for x in 0..SIZE {
            let edge = x < 2 || y < 2 || x >= SIZE - 2 || y >= SIZE - 2;
            let [r, g, b] = if edge { [226, 232, 240] } else { [59, 130, 246] };
            rgba.extend_from_slice(&[r, g, b, 255]);
        }
    }
    egui::IconData {
        rgba,
        width: SIZE,
        height: SIZE,
    }
}

fn native_options(args: &Args) -> eframe::NativeOptions {
    let mut options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_title(WINDOW_TITLE)
            .with_inner_size([WINDOW_WIDTH, WINDOW_HEIGHT])
            .with_icon(window_icon()),
        centered: true,
        ..Default::default()
    };
    options.renderer = match args.gui_renderer {
        GuiRendererChoice::Auto => eframe::Renderer::Wgpu,
        GuiRendererChoice::Wgpu => eframe::Renderer::Wgpu,
        GuiRendererChoice::Glow => eframe::Renderer::Glow,
    };

    if args.gui_safe_mode {
        options.vsync = false;
        options.multisampling = 0;
        options.depth_buffer = 0;
        options.stencil_buffer = 0;
        options.hardware_acceleration = eframe::HardwareAcceleration::Off;
    }
    options
}

fn build_pipeline(args: &Args) -> Arc<dyn TradingPipeline> {
    let source = match args.synthetic {
        Some(days) => DataSource::Synthetic {
            days,
            seed: args.seed,
        },
        None => DataSource::Yahoo,
    };
    let mut pipeline = DqnPipeline::new(source, args.cuda);
    if let Some(dir) = &args.model_dir {
        pipeline = pipeline.with_model_dir(dir);
    }
    if args.no_run_log {
        pipeline = pipeline.without_run_logs();
    }
    Arc::new(pipeline)
}

async fn run_headless(args: &Args, pipeline: Arc<dyn TradingPipeline>) {
    let Some(symbol) = args.symbol.as_deref() else {
        error!("--headless needs --symbol, e.g. --symbol AAPL");
        return;
    };
    let config = match RunConfig::new(symbol, args.split_ratio, args.epochs) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return;
        }
    };
    match worker::run_cycle(config, pipeline, None).await {
        Ok(bundle) => info!(
            "Final Fortune (Total): {:.2} Final Cash (Hold): {:.2}",
            bundle.final_fortune().unwrap_or_default(),
            bundle.final_cash().unwrap_or_default()
        ),
        Err(e) => error!("Training failed: {}", e),
    }
}

fn main() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("dqn_trader=info,wgpu_core=error,wgpu_hal=error"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
    let args = Args::parse();

    if args.cuda && !cfg!(feature = "cuda") {
        error!(
            "--cuda was requested, but this binary was compiled without CUDA support. Re-run with: cargo run --release --features cuda -- --cuda"
        );
        return Ok(());
    }

    let rt = worker::build_runtime()?;
    let pipeline = build_pipeline(&args);

    if args.headless {
        rt.block_on(run_headless(&args, pipeline));
        return Ok(());
    }

    info!(
        "Launching GUI with renderer: {:?}, safe_mode={}",
        args.gui_renderer, args.gui_safe_mode
    );
    let gui_result = {
        let _guard = rt.enter();
        eframe::run_native(
            WINDOW_TITLE,
            native_options(&args),
            Box::new(move |_cc| {
                Ok(Box::new(gui::GuiApp::new(gui::TraderController::new(
                    pipeline,
                ))))
            }),
        )
    };
    // A run still training on a blocking thread is abandoned with the window.
    rt.shutdown_background();
    gui_result.map_err(|e| anyhow::anyhow!("{}", e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_is_centered_at_default_size() {
        let args = Args::parse_from(["dqn-trader"]);
        let options = native_options(&args);
        assert!(options.centered);
        assert_eq!(
            options.viewport.inner_size,
            Some(egui::vec2(WINDOW_WIDTH, WINDOW_HEIGHT))
        );
        assert_eq!(options.viewport.title.as_deref(), Some(WINDOW_TITLE));
    }

    #[test]
    fn test_safe_mode_disables_acceleration() {
        let args = Args::parse_from(["dqn-trader", "--gui-safe-mode", "--gui-renderer", "glow"]);
        let options = native_options(&args);
        assert!(!options.vsync);
        assert_eq!(options.multisampling, 0);
        assert_eq!(options.renderer, eframe::Renderer::Glow);
    }

    #[test]
    fn test_headless_defaults() {
        let args = Args::parse_from(["dqn-trader", "--headless", "--symbol", "aapl"]);
        assert!(args.headless);
        assert_eq!(args.split_ratio, 0.8);
        assert_eq!(args.epochs, EPOCHS_DEFAULT);
        assert!(args.model_dir.is_none());
        assert!(!args.no_run_log);
    }
}
