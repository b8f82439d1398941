use crate::config::{
    ConfigDraft, EPOCHS_DEFAULT, EPOCHS_MAX, EPOCHS_MIN, SPLIT_RATIO_DEFAULT, SPLIT_RATIO_MAX,
    SPLIT_RATIO_MIN, SPLIT_RATIO_STEP, WINDOW_TITLE,
};
use crate::pipeline::TradingPipeline;
use crate::plot::TradeChart;
use crate::worker::{self, RunHandle, RunResult, WorkerEvent};
use eframe::egui;
use egui_plot::{Line, Plot, PlotPoints};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{info, warn};

const ACCENT_BLUE: egui::Color32 = egui::Color32::from_rgb(59, 130, 246);
const ACCENT_GREEN: egui::Color32 = egui::Color32::from_rgb(34, 197, 94);
const ACCENT_RED: egui::Color32 = egui::Color32::from_rgb(239, 68, 68);
const ACCENT_YELLOW: egui::Color32 = egui::Color32::from_rgb(250, 204, 21);
const ACCENT_CYAN: egui::Color32 = egui::Color32::from_rgb(34, 211, 238);

const BG_DARK: egui::Color32 = egui::Color32::from_rgb(15, 15, 20);
const BG_CARD: egui::Color32 = egui::Color32::from_rgb(24, 24, 32);
const BG_ELEVATED: egui::Color32 = egui::Color32::from_rgb(32, 32, 44);
const TEXT_PRIMARY: egui::Color32 = egui::Color32::from_rgb(226, 232, 240);
const TEXT_SECONDARY: egui::Color32 = egui::Color32::from_rgb(148, 163, 184);
const BORDER_SUBTLE: egui::Color32 = egui::Color32::from_rgb(51, 51, 68);

const MAX_LOG_LINES: usize = 500;

// ──────────────────────────────────────────────────────────────────────────────
// Window state
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Training,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusTone {
    Info,
    Busy,
    Success,
    Error,
}

/// Everything the window shows, minus the drawing. Owns at most one run.
pub struct TraderController {
    pipeline: Arc<dyn TradingPipeline>,
    draft: ConfigDraft,
    state: RunState,
    run: Option<RunHandle>,
    pub symbol_label: String,
    pub split_ratio_label: String,
    pub epochs_label: String,
    pub status: String,
    pub tone: StatusTone,
    pub progress: Option<String>,
    /// `[episode, fortune]` of the run in flight.
    pub episode_fortunes: Vec<[f64; 2]>,
    /// Newest last, capped at `MAX_LOG_LINES`.
    pub log: VecDeque<String>,
    pub chart: TradeChart,
    completed_runs: usize,
}

impl TraderController {
    pub fn new(pipeline: Arc<dyn TradingPipeline>) -> Self {
        Self {
            pipeline,
            draft: ConfigDraft::default(),
            state: RunState::Idle,
            run: None,
            symbol_label: "Symbol (example: AAPL)".to_string(),
            split_ratio_label: "Split Ratio".to_string(),
            epochs_label: "Train Epochs".to_string(),
            status: "Wait to start training...".to_string(),
            tone: StatusTone::Info,
            progress: None,
            episode_fortunes: Vec::new(),
            log: VecDeque::with_capacity(MAX_LOG_LINES),
            chart: TradeChart::placeholder(),
            completed_runs: 0,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn can_start(&self) -> bool {
        self.state == RunState::Idle && self.run.is_none()
    }

    pub fn completed_runs(&self) -> usize {
        self.completed_runs
    }

    pub fn draft(&self) -> &ConfigDraft {
        &self.draft
    }

    fn set_status(&mut self, tone: StatusTone, status: impl Into<String>) {
        self.tone = tone;
        self.status = status.into();
    }

    fn push_log(&mut self, line: String) {
        if self.log.len() >= MAX_LOG_LINES {
            self.log.pop_front();
        }
        self.log.push_back(line);
    }

    /// Blank input is ignored, like a cancelled dialog.
    pub fn set_symbol(&mut self, raw: &str) {
        if let Some(symbol) = self.draft.set_symbol(raw) {
            self.symbol_label = format!("Symbol: {}", symbol);
        }
    }

    pub fn set_split_ratio(&mut self, raw: f64) {
        match self.draft.set_split_ratio(raw) {
            Ok(ratio) => self.split_ratio_label = format!("Split Ratio: {}", ratio),
            Err(e) => {
                warn!("Rejected split ratio: {}", e);
                self.set_status(StatusTone::Error, e.to_string());
            }
        }
    }

    pub fn set_epochs(&mut self, raw: usize) {
        match self.draft.set_epochs(raw) {
            Ok(epochs) => self.epochs_label = format!("Epochs: {}", epochs),
            Err(e) => {
                warn!("Rejected epochs: {}", e);
                self.set_status(StatusTone::Error, e.to_string());
            }
        }
    }

    /// Spawns a run if the start action is enabled. Returns whether one was spawned.
    pub fn start(&mut self) -> bool {
        if !self.can_start() {
            return false;
        }
        let config = match self.draft.to_run_config() {
            Ok(config) => config,
            Err(e) => {
                warn!("Cannot start training: {}", e);
                self.set_status(StatusTone::Error, e.to_string());
                return false;
            }
        };

        info!(
            "Starting run: symbol={}, split_ratio={}, epochs={}",
            config.symbol, config.split_ratio, config.epochs
        );
        self.set_status(StatusTone::Busy, "Start training. Please wait for a moment...");
        self.progress = None;
        self.episode_fortunes.clear();
        self.log.clear();
        self.state = RunState::Training;
        self.run = Some(worker::spawn_run(config, self.pipeline.clone()));
        true
    }

    /// Drains progress and, when the run has finished, applies its result.
    /// Call once per frame.
    pub fn poll(&mut self) {
        let Some(run) = self.run.as_mut() else {
            return;
        };
        let events = run.drain_progress();
        let result = run.poll();

        for event in events {
            match event {
                WorkerEvent::Episode {
                    episode,
                    epochs,
                    total_reward,
                    fortune,
                } => {
                    self.episode_fortunes.push([episode as f64, fortune]);
                    let line = format!(
                        "Episode {}/{}: Complete! Fortune: {:.2} (reward {:.4})",
                        episode, epochs, fortune, total_reward
                    );
                    self.progress = Some(line.clone());
                    self.push_log(line);
                }
                WorkerEvent::Log(msg) => self.push_log(msg),
            }
        }

        if let Some(result) = result {
            self.on_result(result);
        }
    }

    pub fn on_result(&mut self, result: RunResult) {
        self.run = None;
        self.state = RunState::Idle;
        self.completed_runs += 1;

        match result {
            Ok(bundle) => {
                let fortune = bundle.final_fortune().unwrap_or_default();
                let cash = bundle.final_cash().unwrap_or_default();
                self.set_status(
                    StatusTone::Success,
                    format!(
                        "Completed! Final Fortune (Total): {:.2} Final Cash (Hold): {:.2}",
                        fortune, cash
                    ),
                );
                self.chart = TradeChart::new(&bundle.test_data, &bundle.actions);
            }
            Err(e) => {
                self.set_status(StatusTone::Error, format!("Training failed: {}", e));
            }
        }
        self.progress = None;
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Input dialogs
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
enum Dialog {
    Symbol(String),
    SplitRatio(f64),
    Epochs(usize),
}

enum DialogOutcome {
    Pending,
    Cancelled,
    Accepted,
}

pub struct GuiApp {
    controller: TraderController,
    dialog: Option<Dialog>,
}

impl GuiApp {
    pub fn new(controller: TraderController) -> Self {
        Self {
            controller,
            dialog: None,
        }
    }

    fn apply_theme(ctx: &egui::Context) {
        let mut style = (*ctx.style()).clone();

        style.visuals.window_rounding = egui::Rounding::same(8.0);
        style.visuals.widgets.inactive.rounding = egui::Rounding::same(6.0);
        style.visuals.widgets.active.rounding = egui::Rounding::same(6.0);
        style.visuals.widgets.hovered.rounding = egui::Rounding::same(6.0);

        style.visuals.dark_mode = true;
        style.visuals.panel_fill = BG_DARK;
        style.visuals.window_fill = BG_CARD;
        style.visuals.faint_bg_color = BG_ELEVATED;

        style.visuals.widgets.noninteractive.fg_stroke = egui::Stroke::new(1.0, TEXT_SECONDARY);
        style.visuals.widgets.inactive.bg_fill = BG_ELEVATED;
        style.visuals.widgets.inactive.fg_stroke = egui::Stroke::new(1.0, TEXT_PRIMARY);
        style.visuals.widgets.hovered.bg_fill = egui::Color32::from_rgb(45, 45, 60);
        style.visuals.widgets.active.bg_fill = ACCENT_BLUE;

        style.spacing.item_spacing = egui::vec2(10.0, 10.0);

        ctx.set_style(style);
    }

    fn open_dialog(&mut self, dialog: Dialog) {
        if self.dialog.is_none() {
            self.dialog = Some(dialog);
        }
    }

    fn render_dialog(&mut self, ctx: &egui::Context) {
        let Some(dialog) = self.dialog.as_mut() else {
            return;
        };
        let title = match dialog {
            Dialog::Symbol(_) => "Symbol",
            Dialog::SplitRatio(_) => "Split Ratio",
            Dialog::Epochs(_) => "Epochs",
        };

        let mut open = true;
        let mut outcome = DialogOutcome::Pending;
        egui::Window::new(title)
            .anchor(egui::Align2::CENTER_CENTER, egui::vec2(0.0, 0.0))
            .collapsible(false)
            .resizable(false)
            .auto_sized()
            .open(&mut open)
            .show(ctx, |ui| {
                ui.set_min_width(220.0);
                let mut submitted = false;
                match dialog {
                    Dialog::Symbol(text) => {
                        ui.label("Name:");
                        let response = ui.add(
                            egui::TextEdit::singleline(text)
                                .hint_text("e.g. AAPL")
                                .desired_width(200.0),
                        );
                        response.request_focus();
                        submitted = response.lost_focus() && ui.input(|i| i.key_pressed(egui::Key::Enter));
                    }
                    Dialog::SplitRatio(value) => {
                        ui.label("Value:");
                        ui.add(
                            egui::DragValue::new(value)
                                .range((SPLIT_RATIO_MIN + SPLIT_RATIO_STEP)..=SPLIT_RATIO_MAX)
                                .speed(SPLIT_RATIO_STEP)
                                .fixed_decimals(1),
                        );
                    }
                    Dialog::Epochs(value) => {
                        ui.label("Value:");
                        ui.add(
                            egui::DragValue::new(value)
                                .range(EPOCHS_MIN..=EPOCHS_MAX)
                                .speed(1.0),
                        );
                    }
                }
                ui.add_space(6.0);
                ui.horizontal(|ui| {
                    if ui.button("Cancel").clicked() {
                        outcome = DialogOutcome::Cancelled;
                    }
                    if ui.button("OK").clicked() || submitted {
                        outcome = DialogOutcome::Accepted;
                    }
                });
            });

        if !open || ui_escape_pressed(ctx) {
            outcome = DialogOutcome::Cancelled;
        }

        match outcome {
            DialogOutcome::Pending => {}
            DialogOutcome::Cancelled => self.dialog = None,
            DialogOutcome::Accepted => {
                match self.dialog.take() {
                    Some(Dialog::Symbol(text)) => self.controller.set_symbol(&text),
                    Some(Dialog::SplitRatio(value)) => self.controller.set_split_ratio(value),
                    Some(Dialog::Epochs(value)) => self.controller.set_epochs(value),
                    None => {}
                }
            }
        }
    }

    fn render_inputs(&mut self, ui: &mut egui::Ui) {
        let mut requested = None;
        egui::Grid::new("inputs")
            .num_columns(2)
            .spacing([10.0, 10.0])
            .min_col_width(200.0)
            .show(ui, |ui| {
                ui.label(egui::RichText::new(&self.controller.symbol_label).color(TEXT_PRIMARY));
                if ui.button("Input").clicked() {
                    requested = Some(Dialog::Symbol(String::new()));
                }
                ui.end_row();

                ui.label(egui::RichText::new(&self.controller.split_ratio_label).color(TEXT_PRIMARY));
                if ui.button("Input").clicked() {
                    let current = self.controller.draft().split_ratio.unwrap_or(SPLIT_RATIO_DEFAULT);
                    requested = Some(Dialog::SplitRatio(current));
                }
                ui.end_row();

                ui.label(egui::RichText::new(&self.controller.epochs_label).color(TEXT_PRIMARY));
                if ui.button("Input").clicked() {
                    let current = self.controller.draft().epochs.unwrap_or(EPOCHS_DEFAULT);
                    requested = Some(Dialog::Epochs(current));
                }
                ui.end_row();
            });

        if let Some(dialog) = requested {
            self.open_dialog(dialog);
        }
    }

    fn render_start(&mut self, ui: &mut egui::Ui) {
        let enabled = self.controller.can_start();
        let btn = ui.add_enabled(
            enabled,
            egui::Button::new(
                egui::RichText::new(if enabled { "Start" } else { "Training..." })
                    .size(14.0)
                    .strong()
                    .color(egui::Color32::WHITE),
            )
            .fill(if enabled { ACCENT_GREEN } else { BG_ELEVATED })
            .rounding(egui::Rounding::same(6.0))
            .min_size(egui::vec2(ui.available_width(), 32.0)),
        );
        if btn.clicked() {
            self.controller.start();
        }
    }

    fn render_status(&self, ui: &mut egui::Ui) {
        let color = match self.controller.tone {
            StatusTone::Info => TEXT_SECONDARY,
            StatusTone::Busy => ACCENT_YELLOW,
            StatusTone::Success => ACCENT_GREEN,
            StatusTone::Error => ACCENT_RED,
        };
        ui.horizontal(|ui| {
            if self.controller.state() == RunState::Training {
                ui.spinner();
            }
            ui.label(egui::RichText::new(&self.controller.status).color(color));
        });
        if let Some(progress) = &self.controller.progress {
            ui.label(egui::RichText::new(progress).size(11.0).color(ACCENT_CYAN));
        }
    }

    fn render_training_log(&self, ui: &mut egui::Ui) {
        egui::CollapsingHeader::new("Training log")
            .default_open(false)
            .show(ui, |ui| {
                if !self.controller.episode_fortunes.is_empty() {
                    Plot::new("episode_fortunes")
                        .x_axis_label("Episode")
                        .y_axis_label("Fortune")
                        .height(120.0)
                        .show(ui, |plot_ui| {
                            plot_ui.line(
                                Line::new(PlotPoints::from(self.controller.episode_fortunes.clone()))
                                    .name("Training fortune")
                                    .color(ACCENT_CYAN)
                                    .width(2.0),
                            );
                        });
                }
                egui::ScrollArea::vertical()
                    .max_height(120.0)
                    .stick_to_bottom(true)
                    .show(ui, |ui| {
                        for line in &self.controller.log {
                            ui.label(
                                egui::RichText::new(line)
                                    .size(10.0)
                                    .color(TEXT_SECONDARY)
                                    .family(egui::FontFamily::Monospace),
                            );
                        }
                    });
            });
    }
}

fn ui_escape_pressed(ctx: &egui::Context) -> bool {
    ctx.input(|i| i.key_pressed(egui::Key::Escape))
}

impl eframe::App for GuiApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        Self::apply_theme(ctx);
        self.controller.poll();
        if self.controller.state() == RunState::Training {
            ctx.request_repaint();
        }

        egui::TopBottomPanel::top("top_bar").show(ctx, |ui| {
            ui.add_space(4.0);
            ui.horizontal(|ui| {
                ui.add_space(8.0);
                ui.label(egui::RichText::new(WINDOW_TITLE)
                    .size(18.0)
                    .strong()
                    .color(ACCENT_BLUE));
                ui.with_layout(egui::Layout::right_to_left(egui::Align::Center), |ui| {
                    ui.add_space(8.0);
                    ui.label(
                        egui::RichText::new(format!("Runs: {}", self.controller.completed_runs()))
                            .size(11.0)
                            .color(TEXT_SECONDARY),
                    );
                });
            });
            ui.add_space(4.0);
        });

        egui::CentralPanel::default().show(ctx, |ui| {
            let modal_open = self.dialog.is_some();
            ui.add_enabled_ui(!modal_open, |ui| {
                egui::Frame::none()
                    .fill(BG_CARD)
                    .rounding(egui::Rounding::same(8.0))
                    .stroke(egui::Stroke::new(1.0, BORDER_SUBTLE))
                    .inner_margin(egui::Margin::same(12.0))
                    .show(ui, |ui| {
                        self.render_inputs(ui);
                        self.render_start(ui);
                        self.render_status(ui);
                    });

                self.render_training_log(ui);

                let height = (ui.available_height() - 24.0).max(160.0);
                self.controller.chart.show(ui, height);
            });
        });

        self.render_dialog(ctx);
    }
}
