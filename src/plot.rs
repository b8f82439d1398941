use crate::data::Candle;
use crate::environment::TradeAction;
use eframe::egui;
use egui_plot::{Legend, Line, MarkerShape, Plot, PlotBounds, PlotPoints, Points};
use rand::prelude::*;
use rand::rngs::StdRng;

pub const BUY_COLOR: egui::Color32 = egui::Color32::from_rgb(239, 68, 68);
pub const SELL_COLOR: egui::Color32 = egui::Color32::from_rgb(34, 197, 94);
const PRICE_COLOR: egui::Color32 = egui::Color32::from_rgb(59, 130, 246);

const X_LABEL: &str = "Steps";
const Y_LABEL: &str = "Close Price";

/// Everything needed to draw one chart. Built once per result and replaced,
/// never layered, when the next result arrives.
#[derive(Clone, Debug, PartialEq)]
pub struct TradeChart {
    pub title: String,
    pub prices: Vec<[f64; 2]>,
    pub buys: Vec<[f64; 2]>,
    pub sells: Vec<[f64; 2]>,
    /// `([x_min, y_min], [x_max, y_max])`
    pub bounds: ([f64; 2], [f64; 2]),
}

impl TradeChart {
    /// Close price line with a marker on every executed buy or sell.
    pub fn new(test_data: &[Candle], actions: &[TradeAction]) -> Self {
        let prices: Vec<[f64; 2]> = test_data
            .iter()
            .enumerate()
            .map(|(i, c)| [i as f64, c.prices()[3]])
            .collect();

        let mut buys = Vec::new();
        let mut sells = Vec::new();
        for (point, action) in prices.iter().zip(actions) {
            match action {
                TradeAction::Buy => buys.push(*point),
                TradeAction::Sell => sells.push(*point),
                TradeAction::Hold => {}
            }
        }

        Self {
            title: "Trade Point predicted by DQN Trader".to_string(),
            bounds: bounds_of(&prices),
            prices,
            buys,
            sells,
        }
    }

    /// The example series shown before the first run.
    pub fn placeholder() -> Self {
        let mut rng = StdRng::seed_from_u64(25);
        let prices: Vec<[f64; 2]> = (0..25).map(|i| [i as f64, rng.r#gen::<f64>()]).collect();
        Self {
            title: "DQN Trader Random Example".to_string(),
            bounds: bounds_of(&prices),
            prices,
            buys: Vec::new(),
            sells: Vec::new(),
        }
    }

    pub fn show(&self, ui: &mut egui::Ui, height: f32) {
        ui.label(egui::RichText::new(&self.title).size(13.0).strong());

        let (min, max) = self.bounds;
        Plot::new("trade_chart")
            .legend(Legend::default())
            .x_axis_label(X_LABEL)
            .y_axis_label(Y_LABEL)
            .height(height)
            .allow_drag(false)
            .allow_zoom(false)
            .allow_scroll(false)
            .show(ui, |plot_ui| {
                plot_ui.set_plot_bounds(PlotBounds::from_min_max(min, max));
                plot_ui.line(
                    Line::new(PlotPoints::from(self.prices.clone()))
                        .name(Y_LABEL)
                        .color(PRICE_COLOR)
                        .width(1.5),
                );
                if !self.buys.is_empty() {
                    plot_ui.points(
                        Points::new(PlotPoints::from(self.buys.clone()))
                            .name("Buy")
                            .color(BUY_COLOR)
                            .shape(MarkerShape::Circle)
                            .filled(true)
                            .radius(4.0),
                    );
                }
                if !self.sells.is_empty() {
                    plot_ui.points(
                        Points::new(PlotPoints::from(self.sells.clone()))
                            .name("Sell")
                            .color(SELL_COLOR)
                            .shape(MarkerShape::Circle)
                            .filled(true)
                            .radius(4.0),
                    );
                }
            });
    }
}

/// x spans `[0, len]`, y spans the min/max of the series.
fn bounds_of(points: &[[f64; 2]]) -> ([f64; 2], [f64; 2]) {
    if points.is_empty() {
        return ([0.0, 0.0], [1.0, 1.0]);
    }
    let (lo, hi) = points
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), p| (lo.min(p[1]), hi.max(p[1])));
    // A flat series still needs a non-degenerate y range.
    let (lo, hi) = if hi > lo { (lo, hi) } else { (lo - 0.5, hi + 0.5) };
    ([0.0, lo], [points.len() as f64, hi])
}
