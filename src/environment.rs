use crate::config::{INITIAL_CAPITAL, LOOKBACK, TRADING_COST};
use crate::data::{Candle, StockData};
use anyhow::Result;
use serde::Serialize;

/// Per-step decision. The discriminant is the action code shown to users.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum TradeAction {
    Hold = 0,
    Buy = 1,
    Sell = 2,
}

impl TradeAction {
    pub const COUNT: usize = 3;

    pub fn from_index(idx: usize) -> Option<Self> {
        match idx {
            0 => Some(Self::Hold),
            1 => Some(Self::Buy),
            2 => Some(Self::Sell),
            _ => None,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Outcome of one environment step.
#[derive(Clone, Debug)]
pub struct Step {
    pub next_state: Vec<f32>,
    pub reward: f64,
    pub done: bool,
    /// What actually happened: a buy while already invested (or a sell while
    /// flat) degrades to `Hold`.
    pub executed: TradeAction,
    pub fortune: f64,
    pub cash: f64,
}

/// Single-asset, all-in/all-out trading simulation over a row sequence.
///
/// The first `LOOKBACK` rows only provide context; one decision is taken on
/// every following row at its closing price.
#[derive(Clone, Debug)]
pub struct StockEnv {
    rows: Vec<Candle>,
    cursor: usize,
    cash: f64,
    shares: f64,
}

impl StockEnv {
    pub fn new(data: &StockData) -> Result<Self> {
        if data.history.len() <= LOOKBACK {
            anyhow::bail!(
                "{} rows for {} is not enough for a lookback of {}",
                data.history.len(),
                data.symbol,
                LOOKBACK
            );
        }
        if data.history.iter().any(|c| !(c.close.is_finite() && c.close > 0.0)) {
            anyhow::bail!("{} history contains non-positive closing prices", data.symbol);
        }
        Ok(Self {
            rows: data.history.clone(),
            cursor: LOOKBACK,
            cash: INITIAL_CAPITAL,
            shares: 0.0,
        })
    }

    pub const fn state_dim() -> usize {
        LOOKBACK + 1
    }

    /// Number of decisions in one episode.
    pub fn num_steps(&self) -> usize {
        self.rows.len() - LOOKBACK
    }

    /// The rows a decision is taken on, aligned with the per-step outputs.
    pub fn decision_rows(&self) -> &[Candle] {
        &self.rows[LOOKBACK..]
    }

    pub fn reset(&mut self) -> Vec<f32> {
        self.cursor = LOOKBACK;
        self.cash = INITIAL_CAPITAL;
        self.shares = 0.0;
        self.state()
    }

    fn price(&self, idx: usize) -> f64 {
        self.rows[idx].close
    }

    /// Scaled log returns over the lookback window plus an invested flag.
    fn state(&self) -> Vec<f32> {
        let t = self.cursor.min(self.rows.len() - 1);
        let mut state = Vec::with_capacity(Self::state_dim());
        for i in (t + 1 - LOOKBACK)..=t {
            let ret = (self.price(i) / self.price(i - 1)).ln() * 10.0;
            state.push(ret as f32);
        }
        state.push(if self.shares > 0.0 { 1.0 } else { 0.0 });
        state
    }

    pub fn step(&mut self, action: TradeAction) -> Step {
        let t = self.cursor;
        let price = self.price(t);
        let before = self.cash + self.shares * price;

        let executed = match action {
            TradeAction::Buy if self.cash > 0.0 => {
                self.shares = self.cash * (1.0 - TRADING_COST) / price;
                self.cash = 0.0;
                TradeAction::Buy
            }
            TradeAction::Sell if self.shares > 0.0 => {
                self.cash = self.shares * price * (1.0 - TRADING_COST);
                self.shares = 0.0;
                TradeAction::Sell
            }
            _ => TradeAction::Hold,
        };

        let fortune = self.cash + self.shares * price;
        let cost = before - fortune;

        self.cursor += 1;
        let done = self.cursor >= self.rows.len();
        let drift = if done {
            0.0
        } else {
            self.shares * (self.price(self.cursor) - price)
        };
        let reward = (drift - cost) / INITIAL_CAPITAL * 100.0;

        Step {
            next_state: self.state(),
            reward,
            done,
            executed,
            fortune,
            cash: self.cash,
        }
    }
}
