use crate::config::{CACHE_DIR, CACHE_MAX_AGE_SECS, DATA_RANGE, MAX_OBSERVATIONS};
use anyhow::Result;
use chrono::{DateTime, Duration, TimeZone, Utc};
use rand::prelude::*;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// A single daily OHLCV row.
#[derive(Clone, Debug, PartialEq)]
#[allow(dead_code)]
pub struct Candle {
    pub date: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Price columns in their fixed order; the close sits at index 3.
    pub fn prices(&self) -> [f64; 4] {
        [self.open, self.high, self.low, self.close]
    }
}

/// Historical rows for one symbol, oldest first.
#[derive(Clone, Debug)]
pub struct StockData {
    pub symbol: String,
    pub history: Vec<Candle>,
}

#[derive(Deserialize, Serialize, Debug)]
struct YahooChartResponse {
    chart: YahooChart,
}

#[derive(Deserialize, Serialize, Debug)]
struct YahooChart {
    result: Vec<YahooResult>,
}

#[derive(Deserialize, Serialize, Debug)]
struct YahooResult {
    timestamp: Vec<i64>,
    indicators: YahooIndicators,
}

#[derive(Deserialize, Serialize, Debug)]
struct YahooIndicators {
    quote: Vec<YahooQuote>,
}

#[derive(Deserialize, Serialize, Debug)]
struct YahooQuote {
    open: Vec<Option<f64>>,
    high: Vec<Option<f64>>,
    low: Vec<Option<f64>>,
    close: Vec<Option<f64>>,
    volume: Vec<Option<f64>>,
}

fn cache_file_path(symbol: &str, range: &str) -> PathBuf {
    Path::new(CACHE_DIR).join(format!("{}_{}.json", symbol, range))
}

/// Fetches daily history for `symbol`, preferring a cache file younger than a day.
///
/// # Arguments
/// * `symbol` - The stock ticker symbol (e.g., "AAPL").
/// * `range` - The time range to fetch (e.g., "1y", "5y").
pub async fn fetch_range(symbol: &str, range: &str) -> Result<StockData> {
    let symbol = symbol.trim().to_uppercase();
    let cache_dir = Path::new(CACHE_DIR);
    if !cache_dir.exists() {
        std::fs::create_dir_all(cache_dir)?;
    }

    let cache_file = cache_file_path(&symbol, range);

    let response: YahooChartResponse = if cache_file.exists() {
        let metadata = std::fs::metadata(&cache_file)?;
        let modified = metadata.modified()?;
        let age = std::time::SystemTime::now().duration_since(modified)?;

        if age.as_secs() < CACHE_MAX_AGE_SECS {
            info!("Loading {} from cache...", symbol);
            let file = std::fs::File::open(&cache_file)?;
            let reader = std::io::BufReader::new(file);
            serde_json::from_reader(reader)?
        } else {
            info!("Cache expired for {}, fetching...", symbol);
            fetch_from_api(&symbol, range, &cache_file).await?
        }
    } else {
        info!("Cache miss for {}, fetching...", symbol);
        fetch_from_api(&symbol, range, &cache_file).await?
    };

    response_to_stock_data(&symbol, &response)
}

fn response_to_stock_data(symbol: &str, response: &YahooChartResponse) -> Result<StockData> {
    let result = response.chart.result.first().ok_or(anyhow::anyhow!("No data found for {}", symbol))?;
    let quotes = result
        .indicators
        .quote
        .first()
        .ok_or(anyhow::anyhow!("No quote block for {}", symbol))?;

    let mut history = Vec::with_capacity(result.timestamp.len());
    for (i, &timestamp) in result.timestamp.iter().enumerate() {
        let field = |col: &Vec<Option<f64>>| col.get(i).copied().flatten();
        if let (Some(date), Some(open), Some(high), Some(low), Some(close), Some(volume)) = (
            Utc.timestamp_opt(timestamp, 0).single(),
            field(&quotes.open),
            field(&quotes.high),
            field(&quotes.low),
            field(&quotes.close),
            field(&quotes.volume),
        ) {
            history.push(Candle { date, open, high, low, close, volume });
        }
    }

    if history.is_empty() {
        anyhow::bail!("Chart response for {} contained no complete rows", symbol);
    }

    Ok(StockData {
        symbol: symbol.to_string(),
        history,
    })
}

async fn fetch_from_api(symbol: &str, range: &str, cache_path: &Path) -> Result<YahooChartResponse> {
    let url = format!(
        "https://query1.finance.yahoo.com/v8/finance/chart/{}?range={}&interval=1d",
        symbol, range
    );

    let mut attempts = 0;
    let max_attempts = 3;

    loop {
        attempts += 1;
        match reqwest::Client::new()
            .get(&url)
            .header("User-Agent", "Mozilla/5.0")
            .send()
            .await
        {
            Ok(resp) => match resp.json::<YahooChartResponse>().await {
                Ok(resp_json) => {
                    let file = std::fs::File::create(cache_path)?;
                    let writer = std::io::BufWriter::new(file);
                    serde_json::to_writer(writer, &resp_json)?;

                    return Ok(resp_json);
                }
                Err(e) => {
                    if attempts >= max_attempts {
                        return Err(e.into());
                    }
                    warn!("Failed to parse JSON for {} (attempt {}/{}): {}", symbol, attempts, max_attempts, e);
                }
            },
            Err(e) => {
                if attempts >= max_attempts {
                    return Err(e.into());
                }
                warn!("Failed to fetch data for {} (attempt {}/{}): {}", symbol, attempts, max_attempts, e);
            }
        }

        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
    }
}

impl StockData {
    /// Most recent `MAX_OBSERVATIONS` daily rows for `symbol`.
    pub async fn fetch(symbol: &str) -> Result<Self> {
        let data = fetch_range(symbol, DATA_RANGE).await?;
        info!("Fetched {} rows for {}", data.history.len(), data.symbol);
        Ok(data.most_recent(MAX_OBSERVATIONS))
    }

    pub fn most_recent(mut self, limit: usize) -> Self {
        if self.history.len() > limit {
            let skip = self.history.len() - limit;
            self.history.drain(..skip);
        }
        self
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    #[cfg(test)]
    pub fn closes(&self) -> Vec<f64> {
        self.history.iter().map(|c| c.close).collect()
    }

    /// Chronological train/test partition; the train side gets `floor(n * ratio)` rows.
    pub fn split(&self, train_ratio: f64) -> (Self, Self) {
        let n = self.history.len();
        let train_size = ((n as f64 * train_ratio) as usize).min(n);
        let (train, test) = self.history.split_at(train_size);
        (
            Self {
                symbol: self.symbol.clone(),
                history: train.to_vec(),
            },
            Self {
                symbol: self.symbol.clone(),
                history: test.to_vec(),
            },
        )
    }

    /// Random-walk history, reproducible for a given seed.
    pub fn new_mock(symbol: &str, days: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut history = Vec::with_capacity(days);
        let mut current_price: f64 = 100.0;
        let mut current_date = Utc::now() - Duration::days(days as i64);

        for _ in 0..days {
            let volatility = 0.02;
            let change_pct: f64 = rng.gen_range(-volatility..volatility);
            let open = current_price;
            let close = open * (1.0 + change_pct);
            let high = open.max(close) * (1.0 + rng.gen_range(0.0..0.01));
            let low = open.min(close) * (1.0 - rng.gen_range(0.0..0.01));
            let volume = rng.gen_range(1000.0..10000.0);

            history.push(Candle {
                date: current_date,
                open,
                high,
                low,
                close,
                volume,
            });

            current_price = close;
            current_date += Duration::days(1);
        }

        Self {
            symbol: symbol.to_string(),
            history,
        }
    }
}
