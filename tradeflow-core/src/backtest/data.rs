//! Historical candle loading: CSV files and paginated exchange pulls.

use std::fs::File;
use std::path::Path;
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use crate::domain::{Candle, TimestampMs};
use crate::exchange::ExchangeClient;

use super::BacktestError;

/// Page size for exchange pulls.
const MAX_KLINES_PER_REQUEST: usize = 1_000;

/// Pause between paginated fetches, for venue rate limits.
const INTER_FETCH_PAUSE: Duration = Duration::from_millis(100);

/// Load candles from a CSV file with a header row of
/// `open_time,open,high,low,close,volume,close_time`. Rows are sorted by
/// open time after loading.
pub fn load_csv(path: &Path) -> Result<Vec<Candle>, BacktestError> {
    let file = File::open(path)
        .map_err(|e| BacktestError::DataLoad(format!("failed to open {}: {e}", path.display())))?;
    let mut reader = csv::Reader::from_reader(file);

    let mut candles = Vec::new();
    for row in reader.deserialize() {
        let candle: Candle =
            row.map_err(|e| BacktestError::DataLoad(format!("failed to parse row: {e}")))?;
        candles.push(candle);
    }
    candles.sort_by_key(|c| c.open_time);

    info!(count = candles.len(), path = %path.display(), "loaded historical candles");
    Ok(candles)
}

/// Pull candles from an exchange in pages until the end of the window,
/// pausing between fetches. Results are filtered to the window and sorted
/// by open time.
pub fn load_from_api(
    client: &dyn ExchangeClient,
    symbol: &str,
    interval: &str,
    start_ms: TimestampMs,
    end_ms: TimestampMs,
) -> Result<Vec<Candle>, BacktestError> {
    if !client.is_initialized() {
        return Err(BacktestError::DataLoad("exchange client not initialized".into()));
    }

    let mut candles = Vec::new();
    let mut current = start_ms;

    while current < end_ms {
        let page = match client.klines(symbol, interval, MAX_KLINES_PER_REQUEST, current, 0) {
            Ok(page) => page,
            Err(err) => {
                warn!(%err, "historical fetch failed, stopping pagination");
                break;
            }
        };
        if page.is_empty() {
            break;
        }

        for candle in &page {
            if candle.open_time >= start_ms && candle.open_time <= end_ms {
                candles.push(candle.clone());
            }
        }

        let next = page.last().map(|c| c.close_time + 1).unwrap_or(current);
        if next <= current {
            // A non-advancing page would loop forever.
            break;
        }
        current = next;

        if current < end_ms {
            thread::sleep(INTER_FETCH_PAUSE);
        }
    }

    candles.sort_by_key(|c| c.open_time);
    info!(count = candles.len(), symbol, "loaded historical candles from exchange");
    Ok(candles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::PaperExchange;
    use crate::strategy::test_support::candles_from_closes;
    use std::io::Write;

    #[test]
    fn csv_roundtrip_sorted_by_open_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("candles.csv");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "open_time,open,high,low,close,volume,close_time").unwrap();
        // Deliberately out of order.
        writeln!(file, "7200000,102.0,104.0,101.0,103.0,5.0,10799999").unwrap();
        writeln!(file, "0,100.0,102.0,99.0,101.0,3.0,3599999").unwrap();
        writeln!(file, "3600000,101.0,103.0,100.0,102.0,4.0,7199999").unwrap();

        let candles = load_csv(&path).unwrap();
        assert_eq!(candles.len(), 3);
        assert_eq!(candles[0].open_time, 0);
        assert_eq!(candles[1].open_time, 3_600_000);
        assert_eq!(candles[2].close, 103.0);
    }

    #[test]
    fn csv_missing_file_is_data_load_error() {
        let result = load_csv(Path::new("/nonexistent/candles.csv"));
        assert!(matches!(result, Err(BacktestError::DataLoad(_))));
    }

    #[test]
    fn csv_malformed_row_is_data_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "open_time,open,high,low,close,volume,close_time").unwrap();
        writeln!(file, "0,not_a_number,102.0,99.0,101.0,3.0,3599999").unwrap();
        assert!(matches!(load_csv(&path), Err(BacktestError::DataLoad(_))));
    }

    #[test]
    fn api_pull_filters_window() {
        let exchange = PaperExchange::new();
        exchange.initialize().unwrap();
        exchange.seed_candles("BTCUSDT", candles_from_closes(&[100.0, 101.0, 102.0, 103.0]));

        let hour_ms = 3_600_000;
        let candles =
            load_from_api(&exchange, "BTCUSDT", "1h", hour_ms, 3 * hour_ms).unwrap();
        assert_eq!(candles.len(), 3);
        assert_eq!(candles[0].open_time, hour_ms);
        assert!(candles.windows(2).all(|w| w[0].open_time < w[1].open_time));
    }

    #[test]
    fn api_pull_requires_initialized_client() {
        let exchange = PaperExchange::new();
        let result = load_from_api(&exchange, "BTCUSDT", "1h", 0, 1);
        assert!(matches!(result, Err(BacktestError::DataLoad(_))));
    }
}
