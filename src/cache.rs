use std::path::{Path, PathBuf};

use chrono::Utc;
use error_stack::{Report, ResultExt};

use crate::error::StorageError;
use crate::model::{Candle, ExchangeKind, MarketType, TimeFrame};

const CSV_HEADER: &str = "timestamp,open,high,low,close,volume";

/// On-disk candle cache, CSV files per (exchange, symbol, timeframe) under
/// `{cache_dir}/{exchange}/{exchange}_{symbol}_{timeframe}_{utc_stamp}.csv`.
///
/// Mirrors a prior Python implementation's file cache: the UTC timestamp in
/// the filename means a writer never has to read-modify-write an existing
/// file, so concurrent fetchers racing on the same key are safe. Freshness
/// is judged from the file's actual filesystem mtime, not a field inside
/// it, so a cache file is just as trustworthy if copied or touched by
/// another process. After a write, older files for the same key are
/// pruned, keeping only the newest.
pub struct DiskCache {
    root: PathBuf,
}

impl DiskCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn exchange_dir(&self, exchange: ExchangeKind) -> PathBuf {
        self.root.join(exchange.to_string())
    }

    fn key_prefix(exchange: ExchangeKind, symbol: &str, timeframe: TimeFrame) -> String {
        format!("{exchange}_{symbol}_{timeframe}_")
    }

    fn file_name(exchange: ExchangeKind, symbol: &str, timeframe: TimeFrame, stamp: &str) -> String {
        format!("{}{}.csv", Self::key_prefix(exchange, symbol, timeframe), stamp)
    }

    /// Files under this key's exchange dir matching the
    /// `{exchange}_{symbol}_{timeframe}_*.csv` naming convention.
    async fn matching_files(
        &self,
        exchange: ExchangeKind,
        symbol: &str,
        timeframe: TimeFrame,
    ) -> Result<Vec<PathBuf>, Report<StorageError>> {
        let dir = self.exchange_dir(exchange);
        let prefix = Self::key_prefix(exchange, symbol, timeframe);

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Report::new(e).change_context(StorageError::Query)),
        };

        let mut matches = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .change_context(StorageError::Query)?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(&prefix) && name.ends_with(".csv") {
                matches.push(entry.path());
            }
        }
        Ok(matches)
    }

    /// The newest matching file by filesystem mtime, if any.
    async fn newest_file(
        &self,
        exchange: ExchangeKind,
        symbol: &str,
        timeframe: TimeFrame,
    ) -> Result<Option<PathBuf>, Report<StorageError>> {
        let candidates = self.matching_files(exchange, symbol, timeframe).await?;
        let mut newest: Option<(PathBuf, std::time::SystemTime)> = None;
        for path in candidates {
            let Ok(metadata) = tokio::fs::metadata(&path).await else {
                continue;
            };
            let Ok(mtime) = metadata.modified() else {
                continue;
            };
            if newest.as_ref().is_none_or(|(_, best)| mtime > *best) {
                newest = Some((path, mtime));
            }
        }
        Ok(newest.map(|(path, _)| path))
    }

    /// Read cached candles if a fresh file exists for this key. Returns
    /// `None` on cache miss (no file, stale mtime, or unparseable content).
    pub async fn read(
        &self,
        exchange: ExchangeKind,
        market: MarketType,
        symbol: &str,
        timeframe: TimeFrame,
    ) -> Result<Option<Vec<Candle>>, Report<StorageError>> {
        let Some(path) = self.newest_file(exchange, symbol, timeframe).await? else {
            return Ok(None);
        };

        let metadata = match tokio::fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Report::new(e).change_context(StorageError::Query)),
        };
        let mtime = metadata
            .modified()
            .change_context(StorageError::Query)?;
        let age = std::time::SystemTime::now()
            .duration_since(mtime)
            .unwrap_or_default();
        if age > timeframe.freshness_window().to_std().unwrap_or(std::time::Duration::MAX) {
            return Ok(None);
        }

        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Report::new(e)
                    .change_context(StorageError::Query)
                    .attach_with(|| format!("reading cache file {}", path.display())));
            }
        };

        let _ = market;
        parse_csv(&raw, exchange, symbol, timeframe).map(Some)
    }

    /// Write a new timestamped CSV file for `candles`, then prune older
    /// files sharing this key.
    pub async fn write(
        &self,
        exchange: ExchangeKind,
        market: MarketType,
        symbol: &str,
        timeframe: TimeFrame,
        candles: &[Candle],
    ) -> Result<(), Report<StorageError>> {
        let _ = market;
        let dir = self.exchange_dir(exchange);
        tokio::fs::create_dir_all(&dir)
            .await
            .change_context(StorageError::Insert)?;

        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ").to_string();
        let path = dir.join(Self::file_name(exchange, symbol, timeframe, &stamp));
        let body = render_csv(candles)?;
        tokio::fs::write(&path, body)
            .await
            .change_context(StorageError::Insert)?;

        self.prune_duplicates(exchange, symbol, timeframe).await?;
        Ok(())
    }

    /// Keep only the newest file for `(exchange, symbol, timeframe)`,
    /// deleting the rest. Missing-file races (another pruner beat us to a
    /// file) are tolerated, matching the Python cache manager's behavior.
    pub async fn prune_duplicates(
        &self,
        exchange: ExchangeKind,
        symbol: &str,
        timeframe: TimeFrame,
    ) -> Result<usize, Report<StorageError>> {
        let mut candidates = self.matching_files(exchange, symbol, timeframe).await?;
        if candidates.len() <= 1 {
            return Ok(0);
        }

        let mut dated: Vec<(PathBuf, std::time::SystemTime)> = Vec::with_capacity(candidates.len());
        for path in candidates.drain(..) {
            let mtime = tokio::fs::metadata(&path)
                .await
                .ok()
                .and_then(|m| m.modified().ok());
            if let Some(mtime) = mtime {
                dated.push((path, mtime));
            }
        }
        dated.sort_by(|a, b| b.1.cmp(&a.1));

        let mut removed = 0usize;
        for (path, _) in dated.into_iter().skip(1) {
            if tokio::fs::remove_file(&path).await.is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Remove cache files older than `max_age` across all exchanges/keys.
    /// Returns the number of files removed.
    pub async fn prune_stale(&self, max_age: chrono::Duration) -> Result<usize, Report<StorageError>> {
        prune_dir(&self.root, max_age).await
    }
}

fn render_csv(candles: &[Candle]) -> Result<Vec<u8>, Report<StorageError>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer
        .write_record(CSV_HEADER.split(','))
        .change_context(StorageError::Insert)?;
    for c in candles {
        writer
            .write_record(&[
                c.open_time.to_rfc3339(),
                c.open.to_string(),
                c.high.to_string(),
                c.low.to_string(),
                c.close.to_string(),
                c.volume.to_string(),
            ])
            .change_context(StorageError::Insert)?;
    }
    writer
        .into_inner()
        .map_err(|e| e.into_error())
        .change_context(StorageError::Insert)
}

fn parse_csv(
    raw: &str,
    exchange: ExchangeKind,
    symbol: &str,
    timeframe: TimeFrame,
) -> Result<Vec<Candle>, Report<StorageError>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(raw.as_bytes());

    let mut candles = Vec::new();
    for record in reader.records() {
        let record = record.change_context(StorageError::Query)?;
        if record.len() < 6 {
            continue;
        }
        let open_time = chrono::DateTime::parse_from_rfc3339(&record[0])
            .change_context(StorageError::Query)?
            .with_timezone(&Utc);
        let parse = |s: &str| -> Result<f64, Report<StorageError>> {
            s.parse::<f64>().change_context(StorageError::Query)
        };
        candles.push(Candle {
            exchange,
            symbol: symbol.to_owned(),
            timeframe,
            open_time,
            open: parse(&record[1])?,
            high: parse(&record[2])?,
            low: parse(&record[3])?,
            close: parse(&record[4])?,
            volume: parse(&record[5])?,
        });
    }
    Ok(candles)
}

fn prune_dir(
    dir: &Path,
    max_age: chrono::Duration,
) -> futures::future::BoxFuture<'_, Result<usize, Report<StorageError>>> {
    let dir = dir.to_path_buf();
    Box::pin(async move {
        let mut removed = 0usize;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(Report::new(e).change_context(StorageError::Query)),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .change_context(StorageError::Query)?
        {
            let path = entry.path();
            if path.is_dir() {
                removed += prune_dir(&path, max_age).await?;
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some("csv") {
                continue;
            }

            let Ok(metadata) = tokio::fs::metadata(&path).await else {
                continue;
            };
            let Ok(mtime) = metadata.modified() else {
                continue;
            };
            let age = std::time::SystemTime::now()
                .duration_since(mtime)
                .unwrap_or_default();
            if chrono::Duration::from_std(age).unwrap_or(chrono::Duration::zero()) > max_age {
                let _ = tokio::fs::remove_file(&path).await;
                removed += 1;
            }
        }
        Ok(removed)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_candle(close: f64) -> Candle {
        Candle {
            exchange: ExchangeKind::Binance,
            symbol: "BTCUSDT".into(),
            timeframe: TimeFrame::Hour1,
            open_time: Utc::now(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
        }
    }

    fn tempfile_dir() -> PathBuf {
        std::env::temp_dir().join(format!("cache-test-{}", uuid::Uuid::new_v4()))
    }

    /// Back-dates a file's mtime by `age` so freshness checks can be tested
    /// without a real sleep.
    async fn set_mtime_ago(path: &Path, age: std::time::Duration) {
        let file = std::fs::File::open(path).unwrap();
        let target = std::time::SystemTime::now() - age;
        file.set_modified(target).unwrap();
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile_dir();
        let cache = DiskCache::new(&dir);
        let candles = vec![sample_candle(100.0), sample_candle(101.0)];
        cache
            .write(ExchangeKind::Binance, MarketType::Spot, "BTCUSDT", TimeFrame::Hour1, &candles)
            .await
            .unwrap();

        let read = cache
            .read(ExchangeKind::Binance, MarketType::Spot, "BTCUSDT", TimeFrame::Hour1)
            .await
            .unwrap();
        assert!(read.is_some());
        let read = read.unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read[0].close, 100.0);
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn missing_entry_is_cache_miss() {
        let dir = tempfile_dir();
        let cache = DiskCache::new(&dir);
        let read = cache
            .read(ExchangeKind::Binance, MarketType::Spot, "ETHUSDT", TimeFrame::Hour1)
            .await
            .unwrap();
        assert!(read.is_none());
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn stale_mtime_is_cache_miss() {
        let dir = tempfile_dir();
        let cache = DiskCache::new(&dir);
        let candles = vec![sample_candle(100.0)];
        cache
            .write(ExchangeKind::Binance, MarketType::Spot, "BTCUSDT", TimeFrame::Hour1, &candles)
            .await
            .unwrap();

        let path = cache
            .newest_file(ExchangeKind::Binance, "BTCUSDT", TimeFrame::Hour1)
            .await
            .unwrap()
            .unwrap();
        set_mtime_ago(&path, std::time::Duration::from_secs(7200)).await;

        let read = cache
            .read(ExchangeKind::Binance, MarketType::Spot, "BTCUSDT", TimeFrame::Hour1)
            .await
            .unwrap();
        assert!(read.is_none(), "an hour-old Hour1 cache file is past its freshness window");
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn write_prunes_older_duplicates_for_the_same_key() {
        let dir = tempfile_dir();
        let cache = DiskCache::new(&dir);
        let candles = vec![sample_candle(100.0)];

        cache
            .write(ExchangeKind::Binance, MarketType::Spot, "BTCUSDT", TimeFrame::Hour1, &candles)
            .await
            .unwrap();
        // A second write for the same key should leave only the newest file.
        cache
            .write(ExchangeKind::Binance, MarketType::Spot, "BTCUSDT", TimeFrame::Hour1, &candles)
            .await
            .unwrap();

        let remaining = cache
            .matching_files(ExchangeKind::Binance, "BTCUSDT", TimeFrame::Hour1)
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn prune_stale_removes_old_files() {
        let dir = tempfile_dir();
        let cache = DiskCache::new(&dir);
        let candles = vec![sample_candle(100.0)];
        cache
            .write(ExchangeKind::Binance, MarketType::Spot, "BTCUSDT", TimeFrame::Hour1, &candles)
            .await
            .unwrap();

        let path = cache
            .newest_file(ExchangeKind::Binance, "BTCUSDT", TimeFrame::Hour1)
            .await
            .unwrap()
            .unwrap();
        set_mtime_ago(&path, std::time::Duration::from_secs(3600)).await;

        let removed = cache.prune_stale(chrono::Duration::seconds(1)).await.unwrap();
        assert_eq!(removed, 1);
        std::fs::remove_dir_all(dir).ok();
    }
}
