use anyhow::Result;
use chrono::{DateTime, Utc};
use opt_trade_core::{Candle, Tick, TimeBucket};
use rust_decimal::Decimal;
use sqlx::{postgres::PgPoolOptions, PgPool};

pub struct DatabaseClient {
    pool: PgPool,
}

impl DatabaseClient {
    /// Creates a new database client connected to the specified `PostgreSQL` database.
    ///
    /// # Errors
    /// Returns an error if the database connection cannot be established.
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Applies the schema. Safe to run repeatedly.
    ///
    /// # Errors
    /// Returns an error if any DDL statement fails.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS tick_history (
                id BIGSERIAL PRIMARY KEY,
                token BIGINT NOT NULL,
                ts TIMESTAMPTZ NOT NULL,
                last_price DECIMAL(10,2) NOT NULL,
                open_interest BIGINT NOT NULL,
                volume_traded BIGINT NOT NULL,
                bid_volume BIGINT NOT NULL,
                offer_volume BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                UNIQUE (token, ts)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE INDEX IF NOT EXISTS idx_tick_history_token_ts
            ON tick_history (token, ts)
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS candle_history (
                id BIGSERIAL PRIMARY KEY,
                token BIGINT NOT NULL,
                bucket BIGINT NOT NULL,
                ts TIMESTAMPTZ NOT NULL,
                open DECIMAL(10,2) NOT NULL,
                high DECIMAL(10,2) NOT NULL,
                low DECIMAL(10,2) NOT NULL,
                close DECIMAL(10,2) NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                UNIQUE (token, bucket)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS analysis_snapshots (
                id BIGSERIAL PRIMARY KEY,
                token BIGINT NOT NULL,
                bucket BIGINT NOT NULL,
                ts TIMESTAMPTZ NOT NULL,
                close DECIMAL(10,2) NOT NULL,
                sma_20 DECIMAL(10,2),
                is_bullish BOOLEAN NOT NULL,
                is_bearish BOOLEAN NOT NULL,
                ce_token BIGINT,
                pe_token BIGINT,
                ce_pcr DOUBLE PRECISION,
                pe_pcr DOUBLE PRECISION,
                ce_beta DOUBLE PRECISION,
                pe_beta DOUBLE PRECISION,
                quantity INT NOT NULL,
                UNIQUE (token, bucket)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Inserts a batch of ticks. Duplicate `(token, ts)` rows are dropped
    /// silently so re-delivered ticks stay idempotent.
    ///
    /// # Errors
    /// Returns an error if the transaction fails; callers log and move on,
    /// the next cycle's batch is unaffected.
    pub async fn insert_tick_batch(&self, ticks: &[Tick]) -> Result<()> {
        if ticks.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;

        for tick in ticks {
            sqlx::query(
                r"
                INSERT INTO tick_history
                (token, ts, last_price, open_interest, volume_traded, bid_volume, offer_volume)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (token, ts) DO NOTHING
                ",
            )
            .bind(tick.token)
            .bind(tick.timestamp)
            .bind(tick.last_price)
            .bind(tick.open_interest)
            .bind(tick.volume_traded)
            .bind(tick.bid_volume)
            .bind(tick.offer_volume)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Open-interest history for a set of tokens, ordered by timestamp.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn oi_history(
        &self,
        tokens: &[i64],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<OiRow>> {
        let rows = sqlx::query_as::<_, OiRow>(
            r"
            SELECT token, ts, open_interest
            FROM tick_history
            WHERE token = ANY($1) AND ts >= $2 AND ts <= $3
            ORDER BY ts ASC
            ",
        )
        .bind(tokens)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Tick-price series for one token, ordered by timestamp. Used for the
    /// leg-vs-underlying return regression.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn price_series(
        &self,
        token: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<PricePoint>> {
        let rows = sqlx::query_as::<_, PricePoint>(
            r"
            SELECT ts, last_price
            FROM tick_history
            WHERE token = $1 AND ts >= $2 AND ts <= $3
            ORDER BY ts ASC
            ",
        )
        .bind(token)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Inserts candles, skipping `(token, bucket)` duplicates.
    ///
    /// # Errors
    /// Returns an error if the transaction fails.
    pub async fn insert_candles(&self, candles: &[Candle]) -> Result<()> {
        if candles.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;

        for candle in candles {
            sqlx::query(
                r"
                INSERT INTO candle_history (token, bucket, ts, open, high, low, close)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (token, bucket) DO NOTHING
                ",
            )
            .bind(candle.token)
            .bind(candle.bucket.as_i64())
            .bind(candle.ts)
            .bind(candle.open)
            .bind(candle.high)
            .bind(candle.low)
            .bind(candle.close)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Removes candles at or after `bucket` so a re-fetch can never leave
    /// duplicate buckets behind.
    ///
    /// # Errors
    /// Returns an error if the delete fails.
    pub async fn delete_candles_from(&self, token: i64, bucket: TimeBucket) -> Result<u64> {
        let result = sqlx::query(
            r"
            DELETE FROM candle_history
            WHERE token = $1 AND bucket >= $2
            ",
        )
        .bind(token)
        .bind(bucket.as_i64())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Candles for a token with bucket in `[from, to]`, bucket-ordered.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn query_candles(
        &self,
        token: i64,
        from: TimeBucket,
        to: TimeBucket,
    ) -> Result<Vec<Candle>> {
        let rows = sqlx::query_as::<_, CandleRow>(
            r"
            SELECT token, bucket, ts, open, high, low, close
            FROM candle_history
            WHERE token = $1 AND bucket >= $2 AND bucket <= $3
            ORDER BY bucket ASC
            ",
        )
        .bind(token)
        .bind(from.as_i64())
        .bind(to.as_i64())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(CandleRow::into_candle).collect())
    }

    /// Most recent candles for a token, bucket-ordered ascending.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn recent_candles(&self, token: i64, limit: i64) -> Result<Vec<Candle>> {
        let rows = sqlx::query_as::<_, CandleRow>(
            r"
            SELECT token, bucket, ts, open, high, low, close
            FROM (
                SELECT token, bucket, ts, open, high, low, close
                FROM candle_history
                WHERE token = $1
                ORDER BY bucket DESC
                LIMIT $2
            ) recent
            ORDER BY bucket ASC
            ",
        )
        .bind(token)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(CandleRow::into_candle).collect())
    }

    /// Number of stored candles for a token.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn candle_count(&self, token: i64) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM candle_history WHERE token = $1")
                .bind(token)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Whether an analysis snapshot already exists for `(token, bucket)`.
    /// This is the processed-bucket guard: one snapshot per bucket.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn has_analysis_snapshot(&self, token: i64, bucket: TimeBucket) -> Result<bool> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM analysis_snapshots WHERE token = $1 AND bucket = $2",
        )
        .bind(token)
        .bind(bucket.as_i64())
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    /// Inserts one per-bucket analysis snapshot; `(token, bucket)`
    /// duplicates are dropped.
    ///
    /// # Errors
    /// Returns an error if the insert fails.
    pub async fn insert_analysis_snapshot(&self, snapshot: &AnalysisSnapshotRecord) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO analysis_snapshots
            (token, bucket, ts, close, sma_20, is_bullish, is_bearish,
             ce_token, pe_token, ce_pcr, pe_pcr, ce_beta, pe_beta, quantity)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (token, bucket) DO NOTHING
            ",
        )
        .bind(snapshot.token)
        .bind(snapshot.bucket)
        .bind(snapshot.ts)
        .bind(snapshot.close)
        .bind(snapshot.sma_20)
        .bind(snapshot.is_bullish)
        .bind(snapshot.is_bearish)
        .bind(snapshot.ce_token)
        .bind(snapshot.pe_token)
        .bind(snapshot.ce_pcr)
        .bind(snapshot.pe_pcr)
        .bind(snapshot.ce_beta)
        .bind(snapshot.pe_beta)
        .bind(snapshot.quantity)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OiRow {
    pub token: i64,
    pub ts: DateTime<Utc>,
    pub open_interest: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PricePoint {
    pub ts: DateTime<Utc>,
    pub last_price: Decimal,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct CandleRow {
    token: i64,
    bucket: i64,
    ts: DateTime<Utc>,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
}

impl CandleRow {
    fn into_candle(self) -> Candle {
        Candle {
            token: self.token,
            bucket: TimeBucket::from_raw(self.bucket),
            ts: self.ts,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
        }
    }
}

/// One per-bucket record of what the signal derivation saw and chose.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AnalysisSnapshotRecord {
    pub token: i64,
    pub bucket: i64,
    pub ts: DateTime<Utc>,
    pub close: Decimal,
    pub sma_20: Option<Decimal>,
    pub is_bullish: bool,
    pub is_bearish: bool,
    pub ce_token: Option<i64>,
    pub pe_token: Option<i64>,
    pub ce_pcr: Option<f64>,
    pub pe_pcr: Option<f64>,
    pub ce_beta: Option<f64>,
    pub pe_beta: Option<f64>,
    pub quantity: i32,
}
