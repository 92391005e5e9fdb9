use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{info, instrument};

use super::{ExitReason, Ledger, NewTradeRow, TradeClose, TradeRow, TradeStatus};
use crate::domain::{parse_venue_id, PositionIntent, Side, VenueId};
use crate::error::{BastionError, Result};

const TRADE_COLUMNS: &str = "id, symbol, venue, strategy_id, side, intent, leverage, entry_price, \
     entry_fee_rate, quantity, status, opened_at, exit_price, pnl, pnl_pct, exit_reason, closed_at";

/// PostgreSQL trade ledger
#[derive(Clone)]
pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn side_from_str(raw: &str) -> Result<Side> {
    match raw {
        "BUY" => Ok(Side::Buy),
        "SELL" => Ok(Side::Sell),
        other => Err(BastionError::Ledger(format!("unknown side '{other}'"))),
    }
}

fn map_row(r: &PgRow) -> Result<TradeRow> {
    let venue: String = r.try_get("venue")?;
    let side: String = r.try_get("side")?;
    let intent: String = r.try_get("intent")?;
    let status: String = r.try_get("status")?;
    let exit_reason: Option<String> = r.try_get("exit_reason")?;
    let leverage: i32 = r.try_get("leverage")?;

    Ok(TradeRow {
        id: r.try_get("id")?,
        symbol: r.try_get("symbol")?,
        venue: parse_venue_id(&venue)?,
        strategy_id: r.try_get("strategy_id")?,
        side: side_from_str(&side)?,
        intent: intent
            .parse::<PositionIntent>()
            .map_err(BastionError::Ledger)?,
        leverage: leverage.max(1) as u32,
        entry_price: r.try_get("entry_price")?,
        entry_fee_rate: r.try_get("entry_fee_rate")?,
        quantity: r.try_get("quantity")?,
        status: status.parse::<TradeStatus>()?,
        opened_at: r.try_get("opened_at")?,
        exit_price: r.try_get("exit_price")?,
        pnl: r.try_get("pnl")?,
        pnl_pct: r.try_get("pnl_pct")?,
        exit_reason: exit_reason
            .as_deref()
            .map(str::parse::<ExitReason>)
            .transpose()?,
        closed_at: r.try_get("closed_at")?,
    })
}

#[async_trait]
impl Ledger for PostgresLedger {
    #[instrument(skip(self, row), fields(symbol = %row.symbol, venue = %row.venue))]
    async fn insert_trade_row(&self, row: &NewTradeRow) -> Result<i64> {
        let close = row.close.as_ref();
        let status = if close.is_some() {
            TradeStatus::Closed
        } else {
            TradeStatus::Open
        };

        let inserted = sqlx::query(
            r#"
            INSERT INTO trades (
                symbol, venue, strategy_id, side, intent, leverage, entry_price, entry_fee_rate,
                quantity, status, opened_at, exit_price, pnl, pnl_pct, exit_reason, closed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            RETURNING id
            "#,
        )
        .bind(&row.symbol)
        .bind(row.venue.as_str())
        .bind(&row.strategy_id)
        .bind(row.side.to_string())
        .bind(row.intent.as_str())
        .bind(row.leverage as i32)
        .bind(row.entry_price)
        .bind(row.entry_fee_rate)
        .bind(row.quantity)
        .bind(status.as_str())
        .bind(row.opened_at)
        .bind(close.map(|c| c.exit_price))
        .bind(close.map(|c| c.pnl))
        .bind(close.map(|c| c.pnl_pct))
        .bind(close.map(|c| c.exit_reason.as_str()))
        .bind(close.map(|c| c.closed_at))
        .fetch_one(&self.pool)
        .await?;

        Ok(inserted.try_get("id")?)
    }

    #[instrument(skip(self, close))]
    async fn update_trade_row(&self, id: i64, close: &TradeClose) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE trades
            SET status = 'closed', exit_price = $2, pnl = $3, pnl_pct = $4,
                exit_reason = $5, closed_at = $6
            WHERE id = $1 AND status = 'open'
            "#,
        )
        .bind(id)
        .bind(close.exit_price)
        .bind(close.pnl)
        .bind(close.pnl_pct)
        .bind(close.exit_reason.as_str())
        .bind(close.closed_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BastionError::Ledger(format!("trade row {id} is not open")));
        }
        Ok(())
    }

    async fn get_open_trade_row(
        &self,
        symbol: &str,
        venue: VenueId,
        strategy_id: Option<&str>,
    ) -> Result<Option<TradeRow>> {
        let sql = format!(
            "SELECT {TRADE_COLUMNS} FROM trades \
             WHERE status = 'open' AND symbol = $1 AND venue = $2 \
               AND ($3::TEXT IS NULL OR strategy_id = $3) \
             ORDER BY opened_at DESC, id DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(symbol)
            .bind(venue.as_str())
            .bind(strategy_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(map_row).transpose()
    }

    async fn get_all_open_trade_rows(&self) -> Result<Vec<TradeRow>> {
        let sql = format!(
            "SELECT {TRADE_COLUMNS} FROM trades WHERE status = 'open' ORDER BY opened_at"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(map_row).collect()
    }
}
