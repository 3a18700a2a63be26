use async_trait::async_trait;
use log::debug;
use sqlx::{migrate::MigrateDatabase, sqlite::{SqlitePool, SqlitePoolOptions}, Row, Sqlite};
use crate::error::{Error, Result};
use crate::models::{OptionResult, Poll};

/// Durable side of a flush: applies one option's pending count.
#[async_trait]
pub trait TallyStore: Send + Sync {
    /// Adds `count` to the result of `option` on every poll that lists
    /// `option` among its options. Returns how many polls were updated;
    /// an option no poll knows about updates nothing and is not an error.
    async fn apply_tally(&self, option: &str, count: u64) -> Result<u64>;
}

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn connect(db_url: &str) -> Result<Self> {
        // Create database if it doesn't exist
        let in_memory = db_url.contains(":memory:");
        if !in_memory && !Sqlite::database_exists(db_url).await.unwrap_or(false) {
            Sqlite::create_database(db_url).await?;
        }

        // An in-memory database lives and dies with its connection
        let mut options = SqlitePoolOptions::new().max_connections(5);
        if in_memory {
            options = options.max_connections(1).idle_timeout(None).max_lifetime(None);
        }
        let pool = options.connect(db_url).await?;

        Self::init_schema(&pool).await?;

        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn init_schema(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS polls (
                id TEXT PRIMARY KEY,
                question TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS poll_options (
                poll_id TEXT NOT NULL,
                option TEXT NOT NULL,
                votes INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (poll_id, option),
                FOREIGN KEY (poll_id) REFERENCES polls(id) ON DELETE CASCADE
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_poll_options_option ON poll_options(option)")
            .execute(pool)
            .await?;

        Ok(())
    }

    // Store a poll with a zero result for each of its options
    pub async fn create_poll(&self, poll: &Poll) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO polls (id, question, created_at) VALUES (?, ?, ?)")
            .bind(&poll.id)
            .bind(&poll.question)
            .bind(poll.created_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;

        for option in &poll.options {
            sqlx::query(
                r#"
                INSERT INTO poll_options (poll_id, option, votes)
                VALUES (?, ?, 0)
                ON CONFLICT(poll_id, option) DO NOTHING
                "#,
            )
            .bind(&poll.id)
            .bind(option)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    // Cumulative results of one poll, ordered by option
    pub async fn poll_results(&self, poll_id: &str) -> Result<Vec<OptionResult>> {
        let results = sqlx::query(
            r#"
            SELECT option, votes
            FROM poll_options
            WHERE poll_id = ?
            ORDER BY option
            "#,
        )
        .bind(poll_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| OptionResult {
            option: row.get::<String, _>("option"),
            votes: row.get::<i64, _>("votes"),
        })
        .collect();

        Ok(results)
    }
}

#[async_trait]
impl TallyStore for Database {
    async fn apply_tally(&self, option: &str, count: u64) -> Result<u64> {
        let count = i64::try_from(count).map_err(|_| Error::CountOverflow(count))?;
        let result = sqlx::query(
            r#"
            UPDATE poll_options
            SET votes = votes + ?
            WHERE option = ?
            "#,
        )
        .bind(count)
        .bind(option)
        .execute(&self.pool)
        .await?;

        debug!("Applied {} vote(s) for '{}' to {} poll(s)", count, option, result.rows_affected());
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_db() -> Database {
        Database::connect("sqlite::memory:").await.unwrap()
    }

    fn votes_for(results: &[OptionResult], option: &str) -> i64 {
        results.iter().find(|r| r.option == option).map(|r| r.votes).unwrap()
    }

    #[tokio::test]
    async fn create_poll_starts_every_option_at_zero() {
        let db = memory_db().await;
        let poll = Poll::new("Lunch?".into(), vec!["pizza".into(), "sushi".into()]);
        db.create_poll(&poll).await.unwrap();

        let results = db.poll_results(&poll.id).await.unwrap();
        assert_eq!(
            results,
            vec![
                OptionResult { option: "pizza".into(), votes: 0 },
                OptionResult { option: "sushi".into(), votes: 0 },
            ]
        );
    }

    #[tokio::test]
    async fn apply_tally_only_touches_polls_listing_the_option() {
        let db = memory_db().await;
        let first = Poll::new("Q1".into(), vec!["yes".into(), "no".into()]);
        let second = Poll::new("Q2".into(), vec!["yes".into(), "maybe".into()]);
        let third = Poll::new("Q3".into(), vec!["red".into()]);
        for poll in [&first, &second, &third] {
            db.create_poll(poll).await.unwrap();
        }

        assert_eq!(db.apply_tally("yes", 4).await.unwrap(), 2);
        assert_eq!(db.apply_tally("yes", 1).await.unwrap(), 2);

        assert_eq!(votes_for(&db.poll_results(&first.id).await.unwrap(), "yes"), 5);
        assert_eq!(votes_for(&db.poll_results(&second.id).await.unwrap(), "yes"), 5);
        assert_eq!(votes_for(&db.poll_results(&third.id).await.unwrap(), "red"), 0);
    }

    #[tokio::test]
    async fn apply_tally_rejects_counts_sqlite_cannot_hold() {
        let db = memory_db().await;
        let poll = Poll::new("Q".into(), vec!["yes".into()]);
        db.create_poll(&poll).await.unwrap();

        let err = db.apply_tally("yes", u64::MAX).await.unwrap_err();
        assert!(matches!(err, Error::CountOverflow(u64::MAX)));
        assert_eq!(votes_for(&db.poll_results(&poll.id).await.unwrap(), "yes"), 0);
    }

    #[tokio::test]
    async fn apply_tally_for_unknown_option_is_a_no_op() {
        let db = memory_db().await;
        let poll = Poll::new("Q".into(), vec!["yes".into()]);
        db.create_poll(&poll).await.unwrap();

        assert_eq!(db.apply_tally("nope", 3).await.unwrap(), 0);
        assert_eq!(votes_for(&db.poll_results(&poll.id).await.unwrap(), "yes"), 0);
    }
}
