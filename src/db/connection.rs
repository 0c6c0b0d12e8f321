use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::error::AppError;

/// Creates a PostgreSQL connection pool.
///
/// Retries a few times with a growing delay before giving up. Authentication
/// failures are returned immediately.
pub async fn create_pool(database_url: &str) -> Result<PgPool, AppError> {
    let max_retries = 3;
    let mut last_error = None;

    for attempt in 1..=max_retries {
        info!(attempt, max_retries, "database_connect_attempt");

        match PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .idle_timeout(Duration::from_secs(60))
            .connect(database_url)
            .await
        {
            Ok(pool) => {
                info!("database_connected");
                return Ok(pool);
            }
            Err(e) => {
                warn!(attempt, error = %e, "database_connect_failed");

                if e.to_string().contains("authentication failed") {
                    error!("Database authentication failed. Check DATABASE_URL credentials.");
                    return Err(AppError::from(e));
                }

                last_error = Some(e);

                if attempt < max_retries {
                    tokio::time::sleep(Duration::from_secs(2 * attempt as u64)).await;
                }
            }
        }
    }

    let error = last_error
        .unwrap_or_else(|| sqlx::Error::Configuration("Unknown database connection error".into()));
    error!(error = %error, "database_connect_exhausted");
    Err(AppError::from(error))
}

/// Executes a trivial query to confirm the pool is usable.
pub async fn verify_connection(pool: &PgPool) -> Result<(), AppError> {
    sqlx::query_as::<_, (i32,)>("SELECT 1 as result")
        .fetch_optional(pool)
        .await
        .map_err(|e| {
            error!(error = %e, "database_verify_failed");
            AppError::from(e)
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_verify_connection() {
        // Only runs when DATABASE_URL is set in the environment
        if let Ok(url) = std::env::var("DATABASE_URL") {
            let pool = create_pool(&url).await.unwrap();
            verify_connection(&pool).await.unwrap();
        }
    }
}
