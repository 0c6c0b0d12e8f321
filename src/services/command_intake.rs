use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::error::{AppError, AppResult};
use crate::models::CommandIntent;
use crate::services::command_dispatcher::CommandDispatcher;

/// Decode one queued intent.
pub fn parse_intent(raw: &str) -> AppResult<CommandIntent> {
    let intent: CommandIntent = serde_json::from_str(raw)
        .map_err(|e| AppError::Validation(format!("malformed command intent: {}", e)))?;
    if intent.terminal_id.trim().is_empty() || intent.kind.trim().is_empty() {
        return Err(AppError::Validation(
            "command intent needs terminalId and kind".to_string(),
        ));
    }
    Ok(intent)
}

/// Feeds intents pushed onto a Redis list into the dispatcher.
///
/// Producers `LPUSH` onto `key`. Each item is moved atomically to
/// `{key}:processing` before it is handled and removed once dispatch settled,
/// so a crash mid-dispatch replays the item on the next start.
pub struct CommandIntakeConsumer {
    connection_manager: Arc<redis::aio::ConnectionManager>,
    key: String,
    processing_key: String,
    dispatcher: Arc<CommandDispatcher>,
    poll_interval: Duration,
}

impl CommandIntakeConsumer {
    pub fn new(
        connection_manager: Arc<redis::aio::ConnectionManager>,
        key: String,
        dispatcher: Arc<CommandDispatcher>,
    ) -> Self {
        let processing_key = format!("{}:processing", key);
        Self {
            connection_manager,
            key,
            processing_key,
            dispatcher,
            poll_interval: Duration::from_millis(250),
        }
    }

    /// Return items stranded by a previous process to the intake list.
    async fn recover(&self) -> AppResult<usize> {
        let mut conn = self.connection_manager.as_ref().clone();
        let mut recovered = 0;
        loop {
            let moved: Option<String> = redis::cmd("LMOVE")
                .arg(&self.processing_key)
                .arg(&self.key)
                .arg("LEFT")
                .arg("RIGHT")
                .query_async(&mut conn)
                .await?;
            if moved.is_none() {
                break;
            }
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Drain everything currently queued. Returns the number of items handled.
    pub async fn poll_once(&self) -> AppResult<usize> {
        let mut conn = self.connection_manager.as_ref().clone();
        let mut handled = 0;

        loop {
            let raw: Option<String> = redis::cmd("LMOVE")
                .arg(&self.key)
                .arg(&self.processing_key)
                .arg("RIGHT")
                .arg("LEFT")
                .query_async(&mut conn)
                .await?;
            let Some(raw) = raw else {
                return Ok(handled);
            };

            match parse_intent(&raw) {
                Ok(intent) => match self.dispatcher.send_command(intent).await {
                    Ok(result) => {
                        debug!(
                            command_id = result.command_id,
                            delivered = result.delivered,
                            queued_offline = result.queued_offline,
                            "command_intake_dispatched"
                        );
                    }
                    Err(e) => {
                        // Put it back at the consuming end and let the loop back off.
                        let _: () = redis::pipe()
                            .atomic()
                            .lrem(&self.processing_key, 1, &raw)
                            .ignore()
                            .rpush(&self.key, &raw)
                            .ignore()
                            .query_async(&mut conn)
                            .await?;
                        return Err(e);
                    }
                },
                Err(e) => {
                    warn!(error = %e, "command_intake_malformed");
                }
            }

            let _: i64 = redis::cmd("LREM")
                .arg(&self.processing_key)
                .arg(1)
                .arg(&raw)
                .query_async(&mut conn)
                .await?;
            handled += 1;
        }
    }

    /// Start the consumer loop. Returns a JoinHandle that can be used to cancel the task.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            match self.recover().await {
                Ok(0) => {}
                Ok(recovered) => info!(recovered, key = %self.key, "command_intake_recovered"),
                Err(e) => error!(error = %e, "command_intake_recovery_failed"),
            }
            info!(key = %self.key, "command_intake_started");

            loop {
                match self.poll_once().await {
                    Ok(_) => tokio::time::sleep(self.poll_interval).await,
                    Err(e) => {
                        error!(error = %e, key = %self.key, "command_intake_poll_failed");
                        tokio::time::sleep(self.poll_interval * 8).await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExecutionMode;

    #[test]
    fn test_parse_intent() {
        let intent = parse_intent(
            r#"{"terminalId":"T1","organizationId":"org","kind":"brightness","executionMode":"PUT","payload":{"brightness":50}}"#,
        )
        .unwrap();
        assert_eq!(intent.terminal_id, "T1");
        assert_eq!(intent.execution_mode, ExecutionMode::Put);
        assert!(intent.expires_at.is_none());
    }

    #[test]
    fn test_parse_intent_rejects_bad_input() {
        assert!(matches!(parse_intent("{}"), Err(AppError::Validation(_))));
        assert!(matches!(
            parse_intent(
                r#"{"terminalId":"","organizationId":"org","kind":"x","executionMode":"GET"}"#
            ),
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            parse_intent(
                r#"{"terminalId":"T1","organizationId":"org","kind":"x","executionMode":"PATCH"}"#
            ),
            Err(AppError::Validation(_))
        ));
    }
}
