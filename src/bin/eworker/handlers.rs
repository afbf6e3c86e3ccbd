//! Handlers built into the command line worker.
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use enchanted_worker::registry::{HandlerRegistry, Performable};
use serde_json::Value;
use tracing::info;

/// Logs its arguments.
struct Echo;

#[async_trait]
impl Performable for Echo {
    async fn perform(&self, args: &[Value]) -> Result<()> {
        info!(?args, "echo");
        Ok(())
    }
}

/// Sleeps for the number of seconds given as its first argument.
struct Sleep;

#[async_trait]
impl Performable for Sleep {
    async fn perform(&self, args: &[Value]) -> Result<()> {
        let Some(secs) = args.first().and_then(Value::as_f64) else {
            bail!("expected a number of seconds, got {args:?}");
        };
        if !secs.is_finite() || secs < 0.0 {
            bail!("can't sleep for {secs}s");
        }

        tokio::time::sleep(Duration::from_secs_f64(secs)).await;
        Ok(())
    }
}

pub(crate) fn registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register("Echo", Echo).register("Sleep", Sleep);
    registry
}
