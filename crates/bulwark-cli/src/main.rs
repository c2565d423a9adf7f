use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::time::{Duration, sleep};
use tracing::info;

use bulwark_core::domain::TaskError;
use bulwark_core::observability::init_tracing;
use bulwark_core::ports::CallContext;
use bulwark_core::typed::{Handler, TypedTask};
use bulwark_core::{EngineBuilder, EngineConfig};

const CONSULT_KEYS: [&str; 3] = ["consult.legal", "consult.finance", "consult.security"];

#[derive(Debug, Deserialize)]
struct Consult {
    question: String,
}

#[derive(Debug, Serialize)]
struct Opinion {
    reviewer: String,
    answer: String,
    attempt: u32,
}

/// Each key gets its own handler type so all three can be registered.
macro_rules! consult_task {
    ($name:ident, $key:literal) => {
        #[derive(Debug, Deserialize)]
        #[serde(transparent)]
        struct $name(Consult);

        impl TypedTask for $name {
            const KEY: &'static str = $key;
            type Output = Opinion;
        }

        #[async_trait]
        impl Handler<$name> for FlakyReviewer {
            async fn handle(&self, ctx: &CallContext, task: $name) -> Result<Opinion, TaskError> {
                self.review(ctx, task.0).await
            }
        }
    };
}

/// Fails the first `flaky_calls` calls with a transient error.
struct FlakyReviewer {
    remaining_failures: AtomicU32,
}

impl FlakyReviewer {
    fn new(flaky_calls: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(flaky_calls),
        }
    }

    async fn review(&self, ctx: &CallContext, consult: Consult) -> Result<Opinion, TaskError> {
        sleep(Duration::from_millis(20)).await;
        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(TaskError::transient(format!(
                "{} unavailable (left={left})",
                ctx.task_key
            )));
        }
        Ok(Opinion {
            reviewer: ctx.task_key.to_string(),
            answer: format!("no objection to: {}", consult.question),
            attempt: ctx.attempt,
        })
    }
}

consult_task!(LegalConsult, "consult.legal");
consult_task!(FinanceConsult, "consult.finance");
consult_task!(SecurityConsult, "consult.security");

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing(std::env::var("BULWARK_LOG_JSON").is_ok());

    // optional config file as the first argument
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let mut config = EngineConfig::load(config_path.as_deref())?;
    config.retry.base_delay_ms = config.retry.base_delay_ms.min(50);
    config.retry.max_delay_ms = config.retry.max_delay_ms.max(config.retry.base_delay_ms);

    let engine = EngineBuilder::new()
        .with_config(config)
        .register_typed::<LegalConsult, _>(FlakyReviewer::new(1))?
        .register_typed::<FinanceConsult, _>(FlakyReviewer::new(0))?
        .register_typed::<SecurityConsult, _>(FlakyReviewer::new(2))?
        .expect_tasks(&CONSULT_KEYS)
        .build()?;

    let payload = json!({ "question": "ship the new billing flow?" });

    // (A) one payload, every reviewer in parallel
    let batch = engine
        .orchestrator()
        .run(CONSULT_KEYS, payload.clone(), engine.run_options())
        .await?;
    println!("{}", serde_json::to_string_pretty(&batch)?);

    // (B) same reviewers one at a time; results come from the cache
    let workflows = engine.workflows();
    let id = workflows.start(CONSULT_KEYS)?;
    let status = workflows.run_to_completion(id, payload).await?;
    println!("{}", serde_json::to_string_pretty(&status)?);

    println!("{}", serde_json::to_string_pretty(&engine.snapshot())?);

    let drained = engine.shutdown(Duration::from_secs(5)).await;
    info!(drained, "done");
    Ok(())
}
