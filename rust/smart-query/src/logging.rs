//! Structured logging utilities.
//!
//! Subscriber setup plus an operation timer used both for startup steps and
//! for the stages of a query request.

use std::time::{Duration, Instant};

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over `level` when set. JSON output is meant for log
/// shippers; the default is the human-readable formatter. Fails when a
/// global subscriber is already installed.
pub fn init_tracing(level: &str, json: bool) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    }
}

/// Operation timer for measuring and logging execution duration.
///
/// ```rust,ignore
/// use smart_query::logging::OpTimer;
///
/// let timer = OpTimer::new("pipeline", "retrieving");
/// let context = retriever.retrieve(question, &generation, k).await;
/// timer.finish_with_result(context.as_ref());
/// ```
#[derive(Debug)]
pub struct OpTimer {
    component: &'static str,
    operation: String,
    start: Instant,
}

impl OpTimer {
    #[must_use]
    pub fn new(component: &'static str, operation: impl Into<String>) -> Self {
        let operation = operation.into();
        tracing::debug!(component, operation = %operation, "Operation started");
        Self {
            component,
            operation,
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Log the duration at info level.
    pub fn finish(self) -> Duration {
        let elapsed = self.start.elapsed();
        tracing::info!(
            component = self.component,
            operation = %self.operation,
            duration_ms = elapsed_ms(elapsed),
            "Operation completed"
        );
        elapsed
    }

    /// Log success at debug level or the error at warn level.
    pub fn finish_with_result<T, E: std::fmt::Display>(self, result: Result<&T, &E>) -> Duration {
        let elapsed = self.start.elapsed();
        match result {
            Ok(_) => tracing::debug!(
                component = self.component,
                operation = %self.operation,
                duration_ms = elapsed_ms(elapsed),
                "Operation completed successfully"
            ),
            Err(e) => tracing::warn!(
                component = self.component,
                operation = %self.operation,
                duration_ms = elapsed_ms(elapsed),
                error = %e,
                "Operation failed"
            ),
        }
        elapsed
    }
}

fn elapsed_ms(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

/// Log a numbered initialization step.
///
/// ```rust,ignore
/// log_init_step!(1, 6, "LLM Provider", "openai (gpt-3.5-turbo)");
/// ```
#[macro_export]
macro_rules! log_init_step {
    ($step:expr, $total:expr, $name:expr, $detail:expr) => {
        tracing::info!(
            step = $step,
            total = $total,
            "[{}/{}] {} - {}",
            $step,
            $total,
            $name,
            $detail
        );
    };
    ($step:expr, $total:expr, $name:expr) => {
        tracing::info!(step = $step, total = $total, "[{}/{}] {}", $step, $total, $name);
    };
}

/// Log a non-fatal startup problem.
#[macro_export]
macro_rules! log_init_warning {
    ($msg:expr) => {
        tracing::warn!("⚠️  {}", $msg);
    };
    ($msg:expr, $($arg:tt)*) => {
        tracing::warn!("⚠️  {}", format!($msg, $($arg)*));
    };
}

#[macro_export]
macro_rules! log_success {
    ($msg:expr) => {
        tracing::info!("✅ {}", $msg);
    };
    ($msg:expr, $($arg:tt)*) => {
        tracing::info!("✅ {}", format!($msg, $($arg)*));
    };
}

/// Log a startup banner.
#[macro_export]
macro_rules! log_banner {
    ($title:expr) => {
        tracing::info!("═══════════════════════════════════════════════════");
        tracing::info!("  {}", $title);
        tracing::info!("═══════════════════════════════════════════════════");
    };
    ($title:expr, $subtitle:expr) => {
        tracing::info!("═══════════════════════════════════════════════════");
        tracing::info!("  {}", $title);
        tracing::info!("  {}", $subtitle);
        tracing::info!("═══════════════════════════════════════════════════");
    };
}
