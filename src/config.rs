//! Server configuration.
//!
//! Environment variables with compiled defaults; `.env` files are honored
//! through `dotenvy` in `main`. The defaults reproduce the stock session
//! timing of the simulator.

use anyhow::Context;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    /// Pre-open phase duration: orders accumulate, no matching.
    pub pre_open_ms: u64,
    /// Post-fixing wait before continuous trading starts.
    pub open_ms: u64,
    /// Continuous trading phase duration.
    pub continuous_ms: u64,
    /// Poll interval of the continuous phase loop.
    pub loop_ms: u64,
    /// Pre-close phase duration: matching stops, orders still accumulate.
    pub pre_close_ms: u64,
    /// Simulated venue latency inserted before each continuous match pass.
    pub process_delay_ms: u64,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        Ok(Self {
            host: env_or("BOURSE_HOST", "127.0.0.1".to_string())?,
            port: env_or("BOURSE_PORT", 8080)?,
            database_url: env_or("DATABASE_URL", "sqlite:bourse.db".to_string())?,
            pre_open_ms: env_or("BOURSE_PRE_OPEN_MS", 1_000)?,
            open_ms: env_or("BOURSE_OPEN_MS", 1_000)?,
            continuous_ms: env_or("BOURSE_CONTINUOUS_MS", 30_000)?,
            loop_ms: env_or("BOURSE_LOOP_MS", 1_000)?,
            pre_close_ms: env_or("BOURSE_PRE_CLOSE_MS", 1_000)?,
            process_delay_ms: env_or("BOURSE_PROCESS_DELAY_MS", 500)?,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw.parse::<T>().with_context(|| format!("invalid value for {key}")),
        Err(_) => Ok(default),
    }
}
