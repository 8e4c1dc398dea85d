use crate::config::types::{EvalConfig, EvalError, Result};
/// Configuration loading from a JSON file
use std::path::Path;

impl EvalConfig {
    /// Load configuration from a JSON file and validate it
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config_content = std::fs::read_to_string(path).map_err(|e| {
            EvalError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let config: EvalConfig = serde_json::from_str(&config_content)
            .map_err(|e| EvalError::Config(format!("Failed to parse config JSON: {}", e)))?;

        config.validate()?;
        log::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Reject settings the runtime cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.interpreter.command.is_empty() {
            return Err(EvalError::Config("interpreter.command is empty".to_string()));
        }
        if self.sessions.capacity == 0 {
            return Err(EvalError::Config("sessions.capacity must be positive".to_string()));
        }
        if self.scheduler.max_parallel == 0 {
            return Err(EvalError::Config(
                "scheduler.max_parallel must be positive".to_string(),
            ));
        }
        if self.output.width == 0 {
            return Err(EvalError::Config("output.width must be positive".to_string()));
        }

        let throttle = &self.throttle;
        if throttle.capacity <= 0 {
            return Err(EvalError::Config("throttle.capacity must be positive".to_string()));
        }
        if throttle.start_credit < 0 || throttle.start_credit > throttle.capacity {
            return Err(EvalError::Config(format!(
                "throttle.start_credit must be within 0..={}",
                throttle.capacity
            )));
        }
        if throttle.credit_per_tick <= 0 || throttle.credit_per_tick > throttle.capacity {
            return Err(EvalError::Config(format!(
                "throttle.credit_per_tick must be within 1..={}",
                throttle.capacity
            )));
        }
        if throttle.extra_per_line < 0 {
            return Err(EvalError::Config(
                "throttle.extra_per_line must not be negative".to_string(),
            ));
        }
        if throttle.queue_bound == 0 {
            return Err(EvalError::Config("throttle.queue_bound must be positive".to_string()));
        }

        let working = &self.working;
        if working.max_users == 0
            || working.max_per_user == 0
            || working.max_holds == 0
        {
            return Err(EvalError::Config(
                "working cache capacities must be positive".to_string(),
            ));
        }

        Ok(())
    }
}
