//! Resource ceilings for sandboxed execution.

use serde::{Deserialize, Serialize};

/// Default memory ceiling in megabytes.
pub const DEFAULT_MEMORY_MB: u64 = 256;
/// Default CPU ceiling as a fraction of one core.
pub const DEFAULT_CPU_CORES: f64 = 0.5;
/// Default process-count ceiling.
pub const DEFAULT_MAX_PROCESSES: u64 = 100;

/// Hard resource caps applied to a sandbox.
///
/// These are enforced by the isolation backend, not advisory.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory limit in megabytes. Swap is capped at the same value.
    pub memory_mb: u64,
    /// CPU cores available (e.g., 0.5, 1.0, 2.0).
    pub cpu_cores: f64,
    /// Maximum number of processes allowed.
    pub max_processes: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: DEFAULT_MEMORY_MB,
            cpu_cores: DEFAULT_CPU_CORES,
            max_processes: DEFAULT_MAX_PROCESSES,
        }
    }
}

impl ResourceLimits {
    pub fn new(memory_mb: u64, cpu_cores: f64, max_processes: u64) -> Self {
        Self {
            memory_mb,
            cpu_cores,
            max_processes,
        }
    }

    /// Returns memory limit in bytes.
    pub fn memory_bytes(&self) -> i64 {
        (self.memory_mb * 1024 * 1024) as i64
    }

    /// Returns CPU period in microseconds (fixed at 100ms).
    pub fn cpu_period(&self) -> i64 {
        100_000
    }

    /// Returns CPU quota based on cores allocated.
    ///
    /// Formula: quota = period * cores, so 0.5 core = 50000 (half of one CPU).
    pub fn cpu_quota(&self) -> i64 {
        (self.cpu_period() as f64 * self.cpu_cores) as i64
    }

    /// Returns a copy with the memory ceiling scaled by `factor`.
    ///
    /// Used between retries after an out-of-memory failure.
    pub fn with_memory_scaled(mut self, factor: f64) -> Self {
        self.memory_mb = ((self.memory_mb as f64) * factor).ceil() as u64;
        self
    }

    /// Checks that every ceiling is positive.
    pub fn validate(&self) -> Result<(), String> {
        if self.memory_mb == 0 {
            return Err("memory_mb must be greater than 0".to_string());
        }
        if !self.cpu_cores.is_finite() || self.cpu_cores <= 0.0 {
            return Err(format!(
                "cpu_cores must be a positive number, got {}",
                self.cpu_cores
            ));
        }
        if self.max_processes == 0 {
            return Err("max_processes must be greater than 0".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let limits = ResourceLimits::default();
        assert_eq!(limits.memory_mb, 256);
        assert_eq!(limits.cpu_cores, 0.5);
        assert_eq!(limits.max_processes, 100);
    }

    #[test]
    fn test_memory_bytes() {
        let limits = ResourceLimits::new(512, 1.0, 50);
        assert_eq!(limits.memory_bytes(), 512 * 1024 * 1024);
    }

    #[test]
    fn test_cpu_quota() {
        assert_eq!(ResourceLimits::default().cpu_quota(), 50_000);
        assert_eq!(ResourceLimits::new(256, 2.0, 100).cpu_quota(), 200_000);
    }

    #[test]
    fn test_memory_scaling() {
        let scaled = ResourceLimits::default().with_memory_scaled(2.0);
        assert_eq!(scaled.memory_mb, 512);
        assert_eq!(scaled.cpu_cores, 0.5);
    }

    #[test]
    fn test_validate() {
        assert!(ResourceLimits::default().validate().is_ok());
        assert!(ResourceLimits::new(0, 1.0, 10).validate().is_err());
        assert!(ResourceLimits::new(64, 0.0, 10).validate().is_err());
        assert!(ResourceLimits::new(64, f64::NAN, 10).validate().is_err());
        assert!(ResourceLimits::new(64, 1.0, 0).validate().is_err());
    }
}
