// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::errors::ScannerError;
use std::env;
use std::time::Duration;

/// Configuration for the background socket scanner.
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Gate period the first pass starts out with. 50 ms allows 20 blocks of
    /// descriptors per second until the feedback law takes over.
    pub initial_gate_period: Duration,
    /// Hard floor on the gate period; bounds how aggressively the scan may
    /// accelerate. Zero disables the floor.
    pub min_gate_period: Duration,
    /// Hard ceiling on the gate period; guarantees at least 4 blocks of
    /// descriptors per second at the default 250 ms.
    pub max_gate_period: Duration,
    /// Maximum number of descriptors the walker may inspect per gate tick.
    pub fd_block_size: u64,
    /// Wall-clock budget for one full pass; the feedback law converges the
    /// measured pass duration toward it.
    pub target_pass_duration: Duration,
    /// Initial capacity in bytes of each snapshot buffer.
    pub buffer_capacity: usize,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            initial_gate_period: Duration::from_millis(50),
            min_gate_period: Duration::ZERO,
            max_gate_period: Duration::from_millis(250),
            fd_block_size: 300,
            target_pass_duration: Duration::from_secs(10),
            buffer_capacity: 5000,
        }
    }
}

impl ScannerConfig {
    /// Create configuration from `DD_SOCKET_SCAN_*` environment variables,
    /// keeping the defaults for anything unset or unparsable.
    pub fn from_env() -> Result<Self, ScannerError> {
        let defaults = Self::default();

        let config = Self {
            initial_gate_period: env_duration_ms("DD_SOCKET_SCAN_INITIAL_GATE_PERIOD_MS")
                .unwrap_or(defaults.initial_gate_period),
            min_gate_period: env_duration_ms("DD_SOCKET_SCAN_MIN_GATE_PERIOD_MS")
                .unwrap_or(defaults.min_gate_period),
            max_gate_period: env_duration_ms("DD_SOCKET_SCAN_MAX_GATE_PERIOD_MS")
                .unwrap_or(defaults.max_gate_period),
            fd_block_size: env::var("DD_SOCKET_SCAN_FD_BLOCK_SIZE")
                .ok()
                .and_then(|val| val.parse::<u64>().ok())
                .unwrap_or(defaults.fd_block_size),
            target_pass_duration: env_duration_ms("DD_SOCKET_SCAN_TARGET_PASS_MS")
                .unwrap_or(defaults.target_pass_duration),
            buffer_capacity: env::var("DD_SOCKET_SCAN_BUFFER_CAPACITY")
                .ok()
                .and_then(|val| val.parse::<usize>().ok())
                .unwrap_or(defaults.buffer_capacity),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ScannerError> {
        if self.initial_gate_period.is_zero() {
            return Err(ScannerError::InvalidConfig(
                "initial gate period must be greater than 0".to_string(),
            ));
        }

        if self.max_gate_period.is_zero() {
            return Err(ScannerError::InvalidConfig(
                "max gate period must be greater than 0".to_string(),
            ));
        }

        if self.target_pass_duration.is_zero() {
            return Err(ScannerError::InvalidConfig(
                "target pass duration must be greater than 0".to_string(),
            ));
        }

        if self.fd_block_size == 0 {
            return Err(ScannerError::InvalidConfig(
                "fd block size must be greater than 0".to_string(),
            ));
        }

        if self.min_gate_period > self.initial_gate_period {
            return Err(ScannerError::InvalidConfig(format!(
                "min gate period ({:?}) must not exceed the initial gate period ({:?})",
                self.min_gate_period, self.initial_gate_period
            )));
        }

        if self.initial_gate_period > self.max_gate_period {
            return Err(ScannerError::InvalidConfig(format!(
                "initial gate period ({:?}) must not exceed the max gate period ({:?})",
                self.initial_gate_period, self.max_gate_period
            )));
        }

        Ok(())
    }
}

fn env_duration_ms(name: &str) -> Option<Duration> {
    env::var(name)
        .ok()
        .and_then(|val| val.parse::<u64>().ok())
        .map(Duration::from_millis)
}
