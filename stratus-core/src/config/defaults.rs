//! Default configuration values for Stratus
//!
//! This module centralizes all default values to make them easy to find and modify.

use std::time::Duration;

// Storage defaults
pub const DEFAULT_DATABASE_PATH: &str = "./data/stratus.redb";

// Agent defaults
pub const DEFAULT_AGENT_COMMAND_WAIT_SECS: u64 = 60;
pub const DEFAULT_AGENT_PROBE_WAIT_SECS: u64 = 30;
pub const DEFAULT_AGENT_CHANNEL_DEPTH: usize = 64;

// Orchestrator wait budgets
pub const DEFAULT_MIGRATE_WAIT_SECS: u64 = 3600; // 1 hour
pub const DEFAULT_STORAGE_MIGRATE_WAIT_SECS: u64 = 6 * 3600;
pub const DEFAULT_START_WAIT_SECS: u64 = 300; // 5 minutes
pub const DEFAULT_STOP_WAIT_SECS: u64 = 120;
pub const DEFAULT_SCALE_WAIT_SECS: u64 = 120;
pub const DEFAULT_START_RETRIES: u32 = 3;

// Work ledger defaults
pub const DEFAULT_LOCK_WAIT_MS: u64 = 500;

// Placement defaults
pub const DEFAULT_PLACEMENT_MAX_RETRIES: u32 = 2;

// Recovery defaults
pub const DEFAULT_RECOVERY_ENABLED: bool = true;
pub const DEFAULT_RECOVERY_SCAN_INTERVAL_SECS: u64 = 60;

// Helper functions for Duration creation
pub const fn duration_ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

pub const fn duration_secs(secs: u64) -> Duration {
    Duration::from_secs(secs)
}
