// Copyright © 2020, Microsoft Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse NEM configuration: {0}")]
    Parse(#[source] serde_json::Error),
    #[error("Invalid NEM configuration: {0}")]
    Invalid(&'static str),
}

/// Execution context the run loop lives in.
///
/// Decides whether MSR faults and CR3 reloads can be serviced in place or
/// must be handed back to the outer loop.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecRing {
    #[default]
    Ring0,
    Ring3,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitHistoryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_exit_history_size")]
    pub size: usize,
    #[serde(default = "default_hot_threshold")]
    pub hot_threshold: u32,
}

impl Default for ExitHistoryConfig {
    fn default() -> Self {
        ExitHistoryConfig {
            enabled: true,
            size: default_exit_history_size(),
            hot_threshold: default_hot_threshold(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NemConfig {
    #[serde(default = "default_deposit_pages")]
    pub deposit_pages: usize,
    #[serde(default = "default_deposit_max_attempts")]
    pub deposit_max_attempts: u32,
    #[serde(default = "default_unmap_all_threshold")]
    pub unmap_all_threshold: u32,
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u32,
    #[serde(default)]
    pub mesa_gp_workaround: bool,
    #[serde(default)]
    pub ring: ExecRing,
    #[serde(default)]
    pub exit_history: ExitHistoryConfig,
    #[serde(default = "default_true")]
    pub gpa_mask_44bit: bool,
}

fn default_true() -> bool {
    true
}

fn default_exit_history_size() -> usize {
    256
}

fn default_hot_threshold() -> u32 {
    64
}

fn default_deposit_pages() -> usize {
    512
}

fn default_deposit_max_attempts() -> u32 {
    16
}

fn default_unmap_all_threshold() -> u32 {
    4000
}

fn default_stop_timeout_ms() -> u32 {
    30000
}

impl Default for NemConfig {
    fn default() -> Self {
        NemConfig {
            deposit_pages: default_deposit_pages(),
            deposit_max_attempts: default_deposit_max_attempts(),
            unmap_all_threshold: default_unmap_all_threshold(),
            stop_timeout_ms: default_stop_timeout_ms(),
            mesa_gp_workaround: false,
            ring: ExecRing::default(),
            exit_history: ExitHistoryConfig::default(),
            gpa_mask_44bit: true,
        }
    }
}

impl NemConfig {
    /// Parses a JSON configuration handed over by the embedding VMM.
    pub fn parse(json: &str) -> Result<Self, ConfigError> {
        let config: NemConfig = serde_json::from_str(json).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.deposit_pages == 0 {
            return Err(ConfigError::Invalid("deposit_pages must not be zero"));
        }
        if self.deposit_max_attempts == 0 {
            return Err(ConfigError::Invalid("deposit_max_attempts must not be zero"));
        }
        if self.exit_history.enabled && self.exit_history.size == 0 {
            return Err(ConfigError::Invalid("exit_history.size must not be zero"));
        }
        Ok(())
    }

    pub fn in_ring0(&self) -> bool {
        self.ring == ExecRing::Ring0
    }
}
