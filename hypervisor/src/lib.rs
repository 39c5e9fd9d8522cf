// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//
// Copyright © 2020, Microsoft Corporation
//
// Copyright 2018-2019 CrowdStrike, Inc.
//
//

//! Native execution manager core for Hyper-V partitions
//!
//! This crate runs guest vCPUs through the Hyper-V partition interface:
//! it keeps the guest register state in sync with the hypervisor,
//! services intercept messages and keeps second level page mappings in
//! step with the physical memory manager.
//!
//! # Platform support
//!
//! - x86_64
//!

#[macro_use]
extern crate anyhow;
#[macro_use]
extern crate log;

/// Architecture specific definitions
pub mod arch;

/// Runtime configuration
pub mod config;

/// CPU related module
pub mod cpu;

/// Hyper-V backend
pub mod hyperv;

/// Host platform abstraction
pub mod hypervisor;

/// Interfaces of the surrounding VMM components
pub mod ops;

/// Partition related module
pub mod vm;

#[cfg(test)]
mod mock;

pub use crate::config::{ConfigError, ExecRing, ExitHistoryConfig, NemConfig};
pub use crate::hypervisor::{
    HypervisorError, HypervisorPlatform, ScratchPage, SlotFlags, SlotMessage, SlotWait,
    StopResult,
};
pub use cpu::{
    CpuState, EmStatus, HypervisorCpuError, Ring3Request, RunStatus, Vcpu, VcpuForceFlags,
    VmForceFlags,
};
pub use ops::VmOps;
pub use vm::{CpuTick, HypervisorVmError, Partition};
