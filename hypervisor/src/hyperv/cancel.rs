// Copyright © 2020, Microsoft Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

use crate::cpu::CpuState;
use crate::hyperv::history::inc;
use crate::vm::{HypervisorVmError, Partition, Result};

/// Interrupt window bits kept in `NemCpuState::{desired,current}_windows`.
pub const INTW_F_NMI: u8 = 0x1;
pub const INTW_F_REGULAR: u8 = 0x2;
/// Priority class (vector >> 4) of a TPR masked interrupt.
pub const INTW_F_PRIO_MASK: u8 = 0x3c;
pub const INTW_F_PRIO_SHIFT: u8 = 2;

/// Window bits to request when `vector` is held back by the TPR.
pub fn tpr_masked_window(vector: u8) -> u8 {
    (((vector >> 4) << INTW_F_PRIO_SHIFT) & INTW_F_PRIO_MASK) | INTW_F_REGULAR
}

impl Partition {
    /// Makes the run loop of `vcpu_id` return as soon as possible.
    ///
    /// Safe to call from any thread and any number of times. The vCPU
    /// context is never touched: a vCPU between exits notices the state
    /// change before its next wait, a vCPU blocked in the message slot is
    /// alerted out of it.
    pub fn cancel_vcpu(&self, vcpu_id: u32) -> Result<()> {
        let vcpu = self.vcpu(vcpu_id)?;
        loop {
            match vcpu.state.get() {
                CpuState::Exec => {
                    if vcpu.state.compare_exchange(CpuState::Exec, CpuState::Cancelled) {
                        inc(&vcpu.stats.cancel_changed_state);
                        debug!("vCPU {} cancelled while executing", vcpu_id);
                        return Ok(());
                    }
                }
                CpuState::Wait => {
                    if vcpu.state.compare_exchange(CpuState::Wait, CpuState::Cancelled) {
                        inc(&vcpu.stats.cancel_alerted);
                        debug!("vCPU {} cancelled while waiting, alerting", vcpu_id);
                        return self
                            .platform
                            .alert_vp_thread(vcpu_id)
                            .map_err(|e| HypervisorVmError::CancelVcpu(e.into()));
                    }
                }
                // Not in the run loop, or already cancelled.
                CpuState::Started | CpuState::Cancelled => return Ok(()),
            }
        }
    }
}
