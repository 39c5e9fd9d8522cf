// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//
// Copyright © 2020, Microsoft Corporation
//
// Copyright 2018-2019 CrowdStrike, Inc.
//
//

use crate::arch::x86::regs::IF;
use crate::arch::x86::{EventKind, Exception, ExternMask};
use crate::cpu::{
    self, nem_ensure, CpuState, EmStatus, HypervisorCpuError, Ring3Request, RunStatus, Vcpu,
    VcpuContext, VcpuForceFlags, VmForceFlags,
};
use crate::hyperv::cancel::{tpr_masked_window, INTW_F_NMI, INTW_F_REGULAR};
use crate::hyperv::history::inc;
use crate::hyperv::intercept::Trap;
use crate::hyperv::regs::VcpuRegs;
use crate::hypervisor::{HypervisorError, SlotFlags, SlotMessage, SlotWait, StopResult};
use crate::ops::InterruptAck;
use crate::vm::Partition;
use std::sync::atomic::Ordering;
use std::time::Duration;

/// Timer deadlines closer than this are polled instead of waited for.
const MIN_WAIT: Duration = Duration::from_micros(100);
const MAX_WAIT_MS: u32 = 1000;

const PENDING_INTERRUPTS: VcpuForceFlags = VcpuForceFlags::INTERRUPT_APIC
    .union(VcpuForceFlags::INTERRUPT_PIC)
    .union(VcpuForceFlags::INTERRUPT_NMI)
    .union(VcpuForceFlags::INTERRUPT_SMI);

/// How long to block in the message slot given the next timer deadline.
fn wait_timeout_ms(deadline: Duration) -> u32 {
    if deadline < MIN_WAIT {
        0
    } else if deadline < Duration::from_secs(1) {
        (deadline - MIN_WAIT).as_nanos().div_ceil(1_000_000) as u32
    } else {
        MAX_WAIT_MS
    }
}

fn run_error(e: HypervisorError) -> HypervisorCpuError {
    HypervisorCpuError::RunVcpu(e.into())
}

fn stop_error(e: HypervisorError) -> HypervisorCpuError {
    HypervisorCpuError::StopVcpu(e.into())
}

impl Partition {
    /// Runs `vcpu_id` until an exit needs the outer loop, a high priority
    /// force flag is raised or the vCPU is cancelled.
    ///
    /// Must be called on the vCPU's emulation thread.
    pub fn run_vcpu(&self, vcpu_id: u32) -> cpu::Result<RunStatus> {
        let vcpu = self.cpu_vcpu(vcpu_id)?;
        let mut cx = vcpu.lock_context()?;

        if !vcpu.state.compare_exchange(CpuState::Started, CpuState::Exec) {
            vcpu.state.compare_exchange(CpuState::Cancelled, CpuState::Started);
            debug!("vCPU {} returning immediately because cancelled", vcpu_id);
            return Ok(RunStatus::Cancelled);
        }

        let mut result = self.run_loop(vcpu, &mut cx);

        // A running VP has to be stopped before its state can be read back.
        if cx.nem.handle_flags == SlotFlags::GET_NEXT_MESSAGE {
            match self.stop_cpu(vcpu, &mut cx) {
                Ok(EmStatus::Continue) => {}
                Ok(status) => {
                    if matches!(result, Ok(RunStatus::Success | RunStatus::Cancelled)) {
                        result = Ok(status.into());
                    }
                }
                Err(e) => {
                    if result.is_ok() {
                        result = Err(e);
                    } else {
                        error!("vCPU {} failed to stop: {}", vcpu_id, e);
                    }
                }
            }
        }

        if !vcpu.state.compare_exchange(CpuState::Exec, CpuState::Started) {
            vcpu.state.compare_exchange(CpuState::Cancelled, CpuState::Started);
        }

        let mut status = match result {
            Ok(status) => status,
            Err(e) => {
                let everything =
                    ExternMask::ALL | ExternMask::INHIBIT_INT | ExternMask::INHIBIT_NMI;
                if let Err(import) = self.vcpu_regs(vcpu_id).import(&mut cx, everything) {
                    warn!("vCPU {} failed to import state after error: {}", vcpu_id, import);
                }
                return Err(e);
            }
        };

        self.import_on_exit(vcpu, &mut cx, status)?;
        if cx.nem.pending_flush_tlb && status == RunStatus::Success {
            cx.nem.pending_flush_tlb = false;
            status = RunStatus::ToRing3(Ring3Request::FlushTlb);
        }
        trace!(
            "vCPU {} leaving run loop at {:#x}: {:?}",
            vcpu_id,
            cx.ctx.rip,
            status
        );
        Ok(status)
    }

    fn run_loop(&self, vcpu: &Vcpu, cx: &mut VcpuContext) -> cpu::Result<RunStatus> {
        let id = vcpu.id();
        let regs = self.vcpu_regs(id);
        let ff = &vcpu.force_flags;

        loop {
            if self.mapped_pages() >= self.config.unmap_all_threshold
                || self.unmap_all_requested.swap(false, Ordering::AcqRel)
            {
                self.mapper()
                    .unmap_all_readable(&mut cx.page, id)
                    .map_err(|e| HypervisorCpuError::RunVcpu(e.into()))?;
            }

            if cx.nem.pending_flush_tlb {
                cx.nem.pending_flush_tlb = false;
                return Ok(RunStatus::ToRing3(Ring3Request::FlushTlb));
            }

            if ff.is_any_set(VcpuForceFlags::INTERRUPT_MASK) {
                if cx.nem.handle_flags == SlotFlags::GET_NEXT_MESSAGE {
                    let status = self.stop_cpu(vcpu, cx)?;
                    if status != EmStatus::Continue {
                        inc(&vcpu.stats.break_on_status);
                        return Ok(status.into());
                    }
                }
                let status = self.handle_interrupt_ff(vcpu, &regs, cx)?;
                if status != EmStatus::Continue {
                    inc(&vcpu.stats.break_on_status);
                    return Ok(status.into());
                }
            } else {
                cx.nem.desired_windows = 0;
            }

            let full = ExternMask::ALL | ExternMask::WIN_MASK;
            let windows_pending = cx.nem.desired_windows != 0
                || cx.nem.current_windows != cx.nem.desired_windows;
            if !cx.ctx.extern_mask.contains(full)
                || (windows_pending && cx.nem.handle_flags != SlotFlags::GET_NEXT_MESSAGE)
            {
                regs.export(cx, full)?;
            }

            if self
                .vm_ff
                .is_any_set(VmForceFlags::EMT_RENDEZVOUS | VmForceFlags::TM_VIRTUAL_SYNC)
                || ff.is_any_set(VcpuForceFlags::TO_R3_MASK)
            {
                inc(&vcpu.stats.break_on_ff);
                return Ok(RunStatus::Success);
            }

            if cx.nem.handle_flags.is_empty() {
                self.platform.start_vp(id).map_err(run_error)?;
                cx.nem.handle_flags = SlotFlags::GET_NEXT_MESSAGE;
                trace!("vCPU {} started", id);
            }

            if !vcpu.state.compare_exchange(CpuState::Exec, CpuState::Wait) {
                inc(&vcpu.stats.break_on_cancel);
                debug!("vCPU {} cancelled", id);
                return Ok(RunStatus::Cancelled);
            }
            let timeout = wait_timeout_ms(self.ops.tm.poll_next_deadline(id));
            let wait = self
                .platform
                .handle_and_get_next(id, cx.nem.handle_flags, timeout);
            // Fails when cancelled while waiting; the state stays cancelled.
            vcpu.state.compare_exchange(CpuState::Wait, CpuState::Exec);

            match wait.map_err(run_error)? {
                SlotWait::Message(SlotMessage::Hypervisor(msg)) => {
                    cx.nem.handle_flags =
                        SlotFlags::GET_NEXT_MESSAGE | SlotFlags::HANDLE_MESSAGE;
                    let status = self.handle_message(vcpu, cx, &msg)?;
                    if status != EmStatus::Continue {
                        inc(&vcpu.stats.break_on_status);
                        return Ok(status.into());
                    }
                }
                SlotWait::Message(other) => {
                    return Err(HypervisorCpuError::InvalidMessage(anyhow!(
                        "unexpected slot message {:?}",
                        other
                    )));
                }
                SlotWait::Timeout | SlotWait::Alerted | SlotWait::UserApc | SlotWait::KernelApc => {
                    // The VP keeps running, there is nothing to acknowledge.
                    cx.nem.handle_flags = SlotFlags::GET_NEXT_MESSAGE;
                }
            }

            if self.vm_ff.is_any_set(VmForceFlags::HIGH_PRIORITY_MASK)
                || ff.is_any_set(VcpuForceFlags::HIGH_PRIORITY_MASK)
            {
                inc(&vcpu.stats.break_on_ff);
                return Ok(RunStatus::Success);
            }
        }
    }

    /// Injects a pending NMI or external interrupt, or asks the platform for
    /// an interrupt window when it cannot be delivered yet.
    fn handle_interrupt_ff(
        &self,
        vcpu: &Vcpu,
        regs: &VcpuRegs<'_>,
        cx: &mut VcpuContext,
    ) -> cpu::Result<EmStatus> {
        let id = vcpu.id();
        let ff = &vcpu.force_flags;
        if ff.test_and_clear(VcpuForceFlags::UPDATE_APIC) {
            self.ops.apic.update_pending_interrupts(id, ff);
        }
        cx.nem.desired_windows = 0;
        if !ff.is_any_set(PENDING_INTERRUPTS) {
            return Ok(EmStatus::Continue);
        }
        nem_ensure!(
            !ff.is_any_set(VcpuForceFlags::INTERRUPT_SMI),
            "SMI pending on vCPU {}",
            id
        );

        let pending_nmi = ff.is_any_set(VcpuForceFlags::INTERRUPT_NMI);
        let mut need = ExternMask::INHIBIT_INT | ExternMask::RIP | ExternMask::RFLAGS;
        if pending_nmi {
            need |= ExternMask::INHIBIT_NMI;
        }
        regs.import(cx, need)?;
        let inhibited = cx.interrupts_inhibited();
        let pending_irq =
            ff.is_any_set(VcpuForceFlags::INTERRUPT_APIC | VcpuForceFlags::INTERRUPT_PIC);

        if pending_nmi {
            if !inhibited && !cx.block_nmis {
                ff.clear(VcpuForceFlags::INTERRUPT_NMI);
                inc(&vcpu.stats.injected_nmis);
                if pending_irq {
                    cx.nem.desired_windows |= INTW_F_REGULAR;
                }
                return self.inject_trap(
                    regs,
                    cx,
                    Trap::hardware(Exception::NMI.vector(), EventKind::Nmi),
                );
            }
            cx.nem.desired_windows |= INTW_F_NMI;
        }

        if pending_irq {
            if !inhibited && cx.ctx.rflags & IF != 0 {
                regs.import(cx, ExternMask::MASK_FOR_IEM_XCPT)?;
                match self.ops.pdm.get_interrupt(id, ff) {
                    InterruptAck::Vector(vector) => {
                        inc(&vcpu.stats.injected_interrupts);
                        return self.inject_trap(
                            regs,
                            cx,
                            Trap::hardware(vector, EventKind::HardwareInt),
                        );
                    }
                    InterruptAck::MaskedByTpr(vector) => {
                        cx.nem.desired_windows |= tpr_masked_window(vector);
                    }
                    InterruptAck::None => trace!("vCPU {} interrupt vanished", id),
                }
            } else {
                cx.nem.desired_windows |= INTW_F_REGULAR;
            }
        }

        if cx.nem.desired_windows != 0 {
            inc(&vcpu.stats.window_requests);
        }
        Ok(EmStatus::Continue)
    }

    /// Stops a running VP.
    ///
    /// A message that raced with the stop request is dispatched and its
    /// status returned; the stop completion is acknowledged either way.
    pub(crate) fn stop_cpu(&self, vcpu: &Vcpu, cx: &mut VcpuContext) -> cpu::Result<EmStatus> {
        let id = vcpu.id();
        match self.platform.stop_vp(id).map_err(stop_error)? {
            StopResult::Stopped => {
                inc(&vcpu.stats.stop_cpu_success);
                cx.nem.handle_flags = SlotFlags::empty();
                return Ok(EmStatus::Continue);
            }
            StopResult::Pending => inc(&vcpu.stats.stop_cpu_pending),
        }

        let timeout = self.config.stop_timeout_ms;
        let mut status = EmStatus::Continue;
        match self
            .platform
            .handle_and_get_next(id, SlotFlags::GET_NEXT_MESSAGE, timeout)
            .map_err(stop_error)?
        {
            SlotWait::Message(SlotMessage::StopRequestComplete) => {}
            SlotWait::Message(SlotMessage::Hypervisor(msg)) => {
                inc(&vcpu.stats.stop_cpu_pending_odd);
                debug!("vCPU {} handling message that raced with stop", id);
                status = self.handle_message(vcpu, cx, &msg)?;
                let next = self
                    .platform
                    .handle_and_get_next(
                        id,
                        SlotFlags::HANDLE_MESSAGE | SlotFlags::GET_NEXT_MESSAGE,
                        timeout,
                    )
                    .map_err(stop_error)?;
                nem_ensure!(
                    matches!(next, SlotWait::Message(SlotMessage::StopRequestComplete)),
                    "vCPU {} expected stop completion, got {:?}",
                    id,
                    next
                );
            }
            other => {
                return Err(HypervisorCpuError::StopVcpu(anyhow!(
                    "vCPU {} stop not acknowledged: {:?}",
                    id,
                    other
                )));
            }
        }

        self.platform
            .handle_and_get_next(id, SlotFlags::HANDLE_MESSAGE, 0)
            .map_err(stop_error)?;
        cx.nem.handle_flags = SlotFlags::empty();
        Ok(status)
    }

    /// Pulls back what the outer loop needs for `status`, leaving the rest
    /// with the platform.
    fn import_on_exit(
        &self,
        vcpu: &Vcpu,
        cx: &mut VcpuContext,
        status: RunStatus,
    ) -> cpu::Result<()> {
        let state = ExternMask::ALL | ExternMask::INHIBIT_INT | ExternMask::INHIBIT_NMI;
        if !cx.ctx.extern_mask.intersects(state) {
            if cx.ctx.extern_mask == ExternMask::KEEPER_NEM {
                cx.ctx.extern_mask = ExternMask::empty();
            }
            return Ok(());
        }

        let mut what = ExternMask::IEM_MUST | ExternMask::INHIBIT_INT | ExternMask::INHIBIT_NMI;
        match status {
            RunStatus::Halt | RunStatus::TripleFault => what = state,
            RunStatus::ToRing3(Ring3Request::IoPortWrite { .. }) => {
                what |= ExternMask::RIP | ExternMask::CS | ExternMask::RFLAGS;
            }
            RunStatus::ToRing3(Ring3Request::IoPortRead { .. }) => {
                what |= ExternMask::RIP | ExternMask::CS | ExternMask::RFLAGS | ExternMask::RAX;
            }
            _ if vcpu.force_flags.is_any_set(PENDING_INTERRUPTS) => {
                what |= ExternMask::XCPT;
            }
            _ => {}
        }
        self.vcpu_regs(vcpu.id()).import(cx, what)
    }
}
