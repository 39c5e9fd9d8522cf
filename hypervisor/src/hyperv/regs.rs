// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//
// Copyright © 2020, Microsoft Corporation
//
// Copyright 2018-2019 CrowdStrike, Inc.
//
//

//! Register marshalling between [`GuestCtx`] and the Hyper-V register
//! namespace.
//!
//! Plain registers are described by a static table; APIC backed
//! registers, interrupt state and event injection are handled around it.

use super::hypercall::Transport;
use crate::arch::x86::regs::EFER_NXE;
use crate::arch::x86::{
    EventKind, ExternMask, GuestCtx, PendingEvent, SegmentRegister, TableRegister,
};
use crate::config::NemConfig;
use crate::cpu::{self, HypervisorCpuError, VcpuContext};
use crate::ops::{GuestState, VmOps};
use hvdef::{
    HvDeliverabilityNotificationsRegister, HvRegisterAssoc, HvRegisterName, HvRegisterValue,
    HvX64FpControlStatusRegister, HvX64InterruptStateRegister, HvX64PendingInterruptionRegister,
    HvX64PendingInterruptionType, HvX64SegmentRegister, HvX64TableRegister,
    HvX64XmmControlStatusRegister,
};

/// One register of the Hyper-V namespace backed by a [`GuestCtx`] field.
pub struct RegisterMapping {
    pub mask: ExternMask,
    pub name: HvRegisterName,
    pub load: fn(&GuestCtx) -> HvRegisterValue,
    pub store: fn(&mut GuestCtx, HvRegisterValue),
}

fn segment_to_hv(seg: &SegmentRegister) -> HvRegisterValue {
    HvX64SegmentRegister {
        base: seg.base,
        limit: seg.limit,
        selector: seg.selector,
        attributes: seg.attributes,
    }
    .into()
}

/// Segment as carried by intercept messages.
pub(crate) fn segment_from_message(seg: &HvX64SegmentRegister) -> SegmentRegister {
    SegmentRegister {
        selector: seg.selector,
        base: seg.base,
        limit: seg.limit,
        attributes: seg.attributes,
    }
}

fn segment_from_hv(value: HvRegisterValue) -> SegmentRegister {
    segment_from_message(&value.as_segment())
}

fn table_to_hv(table: &TableRegister) -> HvRegisterValue {
    HvX64TableRegister {
        pad: [0; 3],
        limit: table.limit,
        base: table.base,
    }
    .into()
}

fn table_from_hv(value: HvRegisterValue) -> TableRegister {
    let table = value.as_table();
    TableRegister {
        base: table.base,
        limit: table.limit,
    }
}

fn fp_control_status_to_hv(ctx: &GuestCtx) -> HvRegisterValue {
    let fpu = &ctx.fpu;
    HvX64FpControlStatusRegister {
        fp_control: fpu.fcw,
        fp_status: fpu.fsw,
        fp_tag: fpu.ftw as u8,
        reserved: (fpu.ftw >> 8) as u8,
        last_fp_op: fpu.fop,
        last_fp_rip: fpu.fpu_ip as u64 | (fpu.cs as u64) << 32 | (fpu.rsrvd1 as u64) << 48,
    }
    .into()
}

fn fp_control_status_from_hv(ctx: &mut GuestCtx, value: HvRegisterValue) {
    let reg = value.as_fp_control_status();
    let fpu = &mut ctx.fpu;
    fpu.fcw = reg.fp_control;
    fpu.fsw = reg.fp_status;
    fpu.ftw = reg.fp_tag as u16 | (reg.reserved as u16) << 8;
    fpu.fop = reg.last_fp_op;
    fpu.fpu_ip = reg.last_fp_rip as u32;
    fpu.cs = (reg.last_fp_rip >> 32) as u16;
    fpu.rsrvd1 = (reg.last_fp_rip >> 48) as u16;
}

fn xmm_control_status_to_hv(ctx: &GuestCtx) -> HvRegisterValue {
    let fpu = &ctx.fpu;
    HvX64XmmControlStatusRegister {
        last_fp_rdp: fpu.fpu_dp as u64 | (fpu.ds as u64) << 32 | (fpu.rsrvd2 as u64) << 48,
        xmm_status_control: fpu.mxcsr,
        xmm_status_control_mask: fpu.mxcsr_mask,
    }
    .into()
}

fn xmm_control_status_from_hv(ctx: &mut GuestCtx, value: HvRegisterValue) {
    let reg = value.as_xmm_control_status();
    let fpu = &mut ctx.fpu;
    fpu.fpu_dp = reg.last_fp_rdp as u32;
    fpu.ds = (reg.last_fp_rdp >> 32) as u16;
    fpu.rsrvd2 = (reg.last_fp_rdp >> 48) as u16;
    fpu.mxcsr = reg.xmm_status_control;
    fpu.mxcsr_mask = reg.xmm_status_control_mask;
}

macro_rules! reg64 {
    ($mask:ident, $name:ident, $($field:tt)+) => {
        RegisterMapping {
            mask: ExternMask::$mask,
            name: HvRegisterName::$name,
            load: |ctx| HvRegisterValue::from(ctx.$($field)+),
            store: |ctx, value| ctx.$($field)+ = value.as_u64(),
        }
    };
}

macro_rules! reg128 {
    ($mask:ident, $name:ident, $($field:tt)+) => {
        RegisterMapping {
            mask: ExternMask::$mask,
            name: HvRegisterName::$name,
            load: |ctx| HvRegisterValue::from(ctx.$($field)+),
            store: |ctx, value| ctx.$($field)+ = value.as_u128(),
        }
    };
}

macro_rules! seg {
    ($mask:ident, $name:ident, $field:ident) => {
        RegisterMapping {
            mask: ExternMask::$mask,
            name: HvRegisterName::$name,
            load: |ctx| segment_to_hv(&ctx.$field),
            store: |ctx, value| ctx.$field = segment_from_hv(value),
        }
    };
}

macro_rules! table {
    ($mask:ident, $name:ident, $field:ident) => {
        RegisterMapping {
            mask: ExternMask::$mask,
            name: HvRegisterName::$name,
            load: |ctx| table_to_hv(&ctx.$field),
            store: |ctx, value| ctx.$field = table_from_hv(value),
        }
    };
}

/// Registers in export order.
pub static REGISTER_MAP: &[RegisterMapping] = &[
    reg64!(RAX, RAX, rax),
    reg64!(RCX, RCX, rcx),
    reg64!(RDX, RDX, rdx),
    reg64!(RBX, RBX, rbx),
    reg64!(RSP, RSP, rsp),
    reg64!(RBP, RBP, rbp),
    reg64!(RSI, RSI, rsi),
    reg64!(RDI, RDI, rdi),
    reg64!(R8_R15, R8, r8),
    reg64!(R8_R15, R9, r9),
    reg64!(R8_R15, R10, r10),
    reg64!(R8_R15, R11, r11),
    reg64!(R8_R15, R12, r12),
    reg64!(R8_R15, R13, r13),
    reg64!(R8_R15, R14, r14),
    reg64!(R8_R15, R15, r15),
    reg64!(RIP, RIP, rip),
    reg64!(RFLAGS, RFLAGS, rflags),
    seg!(CS, CS, cs),
    seg!(ES, ES, es),
    seg!(SS, SS, ss),
    seg!(DS, DS, ds),
    seg!(FS, FS, fs),
    seg!(GS, GS, gs),
    seg!(LDTR, LDTR, ldtr),
    // The hypervisor insists on a busy TSS.
    RegisterMapping {
        mask: ExternMask::TR,
        name: HvRegisterName::TR,
        load: |ctx| segment_to_hv(&ctx.tr.with_tss_busy()),
        store: |ctx, value| ctx.tr = segment_from_hv(value).with_tss_busy(),
    },
    table!(IDTR, IDTR, idtr),
    table!(GDTR, GDTR, gdtr),
    reg64!(CR0, CR0, cr0),
    reg64!(CR2, CR2, cr2),
    reg64!(CR3, CR3, cr3),
    reg64!(CR4, CR4, cr4),
    reg64!(DR0_DR3, DR0, dr[0]),
    reg64!(DR0_DR3, DR1, dr[1]),
    reg64!(DR0_DR3, DR2, dr[2]),
    reg64!(DR0_DR3, DR3, dr[3]),
    reg64!(DR6, DR6, dr6),
    reg64!(DR7, DR7, dr7),
    reg128!(X87, FP_MMX0, fpu.regs[0]),
    reg128!(X87, FP_MMX1, fpu.regs[1]),
    reg128!(X87, FP_MMX2, fpu.regs[2]),
    reg128!(X87, FP_MMX3, fpu.regs[3]),
    reg128!(X87, FP_MMX4, fpu.regs[4]),
    reg128!(X87, FP_MMX5, fpu.regs[5]),
    reg128!(X87, FP_MMX6, fpu.regs[6]),
    reg128!(X87, FP_MMX7, fpu.regs[7]),
    RegisterMapping {
        mask: ExternMask::X87,
        name: HvRegisterName::FP_CONTROL_STATUS,
        load: fp_control_status_to_hv,
        store: fp_control_status_from_hv,
    },
    RegisterMapping {
        mask: ExternMask::X87.union(ExternMask::SSE_AVX),
        name: HvRegisterName::XMM_CONTROL_STATUS,
        load: xmm_control_status_to_hv,
        store: xmm_control_status_from_hv,
    },
    reg128!(SSE_AVX, XMM0, fpu.xmm[0]),
    reg128!(SSE_AVX, XMM1, fpu.xmm[1]),
    reg128!(SSE_AVX, XMM2, fpu.xmm[2]),
    reg128!(SSE_AVX, XMM3, fpu.xmm[3]),
    reg128!(SSE_AVX, XMM4, fpu.xmm[4]),
    reg128!(SSE_AVX, XMM5, fpu.xmm[5]),
    reg128!(SSE_AVX, XMM6, fpu.xmm[6]),
    reg128!(SSE_AVX, XMM7, fpu.xmm[7]),
    reg128!(SSE_AVX, XMM8, fpu.xmm[8]),
    reg128!(SSE_AVX, XMM9, fpu.xmm[9]),
    reg128!(SSE_AVX, XMM10, fpu.xmm[10]),
    reg128!(SSE_AVX, XMM11, fpu.xmm[11]),
    reg128!(SSE_AVX, XMM12, fpu.xmm[12]),
    reg128!(SSE_AVX, XMM13, fpu.xmm[13]),
    reg128!(SSE_AVX, XMM14, fpu.xmm[14]),
    reg128!(SSE_AVX, XMM15, fpu.xmm[15]),
    reg64!(EFER, EFER, msrs.efer),
    reg64!(KERNEL_GS_BASE, KERNEL_GS_BASE, msrs.kernel_gs_base),
    reg64!(SYSENTER_MSRS, SYSENTER_CS, msrs.sysenter_cs),
    reg64!(SYSENTER_MSRS, SYSENTER_EIP, msrs.sysenter_eip),
    reg64!(SYSENTER_MSRS, SYSENTER_ESP, msrs.sysenter_esp),
    reg64!(SYSCALL_MSRS, STAR, msrs.star),
    reg64!(SYSCALL_MSRS, LSTAR, msrs.lstar),
    reg64!(SYSCALL_MSRS, CSTAR, msrs.cstar),
    reg64!(SYSCALL_MSRS, SFMASK, msrs.sfmask),
    reg64!(OTHER_MSRS, PAT, msrs.pat),
    reg64!(OTHER_MSRS, MTRR_DEF_TYPE, msrs.mtrr_def_type),
    reg64!(OTHER_MSRS, MTRR_FIX64K_00000, msrs.mtrr_fix[0]),
    reg64!(OTHER_MSRS, MTRR_FIX16K_80000, msrs.mtrr_fix[1]),
    reg64!(OTHER_MSRS, MTRR_FIX16K_A0000, msrs.mtrr_fix[2]),
    reg64!(OTHER_MSRS, MTRR_FIX4K_C0000, msrs.mtrr_fix[3]),
    reg64!(OTHER_MSRS, MTRR_FIX4K_C8000, msrs.mtrr_fix[4]),
    reg64!(OTHER_MSRS, MTRR_FIX4K_D0000, msrs.mtrr_fix[5]),
    reg64!(OTHER_MSRS, MTRR_FIX4K_D8000, msrs.mtrr_fix[6]),
    reg64!(OTHER_MSRS, MTRR_FIX4K_E0000, msrs.mtrr_fix[7]),
    reg64!(OTHER_MSRS, MTRR_FIX4K_E8000, msrs.mtrr_fix[8]),
    reg64!(OTHER_MSRS, MTRR_FIX4K_F0000, msrs.mtrr_fix[9]),
    reg64!(OTHER_MSRS, MTRR_FIX4K_F8000, msrs.mtrr_fix[10]),
    reg64!(OTHER_MSRS, TSC_AUX, msrs.tsc_aux),
];

/// How an imported value is applied.
#[derive(Clone, Copy)]
enum ImportSlot {
    Mapped(&'static RegisterMapping),
    Cr8,
    ApicBase,
    InterruptState,
    PendingInterruption,
    PendingEvent,
}

fn pending_event_from_hv(reg: HvX64PendingInterruptionRegister) -> Option<PendingEvent> {
    if !reg.interruption_pending() {
        return None;
    }
    let kind = match HvX64PendingInterruptionType(reg.interruption_type()) {
        HvX64PendingInterruptionType::EXTERNAL => EventKind::HardwareInt,
        HvX64PendingInterruptionType::NMI => EventKind::Nmi,
        HvX64PendingInterruptionType::SOFTWARE_INTERRUPT => EventKind::SoftwareInt,
        _ => EventKind::Exception,
    };
    Some(PendingEvent {
        kind,
        vector: reg.interruption_vector() as u8,
        error_code: reg.deliver_error_code().then_some(reg.error_code()),
        instruction_len: reg.instruction_length(),
    })
}

/// Register access of one vCPU.
pub struct VcpuRegs<'a> {
    pub transport: Transport<'a>,
    pub ops: &'a VmOps,
    pub config: &'a NemConfig,
    pub vcpu_id: u32,
}

impl VcpuRegs<'_> {
    /// Pushes the locally owned fields in `what` to the platform.
    ///
    /// Exported fields become external. Interrupt window notifications
    /// are re-armed whenever some are wanted.
    pub fn export(&self, cx: &mut VcpuContext, what: ExternMask) -> cpu::Result<()> {
        let what = what & !cx.ctx.extern_mask & (ExternMask::ALL | ExternMask::WIN_MASK);
        let windows_changed =
            cx.nem.desired_windows != 0 || cx.nem.desired_windows != cx.nem.current_windows;
        if what.is_empty() && !windows_changed {
            return Ok(());
        }

        let ctx = &cx.ctx;
        let mut assocs: Vec<HvRegisterAssoc> = REGISTER_MAP
            .iter()
            .filter(|reg| what.intersects(reg.mask))
            .map(|reg| (reg.name, (reg.load)(ctx)).into())
            .collect();

        if what.contains(ExternMask::APIC_TPR) {
            let cr8 = (self.ops.apic.tpr(self.vcpu_id) >> 4) as u64;
            assocs.push((HvRegisterName::CR8, cr8).into());
        }
        if what.contains(ExternMask::OTHER_MSRS) {
            assocs.push((HvRegisterName::APIC_BASE, self.ops.apic.base_msr(self.vcpu_id)).into());
        }

        // Injection goes through the emulator, never through this register.
        if what.contains(ExternMask::EVENT_INJECT) {
            assocs.push((HvRegisterName::PENDING_INTERRUPTION, 0u64).into());
        }

        let inhibit = ExternMask::INHIBIT_INT | ExternMask::INHIBIT_NMI;
        let interrupt_state = HvX64InterruptStateRegister::new()
            .with_interrupt_shadow(cx.interrupts_inhibited())
            .with_nmi_masked(cx.block_nmis);
        if what.contains(inhibit) {
            assocs.push((HvRegisterName::INTERRUPT_STATE, interrupt_state).into());
        } else if what.contains(ExternMask::INHIBIT_INT)
            && (cx.nem.last_interrupt_shadow || cx.interrupts_inhibited())
        {
            assocs.push((HvRegisterName::INTERRUPT_STATE, interrupt_state).into());
        }

        if windows_changed {
            let desired = cx.nem.desired_windows;
            debug!(
                "vCPU {} interrupt windows {:#x} -> {:#x}",
                self.vcpu_id, cx.nem.current_windows, desired
            );
            let notifications = HvDeliverabilityNotificationsRegister::new()
                .with_nmi_notification(desired & super::cancel::INTW_F_NMI != 0)
                .with_interrupt_notification(desired & super::cancel::INTW_F_REGULAR != 0)
                .with_interrupt_priority(
                    (desired & super::cancel::INTW_F_PRIO_MASK) >> super::cancel::INTW_F_PRIO_SHIFT,
                );
            assocs.push((HvRegisterName::DELIVERABILITY_NOTIFICATIONS, notifications).into());
        }

        self.transport
            .set_vp_registers(&mut cx.page, self.vcpu_id, &assocs)
            .map_err(|e| HypervisorCpuError::SetRegisters(e.into()))?;

        cx.nem.current_windows = cx.nem.desired_windows;
        if what.contains(ExternMask::EVENT_INJECT) {
            cx.ctx.pending_event = None;
        }
        cx.ctx.extern_mask |= what | ExternMask::KEEPER_NEM;
        Ok(())
    }

    /// Fetches the external fields in `what` from the platform.
    pub fn import(&self, cx: &mut VcpuContext, what: ExternMask) -> cpu::Result<()> {
        let mut what = what & cx.ctx.extern_mask;
        if what.contains(ExternMask::DR0_DR3) && cx.ctx.extern_mask.contains(ExternMask::DR7) {
            what |= ExternMask::DR7;
        }
        if what.intersects(ExternMask::INHIBIT_INT | ExternMask::INHIBIT_NMI) {
            // The shadow is anchored at the current RIP.
            what |= cx.ctx.extern_mask & ExternMask::RIP;
        }
        if what.is_empty() {
            return Ok(());
        }

        let mut slots: Vec<ImportSlot> = REGISTER_MAP
            .iter()
            .filter(|reg| what.intersects(reg.mask))
            .map(ImportSlot::Mapped)
            .collect();
        let mut names: Vec<HvRegisterName> = REGISTER_MAP
            .iter()
            .filter(|reg| what.intersects(reg.mask))
            .map(|reg| reg.name)
            .collect();
        let mut push = |slot, name| {
            slots.push(slot);
            names.push(name);
        };
        if what.contains(ExternMask::APIC_TPR) {
            push(ImportSlot::Cr8, HvRegisterName::CR8);
        }
        if what.contains(ExternMask::OTHER_MSRS) {
            push(ImportSlot::ApicBase, HvRegisterName::APIC_BASE);
        }
        if what.intersects(ExternMask::INHIBIT_INT | ExternMask::INHIBIT_NMI) {
            push(ImportSlot::InterruptState, HvRegisterName::INTERRUPT_STATE);
        }
        if what.contains(ExternMask::EVENT_INJECT) {
            push(
                ImportSlot::PendingInterruption,
                HvRegisterName::PENDING_INTERRUPTION,
            );
            push(ImportSlot::PendingEvent, HvRegisterName::PENDING_EVENT0);
            push(ImportSlot::PendingEvent, HvRegisterName::PENDING_EVENT1);
        }

        let mut values = vec![HvRegisterValue::default(); names.len()];
        self.transport
            .get_vp_registers(&mut cx.page, self.vcpu_id, &names, &mut values)
            .map_err(|e| HypervisorCpuError::GetRegisters(e.into()))?;

        let old_cr0 = cx.ctx.cr0;
        let old_cr3 = cx.ctx.cr3;
        let old_cr4 = cx.ctx.cr4;
        let old_efer = cx.ctx.msrs.efer;

        let mut interrupt_state = None;
        for (slot, value) in slots.iter().zip(values.iter()) {
            match slot {
                ImportSlot::Mapped(reg) => (reg.store)(&mut cx.ctx, *value),
                ImportSlot::Cr8 => {
                    let tpr = ((value.as_u64() & 0xf) << 4) as u8;
                    if tpr != self.ops.apic.tpr(self.vcpu_id) {
                        if let Err(e) = self.ops.apic.set_tpr(self.vcpu_id, tpr) {
                            warn!("vCPU {} failed to set TPR {:#x}: {}", self.vcpu_id, tpr, e);
                        }
                    }
                }
                ImportSlot::ApicBase => {
                    let base = value.as_u64();
                    if base != self.ops.apic.base_msr(self.vcpu_id) {
                        if let Err(e) = self.ops.apic.set_base_msr(self.vcpu_id, base) {
                            warn!(
                                "vCPU {} failed to set APIC base {:#x}: {}",
                                self.vcpu_id, base, e
                            );
                        }
                    }
                }
                ImportSlot::InterruptState => {
                    interrupt_state = Some(HvX64InterruptStateRegister::from(*value));
                }
                ImportSlot::PendingInterruption => {
                    let reg = HvX64PendingInterruptionRegister::from(*value);
                    cx.ctx.pending_event = pending_event_from_hv(reg);
                    if let Some(event) = cx.ctx.pending_event {
                        warn!(
                            "vCPU {} has a pending interruption: {:?}",
                            self.vcpu_id, event
                        );
                    }
                }
                ImportSlot::PendingEvent => {
                    if value.as_u128() & 1 != 0 {
                        debug!("vCPU {} pending event {:?}", self.vcpu_id, value);
                    }
                }
            }
        }

        if let Some(state) = interrupt_state {
            if what.contains(ExternMask::INHIBIT_INT) {
                cx.inhibit_pc = state.interrupt_shadow().then_some(cx.ctx.rip);
            }
            if what.contains(ExternMask::INHIBIT_NMI) {
                cx.block_nmis = state.nmi_masked();
            }
        }

        if what.intersects(ExternMask::CR0 | ExternMask::CR4 | ExternMask::EFER)
            && (cx.ctx.cr0 != old_cr0 || cx.ctx.cr4 != old_cr4 || cx.ctx.msrs.efer != old_efer)
        {
            if let Err(e) = self.ops.pgm.change_mode(
                self.vcpu_id,
                cx.ctx.cr0,
                cx.ctx.cr4,
                cx.ctx.msrs.efer,
            ) {
                warn!("vCPU {} paging mode change failed: {}", self.vcpu_id, e);
            }
        }
        if what.contains(ExternMask::EFER) && (cx.ctx.msrs.efer ^ old_efer) & EFER_NXE != 0 {
            self.ops
                .pgm
                .notify_nxe_changed(self.vcpu_id, cx.ctx.msrs.efer & EFER_NXE != 0);
        }
        if what.contains(ExternMask::CR3) && cx.ctx.cr3 != old_cr3 {
            if self.config.in_ring0() {
                cx.nem.pending_flush_tlb = true;
            } else if let Err(e) = self.ops.pgm.update_cr3(self.vcpu_id, cx.ctx.cr3) {
                warn!("vCPU {} CR3 update failed: {}", self.vcpu_id, e);
                cx.nem.pending_flush_tlb = true;
            }
        }

        cx.ctx.extern_mask &= !what;
        if !cx
            .ctx
            .extern_mask
            .intersects(ExternMask::ALL | ExternMask::WIN_MASK)
        {
            cx.ctx.extern_mask = ExternMask::empty();
        }
        Ok(())
    }
}

/// [`GuestState`] view handed to the emulator and the other collaborators.
pub struct GuestAccess<'a, 'b> {
    pub regs: &'a VcpuRegs<'b>,
    pub cx: &'a mut VcpuContext,
}

impl GuestState for GuestAccess<'_, '_> {
    fn vcpu_id(&self) -> u32 {
        self.regs.vcpu_id
    }

    fn ctx(&self) -> &GuestCtx {
        &self.cx.ctx
    }

    fn ctx_mut(&mut self) -> &mut GuestCtx {
        &mut self.cx.ctx
    }

    fn import(&mut self, what: ExternMask) -> cpu::Result<()> {
        self.regs.import(self.cx, what)
    }

    fn set_inhibit_interrupts(&mut self, pc: Option<u64>) {
        self.cx.inhibit_pc = pc;
        self.cx.ctx.extern_mask.remove(ExternMask::INHIBIT_INT);
    }
}
