// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//
// Copyright © 2020, Microsoft Corporation
//
// Copyright 2018-2019 CrowdStrike, Inc.
//
//

//! Intercept message handlers.
//!
//! Each handler brings the canonical context up to date with what the
//! message carries, does the minimum needed to resolve the exit and tells
//! the run loop whether to keep going.

use crate::arch::x86::regs::{RF, TF};
use crate::arch::x86::{EventKind, Exception, ExternMask, SegmentRegisterOps};
use crate::cpu::{
    self, nem_ensure, EmStatus, HypervisorCpuError, Ring3Request, Vcpu, VcpuContext,
};
use crate::hyperv::history::{inc, ExitKind};
use crate::hyperv::pages::{is_subject_to_a20, page_align, AccessCheck, A20_BIT};
use crate::hyperv::regs::{segment_from_message, GuestAccess, VcpuRegs};
use crate::hyperv::x86_64::{is_hypercall_instruction, is_mesa_backdoor};
use crate::ops::{MsrOutcome, PageInfo, PortIo};
use crate::vm::{HypervisorVmError, Partition};
use hvdef::{
    HvInterceptAccessType, HvMessage, HvMessageType, HvX64CpuidInterceptMessage,
    HvX64ExceptionInterceptMessage, HvX64HaltMessage, HvX64InterceptMessageHeader,
    HvX64InterruptionDeliverableMessage, HvX64IoPortInterceptMessage,
    HvX64MemoryInterceptMessage, HvX64MsrInterceptMessage, HvX64UnrecoverableExceptionMessage,
};
use zerocopy::{FromBytes, Immutable, KnownLayout};

/// The hypervisor reports garbage above bit 43 of intercepted GPAs.
const GPA_MASK_44BIT: u64 = (1 << 44) - 1;

/// Length of RDMSR, WRMSR and CPUID.
const TWO_BYTE_INSTRUCTION: u8 = 2;

/// An event to deliver through the guest IDT.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Trap {
    pub vector: u8,
    pub kind: EventKind,
    pub error_code: Option<u32>,
    pub cr2: u64,
    pub instruction_len: u8,
}

impl Trap {
    pub fn exception(vector: Exception, error_code: Option<u32>) -> Self {
        Trap {
            vector: vector.vector(),
            kind: EventKind::Exception,
            error_code,
            cr2: 0,
            instruction_len: 0,
        }
    }

    pub fn hardware(vector: u8, kind: EventKind) -> Self {
        Trap {
            vector,
            kind,
            error_code: None,
            cr2: 0,
            instruction_len: 0,
        }
    }
}

fn payload<T: FromBytes + KnownLayout + Immutable>(msg: &HvMessage) -> cpu::Result<T> {
    msg.as_message::<T>().ok_or_else(|| {
        HypervisorCpuError::InvalidMessage(anyhow!(
            "message type {:#x} with a {} byte payload",
            msg.header.typ.0,
            msg.header.len
        ))
    })
}

fn check_header(vcpu: &Vcpu, header: &HvX64InterceptMessageHeader) -> cpu::Result<()> {
    nem_ensure!(
        header.vp_index == vcpu.id(),
        "message for VP {} delivered to vCPU {}",
        header.vp_index,
        vcpu.id()
    );
    Ok(())
}

fn advance_rip_and_clear_rf(cx: &mut VcpuContext, len: u8) {
    cx.ctx.rip = cx.ctx.rip.wrapping_add(len as u64);
    cx.ctx.rflags &= !RF;
}

fn size_mask(size: u8) -> u64 {
    match size {
        1 => 0xff,
        2 => 0xffff,
        _ => 0xffff_ffff,
    }
}

fn instruction_bytes(bytes: &[u8; 16], count: u8) -> &[u8] {
    &bytes[..(count as usize).min(bytes.len())]
}

impl Partition {
    /// Dispatches one intercept message received on `vcpu`.
    pub(crate) fn handle_message(
        &self,
        vcpu: &Vcpu,
        cx: &mut VcpuContext,
        msg: &HvMessage,
    ) -> cpu::Result<EmStatus> {
        let typ = msg.header.typ;
        trace!("vCPU {} message {:#x}", vcpu.id(), typ.0);
        match typ {
            HvMessageType::UNMAPPED_GPA | HvMessageType::GPA_INTERCEPT => self.handle_memory(
                vcpu,
                cx,
                &payload(msg)?,
                typ == HvMessageType::UNMAPPED_GPA,
            ),
            HvMessageType::X64_IO_PORT_INTERCEPT => self.handle_io_port(vcpu, cx, &payload(msg)?),
            HvMessageType::X64_INTERRUPTION_DELIVERABLE => {
                self.handle_interrupt_window(vcpu, cx, &payload(msg)?)
            }
            HvMessageType::X64_CPUID_INTERCEPT => self.handle_cpuid(vcpu, cx, &payload(msg)?),
            HvMessageType::X64_MSR_INTERCEPT => self.handle_msr(vcpu, cx, &payload(msg)?),
            HvMessageType::X64_EXCEPTION_INTERCEPT => {
                self.handle_exception(vcpu, cx, &payload(msg)?)
            }
            HvMessageType::X64_HALT => self.handle_halt(vcpu, cx, &payload(msg)?),
            HvMessageType::UNRECOVERABLE_EXCEPTION => {
                self.handle_unrecoverable(vcpu, cx, &payload(msg)?)
            }
            _ => Err(HypervisorCpuError::InvalidMessage(anyhow!(
                "unexpected message type {:#x}",
                typ.0
            ))),
        }
    }

    /// Takes CS, RIP, RFLAGS, the interrupt shadow and CR8 from the header
    /// every intercept message starts with.
    fn copy_header(&self, cx: &mut VcpuContext, header: &HvX64InterceptMessageHeader) {
        cx.ctx.cs = segment_from_message(&header.cs_segment);
        cx.ctx.rip = header.rip;
        cx.ctx.rflags = header.rflags;

        let shadow = header.execution_state.interrupt_shadow();
        cx.nem.last_interrupt_shadow = shadow;
        cx.inhibit_pc = shadow.then_some(header.rip);
        if header.execution_state.interruption_pending() {
            // The next export must clear the platform's slot as well.
            cx.ctx.pending_event = None;
            cx.ctx.extern_mask.remove(ExternMask::EVENT_INJECT);
        }

        let tpr = header.cr8() << 4;
        if tpr != self.ops.apic.tpr(header.vp_index) {
            if let Err(e) = self.ops.apic.set_tpr(header.vp_index, tpr) {
                warn!("vCPU {} failed to update TPR: {}", header.vp_index, e);
            }
        }

        cx.ctx.extern_mask.remove(
            ExternMask::RIP
                | ExternMask::RFLAGS
                | ExternMask::CS
                | ExternMask::INHIBIT_INT
                | ExternMask::APIC_TPR,
        );
    }

    /// Returns true when the exit at CS:RIP is frequent enough to be
    /// handed to the emulator with the full state.
    fn record_exit(&self, cx: &mut VcpuContext, kind: ExitKind) -> bool {
        let pc = cx.ctx.flat_pc();
        cx.history
            .add_exit(kind, pc, self.platform.read_host_tsc())
    }

    fn execute_hot_exit(&self, vcpu: &Vcpu, cx: &mut VcpuContext) -> cpu::Result<EmStatus> {
        inc(&vcpu.stats.exit_hot);
        let regs = self.vcpu_regs(vcpu.id());
        regs.import(
            cx,
            ExternMask::ALL | ExternMask::INHIBIT_INT | ExternMask::INHIBIT_NMI,
        )?;
        debug!(
            "vCPU {} emulating hot exit at {:#x}",
            vcpu.id(),
            cx.ctx.flat_pc()
        );
        let status = self
            .ops
            .iem
            .execute_one(&mut GuestAccess { regs: &regs, cx })
            .map_err(HypervisorCpuError::Emulation)?;
        Ok(status.fold_raised_xcpt())
    }

    /// Delivers `trap` through the emulator.
    pub(crate) fn inject_trap(
        &self,
        regs: &VcpuRegs<'_>,
        cx: &mut VcpuContext,
        trap: Trap,
    ) -> cpu::Result<EmStatus> {
        regs.import(cx, ExternMask::MASK_FOR_IEM_XCPT)?;
        debug!("vCPU {} injecting {:?}", regs.vcpu_id, trap);
        let status = self
            .ops
            .iem
            .inject_trap(
                &mut GuestAccess { regs, cx },
                trap.vector,
                trap.kind,
                trap.error_code,
                trap.cr2,
                trap.instruction_len,
            )
            .map_err(HypervisorCpuError::Emulation)?;
        Ok(status.fold_raised_xcpt())
    }

    fn handle_memory(
        &self,
        vcpu: &Vcpu,
        cx: &mut VcpuContext,
        msg: &HvX64MemoryInterceptMessage,
        unmapped: bool,
    ) -> cpu::Result<EmStatus> {
        check_header(vcpu, &msg.header)?;
        self.copy_header(cx, &msg.header);
        inc(if unmapped {
            &vcpu.stats.exit_memory_unmapped
        } else {
            &vcpu.stats.exit_memory_intercept
        });

        let mut gpa = msg.guest_physical_address;
        if self.config.gpa_mask_44bit {
            gpa &= GPA_MASK_44BIT;
        }
        let dst = page_align(gpa);
        let src = if !self.a20_enabled() && is_subject_to_a20(dst) {
            dst & !A20_BIT
        } else {
            dst
        };
        let is_write = msg.header.intercept_access_type == HvInterceptAccessType::WRITE;

        let mapper = self.mapper();
        let mut check: Result<AccessCheck, HypervisorVmError> = Ok(AccessCheck::default());
        let page = &mut cx.page;
        let lookup = self.ops.pgm.page_info_checker(
            vcpu.id(),
            src,
            is_write,
            Some(&mut |_, info: &mut PageInfo| {
                check = mapper.check_memory_access(page, src, dst, is_write, info);
                Ok(())
            }),
        );
        match (lookup, check) {
            (Err(e), _) => debug!("vCPU {} no page info for {:#x}: {}", vcpu.id(), src, e),
            (Ok(_), Err(e)) => {
                // An unmap of everything is pending, the guest will fault again.
                warn!("vCPU {} could not fix up {:#x}: {}", vcpu.id(), dst, e);
                return Ok(EmStatus::Continue);
            }
            (Ok(_), Ok(check)) if check.can_resume => {
                trace!(
                    "vCPU {} resuming after fixing up {:#x} (write={})",
                    vcpu.id(),
                    dst,
                    is_write
                );
                return Ok(EmStatus::Continue);
            }
            (Ok(_), Ok(_)) => {}
        }

        let kind = if unmapped {
            ExitKind::MemoryUnmapped
        } else {
            ExitKind::MemoryIntercept
        };
        if self.record_exit(cx, kind) {
            return self.execute_hot_exit(vcpu, cx);
        }

        let regs = self.vcpu_regs(vcpu.id());
        regs.import(cx, ExternMask::MASK_FOR_IEM | ExternMask::DS | ExternMask::ES)?;
        let bytes = instruction_bytes(&msg.instruction_bytes, msg.instruction_byte_count);
        let mut guest = GuestAccess { regs: &regs, cx };
        let status = if bytes.is_empty() {
            self.ops.iem.execute_one(&mut guest)
        } else {
            self.ops
                .iem
                .execute_one_with_prefetched(&mut guest, msg.header.rip, bytes)
        }
        .map_err(HypervisorCpuError::Emulation)?;
        Ok(status.fold_raised_xcpt())
    }

    fn handle_io_port(
        &self,
        vcpu: &Vcpu,
        cx: &mut VcpuContext,
        msg: &HvX64IoPortInterceptMessage,
    ) -> cpu::Result<EmStatus> {
        check_header(vcpu, &msg.header)?;
        self.copy_header(cx, &msg.header);
        inc(&vcpu.stats.exit_port_io);

        let id = vcpu.id();
        let access = msg.access_info;
        let size = access.access_size();
        nem_ensure!(
            matches!(size, 1 | 2 | 4),
            "invalid I/O access size {}",
            size
        );
        let is_write = msg.header.intercept_access_type == HvInterceptAccessType::WRITE;
        let regs = self.vcpu_regs(id);

        if access.string_op() {
            if self.record_exit(cx, ExitKind::IoPortString) {
                return self.execute_hot_exit(vcpu, cx);
            }
            cx.ctx.rax = msg.rax;
            cx.ctx.rcx = msg.rcx;
            cx.ctx.rsi = msg.rsi;
            cx.ctx.rdi = msg.rdi;
            cx.ctx.ds = segment_from_message(&msg.ds_segment);
            cx.ctx.es = segment_from_message(&msg.es_segment);
            cx.ctx.extern_mask.remove(
                ExternMask::RAX
                    | ExternMask::RCX
                    | ExternMask::RSI
                    | ExternMask::RDI
                    | ExternMask::DS
                    | ExternMask::ES,
            );
            regs.import(cx, ExternMask::MASK_FOR_IEM | ExternMask::DS | ExternMask::ES)?;
            let status = self
                .ops
                .iem
                .execute_one(&mut GuestAccess { regs: &regs, cx })
                .map_err(HypervisorCpuError::Emulation)?;
            return Ok(status.fold_raised_xcpt());
        }

        let kind = if is_write {
            ExitKind::IoPortWrite
        } else {
            ExitKind::IoPortRead
        };
        if self.record_exit(cx, kind) {
            return self.execute_hot_exit(vcpu, cx);
        }

        let port = msg.port_number;
        let instr_len = msg.header.instruction_len();
        let mask = size_mask(size);
        cx.ctx.rax = msg.rax;
        cx.ctx.extern_mask.remove(ExternMask::RAX);

        let status = if is_write {
            let value = (msg.rax & mask) as u32;
            match self
                .ops
                .iom
                .port_write(id, port, size, value)
                .map_err(HypervisorCpuError::Emulation)?
            {
                PortIo::Done(()) => {
                    advance_rip_and_clear_rf(cx, instr_len);
                    EmStatus::Continue
                }
                PortIo::Ring3 => EmStatus::ToRing3(Ring3Request::IoPortWrite {
                    port,
                    instr_len,
                    size,
                    value,
                }),
            }
        } else {
            match self
                .ops
                .iom
                .port_read(id, port, size)
                .map_err(HypervisorCpuError::Emulation)?
            {
                PortIo::Done(value) => {
                    // 32-bit results zero the upper half of RAX.
                    cx.ctx.rax = if size == 4 {
                        value as u64
                    } else {
                        (msg.rax & !mask) | (value as u64 & mask)
                    };
                    advance_rip_and_clear_rf(cx, instr_len);
                    EmStatus::Continue
                }
                PortIo::Ring3 => EmStatus::ToRing3(Ring3Request::IoPortRead {
                    port,
                    instr_len,
                    size,
                }),
            }
        };

        let debugging = cx.ctx.rflags & TF != 0 || self.ops.iom.io_breakpoints_armed(id);
        match status {
            EmStatus::Continue if debugging => {
                debug!("vCPU {} debug event after I/O to port {:#x}", id, port);
                Ok(EmStatus::ToRing3(Ring3Request::DebugEvent))
            }
            EmStatus::ToRing3(
                Ring3Request::IoPortRead { .. } | Ring3Request::IoPortWrite { .. },
            ) if debugging => {
                // A deferred access would lose the debug trap.
                debug!(
                    "vCPU {} emulating I/O to port {:#x} while debugging",
                    id, port
                );
                regs.import(
                    cx,
                    ExternMask::ALL | ExternMask::INHIBIT_INT | ExternMask::INHIBIT_NMI,
                )?;
                let status = self
                    .ops
                    .iem
                    .execute_one(&mut GuestAccess { regs: &regs, cx })
                    .map_err(HypervisorCpuError::Emulation)?;
                Ok(status.fold_raised_xcpt())
            }
            status => Ok(status),
        }
    }

    fn handle_interrupt_window(
        &self,
        vcpu: &Vcpu,
        cx: &mut VcpuContext,
        msg: &HvX64InterruptionDeliverableMessage,
    ) -> cpu::Result<EmStatus> {
        check_header(vcpu, &msg.header)?;
        self.copy_header(cx, &msg.header);
        inc(&vcpu.stats.exit_interrupt_window);
        self.record_exit(cx, ExitKind::InterruptWindow);
        debug!(
            "vCPU {} interruption deliverable (type {}) at {:#x}",
            vcpu.id(),
            msg.deliverable_type.0,
            cx.ctx.rip
        );
        // The platform disarms the notification once it fires.
        cx.nem.current_windows = 0;
        Ok(EmStatus::Continue)
    }

    fn handle_cpuid(
        &self,
        vcpu: &Vcpu,
        cx: &mut VcpuContext,
        msg: &HvX64CpuidInterceptMessage,
    ) -> cpu::Result<EmStatus> {
        check_header(vcpu, &msg.header)?;
        self.copy_header(cx, &msg.header);
        inc(&vcpu.stats.exit_cpuid);
        if self.record_exit(cx, ExitKind::Cpuid) {
            return self.execute_hot_exit(vcpu, cx);
        }

        let leaf = msg.rax as u32;
        let subleaf = msg.rcx as u32;
        let result = self.ops.cpum.cpuid(vcpu.id(), leaf, subleaf);
        trace!(
            "vCPU {} CPUID {:#x}/{:#x} -> {:x?}",
            vcpu.id(),
            leaf,
            subleaf,
            result
        );
        cx.ctx.rax = result.eax as u64;
        cx.ctx.rbx = result.ebx as u64;
        cx.ctx.rcx = result.ecx as u64;
        cx.ctx.rdx = result.edx as u64;
        cx.ctx.extern_mask
            .remove(ExternMask::RAX | ExternMask::RBX | ExternMask::RCX | ExternMask::RDX);
        advance_rip_and_clear_rf(cx, TWO_BYTE_INSTRUCTION);
        Ok(EmStatus::Continue)
    }

    fn handle_msr(
        &self,
        vcpu: &Vcpu,
        cx: &mut VcpuContext,
        msg: &HvX64MsrInterceptMessage,
    ) -> cpu::Result<EmStatus> {
        check_header(vcpu, &msg.header)?;
        self.copy_header(cx, &msg.header);
        inc(&vcpu.stats.exit_msr);
        let is_write = msg.header.intercept_access_type == HvInterceptAccessType::WRITE;
        let kind = if is_write {
            ExitKind::MsrWrite
        } else {
            ExitKind::MsrRead
        };
        if self.record_exit(cx, kind) {
            return self.execute_hot_exit(vcpu, cx);
        }

        let regs = self.vcpu_regs(vcpu.id());
        let msr = msg.msr_number;
        if msg.header.execution_state.cpl() != 0 {
            debug!("vCPU {} MSR {:#x} access from user mode", vcpu.id(), msr);
            return self.inject_trap(&regs, cx, Trap::exception(Exception::GP, Some(0)));
        }

        regs.import(
            cx,
            ExternMask::ALL_MSRS | ExternMask::CR0 | ExternMask::CR3 | ExternMask::CR4,
        )?;
        cx.ctx.rax = msg.rax;
        cx.ctx.rdx = msg.rdx;
        cx.ctx.extern_mask.remove(ExternMask::RAX | ExternMask::RDX);

        let (outcome, request) = if is_write {
            let value = (msg.rdx << 32) | (msg.rax & 0xffff_ffff);
            let mut guest = GuestAccess {
                regs: &regs,
                cx: &mut *cx,
            };
            let outcome = match self.ops.cpum.write_msr(&mut guest, msr, value) {
                MsrOutcome::Done(()) => MsrOutcome::Done(None),
                MsrOutcome::RaiseGp => MsrOutcome::RaiseGp,
                MsrOutcome::Ring3 => MsrOutcome::Ring3,
            };
            (outcome, Ring3Request::MsrWrite { msr, value })
        } else {
            let mut guest = GuestAccess {
                regs: &regs,
                cx: &mut *cx,
            };
            let outcome = match self.ops.cpum.read_msr(&mut guest, msr) {
                MsrOutcome::Done(value) => MsrOutcome::Done(Some(value)),
                MsrOutcome::RaiseGp => MsrOutcome::RaiseGp,
                MsrOutcome::Ring3 => MsrOutcome::Ring3,
            };
            (outcome, Ring3Request::MsrRead { msr })
        };

        match outcome {
            MsrOutcome::Done(value) => {
                if let Some(value) = value {
                    cx.ctx.rax = value & 0xffff_ffff;
                    cx.ctx.rdx = value >> 32;
                }
                advance_rip_and_clear_rf(cx, TWO_BYTE_INSTRUCTION);
                Ok(EmStatus::Continue)
            }
            MsrOutcome::RaiseGp if self.config.in_ring0() => {
                debug!("vCPU {} MSR {:#x} faulted, deferring", vcpu.id(), msr);
                Ok(EmStatus::ToRing3(request))
            }
            MsrOutcome::RaiseGp => {
                self.inject_trap(&regs, cx, Trap::exception(Exception::GP, Some(0)))
            }
            MsrOutcome::Ring3 => Ok(EmStatus::ToRing3(request)),
        }
    }

    fn handle_exception(
        &self,
        vcpu: &Vcpu,
        cx: &mut VcpuContext,
        msg: &HvX64ExceptionInterceptMessage,
    ) -> cpu::Result<EmStatus> {
        check_header(vcpu, &msg.header)?;
        self.copy_header(cx, &msg.header);
        inc(&vcpu.stats.exit_exception);
        let vector = msg.vector as u8;
        self.record_exit(cx, ExitKind::Exception(vector));

        cx.ctx.rax = msg.rax;
        cx.ctx.rcx = msg.rcx;
        cx.ctx.rdx = msg.rdx;
        cx.ctx.rbx = msg.rbx;
        cx.ctx.rsp = msg.rsp;
        cx.ctx.rbp = msg.rbp;
        cx.ctx.rsi = msg.rsi;
        cx.ctx.rdi = msg.rdi;
        cx.ctx.r8 = msg.r8;
        cx.ctx.r9 = msg.r9;
        cx.ctx.r10 = msg.r10;
        cx.ctx.r11 = msg.r11;
        cx.ctx.r12 = msg.r12;
        cx.ctx.r13 = msg.r13;
        cx.ctx.r14 = msg.r14;
        cx.ctx.r15 = msg.r15;
        cx.ctx.ds = segment_from_message(&msg.ds_segment);
        cx.ctx.ss = segment_from_message(&msg.ss_segment);
        cx.ctx.extern_mask
            .remove(ExternMask::GPRS | ExternMask::DS | ExternMask::SS);

        let regs = self.vcpu_regs(vcpu.id());
        if vector == Exception::DB.vector() {
            regs.import(cx, ExternMask::DR_REGS)?;
        }

        let bytes = instruction_bytes(&msg.instruction_bytes, msg.instruction_byte_count);
        let cpl = msg.header.execution_state.cpl();
        if vector == Exception::UD.vector() {
            let long_mode = msg.header.execution_state.efer_lma() && cx.ctx.cs.long() != 0;
            if is_hypercall_instruction(bytes, long_mode) {
                return self.emulate_prefetched(&regs, cx, msg.header.rip, bytes);
            }
        } else if vector == Exception::GP.vector() && self.config.mesa_gp_workaround {
            if msg.error_code == 0 && is_mesa_backdoor(&cx.ctx, cpl, bytes) {
                debug!("vCPU {} skipping Mesa backdoor access", vcpu.id());
                advance_rip_and_clear_rf(cx, 1);
                return Ok(EmStatus::Continue);
            }
            return self.emulate_prefetched(&regs, cx, msg.header.rip, bytes);
        }

        let software = msg.exception_info.software_exception() || vector == Exception::BP.vector();
        let trap = Trap {
            vector,
            kind: if software {
                EventKind::SoftwareInt
            } else {
                EventKind::Exception
            },
            error_code: msg
                .exception_info
                .error_code_valid()
                .then_some(msg.error_code),
            cr2: if vector == Exception::PF.vector() {
                msg.exception_parameter
            } else {
                0
            },
            instruction_len: if software {
                msg.header.instruction_len()
            } else {
                0
            },
        };
        self.inject_trap(&regs, cx, trap)
    }

    fn emulate_prefetched(
        &self,
        regs: &VcpuRegs<'_>,
        cx: &mut VcpuContext,
        pc: u64,
        bytes: &[u8],
    ) -> cpu::Result<EmStatus> {
        regs.import(cx, ExternMask::MASK_FOR_IEM)?;
        let status = self
            .ops
            .iem
            .execute_one_with_prefetched(&mut GuestAccess { regs, cx }, pc, bytes)
            .map_err(HypervisorCpuError::Emulation)?;
        Ok(status.fold_raised_xcpt())
    }

    fn handle_halt(
        &self,
        vcpu: &Vcpu,
        cx: &mut VcpuContext,
        msg: &HvX64HaltMessage,
    ) -> cpu::Result<EmStatus> {
        check_header(vcpu, msg)?;
        self.copy_header(cx, msg);
        inc(&vcpu.stats.exit_halt);
        self.record_exit(cx, ExitKind::Halt);
        debug!("vCPU {} halted at {:#x}", vcpu.id(), cx.ctx.rip);
        Ok(EmStatus::Halt)
    }

    fn handle_unrecoverable(
        &self,
        vcpu: &Vcpu,
        cx: &mut VcpuContext,
        msg: &HvX64UnrecoverableExceptionMessage,
    ) -> cpu::Result<EmStatus> {
        check_header(vcpu, msg)?;
        self.copy_header(cx, msg);
        inc(&vcpu.stats.exit_unrecoverable);
        self.record_exit(cx, ExitKind::Unrecoverable);
        warn!(
            "vCPU {} unrecoverable exception at {:#x}",
            vcpu.id(),
            cx.ctx.flat_pc()
        );

        let regs = self.vcpu_regs(vcpu.id());
        regs.import(
            cx,
            ExternMask::ALL | ExternMask::INHIBIT_INT | ExternMask::INHIBIT_NMI,
        )?;
        let status = self
            .ops
            .iem
            .execute_one(&mut GuestAccess { regs: &regs, cx })
            .map_err(HypervisorCpuError::Emulation)?;
        Ok(status.fold_raised_xcpt())
    }
}
