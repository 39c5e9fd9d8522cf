// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//
// Copyright © 2020, Microsoft Corporation
//
// Copyright 2018-2019 CrowdStrike, Inc.
//
//

use super::regs::{DR7_RA1, RFLAGS_RA1};
use super::{SegmentRegister, TableRegister};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    ///
    /// Fields of [`GuestCtx`] currently held by the platform.
    ///
    /// A set bit means the canonical copy is stale and the field must be
    /// imported before it is read.
    ///
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ExternMask: u64 {
        const RAX = 1 << 0;
        const RCX = 1 << 1;
        const RDX = 1 << 2;
        const RBX = 1 << 3;
        const RSP = 1 << 4;
        const RBP = 1 << 5;
        const RSI = 1 << 6;
        const RDI = 1 << 7;
        const R8_R15 = 1 << 8;
        const RIP = 1 << 9;
        const RFLAGS = 1 << 10;

        const ES = 1 << 11;
        const CS = 1 << 12;
        const SS = 1 << 13;
        const DS = 1 << 14;
        const FS = 1 << 15;
        const GS = 1 << 16;
        const LDTR = 1 << 17;
        const TR = 1 << 18;
        const GDTR = 1 << 19;
        const IDTR = 1 << 20;

        const CR0 = 1 << 21;
        const CR2 = 1 << 22;
        const CR3 = 1 << 23;
        const CR4 = 1 << 24;
        const APIC_TPR = 1 << 25;

        const DR0_DR3 = 1 << 26;
        const DR6 = 1 << 27;
        const DR7 = 1 << 28;

        const X87 = 1 << 29;
        const SSE_AVX = 1 << 30;

        const EFER = 1 << 31;
        const KERNEL_GS_BASE = 1 << 32;
        const SYSENTER_MSRS = 1 << 33;
        const SYSCALL_MSRS = 1 << 34;
        const OTHER_MSRS = 1 << 35;

        const INHIBIT_INT = 1 << 48;
        const INHIBIT_NMI = 1 << 49;
        const EVENT_INJECT = 1 << 50;
        /// Set while the platform owns state the mask cannot name.
        const KEEPER_NEM = 1 << 63;

        const GPRS = Self::RAX.bits()
            | Self::RCX.bits()
            | Self::RDX.bits()
            | Self::RBX.bits()
            | Self::RSP.bits()
            | Self::RBP.bits()
            | Self::RSI.bits()
            | Self::RDI.bits()
            | Self::R8_R15.bits();
        const SREG = Self::ES.bits()
            | Self::CS.bits()
            | Self::SS.bits()
            | Self::DS.bits()
            | Self::FS.bits()
            | Self::GS.bits();
        const TABLE = Self::LDTR.bits() | Self::TR.bits() | Self::GDTR.bits() | Self::IDTR.bits();
        const CR_REGS = Self::CR0.bits() | Self::CR2.bits() | Self::CR3.bits() | Self::CR4.bits();
        const DR_REGS = Self::DR0_DR3.bits() | Self::DR6.bits() | Self::DR7.bits();
        const ALL_MSRS = Self::EFER.bits()
            | Self::KERNEL_GS_BASE.bits()
            | Self::SYSENTER_MSRS.bits()
            | Self::SYSCALL_MSRS.bits()
            | Self::OTHER_MSRS.bits();
        const ALL = Self::GPRS.bits()
            | Self::RIP.bits()
            | Self::RFLAGS.bits()
            | Self::SREG.bits()
            | Self::TABLE.bits()
            | Self::CR_REGS.bits()
            | Self::APIC_TPR.bits()
            | Self::DR_REGS.bits()
            | Self::X87.bits()
            | Self::SSE_AVX.bits()
            | Self::ALL_MSRS.bits();
        /// Interrupt shadow, NMI blocking and event injection state.
        const WIN_MASK = Self::INHIBIT_INT.bits()
            | Self::INHIBIT_NMI.bits()
            | Self::EVENT_INJECT.bits();

        /// Minimum the instruction emulator needs to decode anything.
        const IEM_MUST = Self::RIP.bits()
            | Self::RFLAGS.bits()
            | Self::CS.bits()
            | Self::SS.bits()
            | Self::CR0.bits()
            | Self::CR4.bits()
            | Self::EFER.bits();
        const MASK_FOR_IEM = Self::IEM_MUST.bits()
            | Self::GPRS.bits()
            | Self::INHIBIT_INT.bits()
            | Self::INHIBIT_NMI.bits();
        /// What raising an exception or delivering an interrupt may touch.
        const XCPT = Self::IEM_MUST.bits()
            | Self::RSP.bits()
            | Self::CR2.bits()
            | Self::CR3.bits()
            | Self::SREG.bits()
            | Self::TABLE.bits()
            | Self::APIC_TPR.bits()
            | Self::DR7.bits();
        const MASK_FOR_IEM_XCPT = Self::XCPT.bits()
            | Self::INHIBIT_INT.bits()
            | Self::INHIBIT_NMI.bits();
    }
}

/// Event class of an injected interruption.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    HardwareInt,
    Nmi,
    SoftwareInt,
    Exception,
}

/// Single slot for an interruption pending delivery to the guest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEvent {
    pub kind: EventKind,
    pub vector: u8,
    pub error_code: Option<u32>,
    pub instruction_len: u8,
}

/// FXSAVE style x87/SSE area.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FpuState {
    pub fcw: u16,
    pub fsw: u16,
    /// Abridged tag in the low byte.
    pub ftw: u16,
    pub fop: u16,
    pub fpu_ip: u32,
    pub cs: u16,
    pub rsrvd1: u16,
    pub fpu_dp: u32,
    pub ds: u16,
    pub rsrvd2: u16,
    pub mxcsr: u32,
    pub mxcsr_mask: u32,
    pub regs: [u128; 8],
    pub xmm: [u128; 16],
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsrState {
    pub efer: u64,
    pub kernel_gs_base: u64,
    pub sysenter_cs: u64,
    pub sysenter_eip: u64,
    pub sysenter_esp: u64,
    pub star: u64,
    pub lstar: u64,
    pub cstar: u64,
    pub sfmask: u64,
    pub pat: u64,
    pub mtrr_def_type: u64,
    /// FIX64K_00000, FIX16K_80000/A0000 and FIX4K_C0000 to FIX4K_F8000.
    pub mtrr_fix: [u64; 11],
    pub tsc_aux: u64,
}

/// Canonical guest register record of one virtual CPU.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestCtx {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,

    pub es: SegmentRegister,
    pub cs: SegmentRegister,
    pub ss: SegmentRegister,
    pub ds: SegmentRegister,
    pub fs: SegmentRegister,
    pub gs: SegmentRegister,
    pub ldtr: SegmentRegister,
    pub tr: SegmentRegister,
    pub gdtr: TableRegister,
    pub idtr: TableRegister,

    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,

    pub dr: [u64; 4],
    pub dr6: u64,
    pub dr7: u64,

    pub fpu: FpuState,
    pub msrs: MsrState,

    /// Interruption observed pending on the platform at the last import.
    pub pending_event: Option<PendingEvent>,
    pub extern_mask: ExternMask,
}

impl Default for GuestCtx {
    fn default() -> Self {
        GuestCtx {
            rax: 0,
            rcx: 0,
            rdx: 0,
            rbx: 0,
            rsp: 0,
            rbp: 0,
            rsi: 0,
            rdi: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rip: 0xfff0,
            rflags: RFLAGS_RA1,
            es: SegmentRegister::flat(0, 0x93),
            cs: SegmentRegister {
                selector: 0xf000,
                base: 0xffff_0000,
                limit: 0xffff,
                attributes: 0x9b,
            },
            ss: SegmentRegister::flat(0, 0x93),
            ds: SegmentRegister::flat(0, 0x93),
            fs: SegmentRegister::flat(0, 0x93),
            gs: SegmentRegister::flat(0, 0x93),
            ldtr: SegmentRegister::flat(0, 0x82),
            tr: SegmentRegister::flat(0, 0x8b),
            gdtr: TableRegister {
                base: 0,
                limit: 0xffff,
            },
            idtr: TableRegister {
                base: 0,
                limit: 0xffff,
            },
            cr0: 0x6000_0010,
            cr2: 0,
            cr3: 0,
            cr4: 0,
            dr: [0; 4],
            dr6: 0xffff_0ff0,
            dr7: DR7_RA1,
            fpu: FpuState {
                fcw: 0x37f,
                mxcsr: 0x1f80,
                mxcsr_mask: 0xffff,
                ..Default::default()
            },
            msrs: MsrState {
                pat: 0x0007_0406_0007_0406,
                ..Default::default()
            },
            pending_event: None,
            extern_mask: ExternMask::empty(),
        }
    }
}

impl GuestCtx {
    /// CS base plus RIP, the address the exit history keys on.
    pub fn flat_pc(&self) -> u64 {
        self.cs.base.wrapping_add(self.rip)
    }

    /// Fields in `what` the platform still holds.
    pub fn needs_import(&self, what: ExternMask) -> ExternMask {
        self.extern_mask & what
    }
}
