// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//
// Copyright © 2020, Microsoft Corporation
//
// Copyright 2018-2019 CrowdStrike, Inc.
//
//

use crate::arch::x86::GuestCtx;
use crate::hypervisor::{ScratchPage, SlotFlags};
use crate::hyperv::history::{ExitHistory, ExitStats, ExitStatsSnapshot};
use bitflags::bitflags;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

/// Location and text of a failed internal consistency check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssertionInfo {
    pub file: &'static str,
    pub line: u32,
    pub expr: &'static str,
    pub message: String,
}

impl fmt::Display for AssertionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}: `{}`: {}",
            self.file, self.line, self.expr, self.message
        )
    }
}

#[derive(Error, Debug)]
///
/// Enum for CPU error
pub enum HypervisorCpuError {
    ///
    /// Setting registers error
    ///
    #[error("Failed to set registers: {0}")]
    SetRegisters(#[source] anyhow::Error),
    ///
    /// Getting registers error
    ///
    #[error("Failed to get registers: {0}")]
    GetRegisters(#[source] anyhow::Error),
    ///
    /// Running Vcpu error
    ///
    #[error("Failed to run vcpu: {0}")]
    RunVcpu(#[source] anyhow::Error),
    ///
    /// Stopping Vcpu error
    ///
    #[error("Failed to stop vcpu: {0}")]
    StopVcpu(#[source] anyhow::Error),
    ///
    /// Message payload does not match its type
    ///
    #[error("Invalid intercept message: {0}")]
    InvalidMessage(#[source] anyhow::Error),
    ///
    /// Instruction emulation error
    ///
    #[error("Failed to emulate instruction: {0}")]
    Emulation(#[source] anyhow::Error),
    ///
    /// Internal consistency check failed
    ///
    #[error("Assertion failed: {0}")]
    Assertion(AssertionInfo),
}

///
/// Result type for returning from a function
///
pub type Result<T> = anyhow::Result<T, HypervisorCpuError>;

/// Logs and returns [`HypervisorCpuError::Assertion`] unless `$cond` holds.
macro_rules! nem_ensure {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            let message = format!($($arg)+);
            log::error!(
                "{}:{}: assertion `{}` failed: {}",
                file!(),
                line!(),
                stringify!($cond),
                message
            );
            return Err($crate::cpu::HypervisorCpuError::Assertion(
                $crate::cpu::AssertionInfo {
                    file: file!(),
                    line: line!(),
                    expr: stringify!($cond),
                    message,
                },
            ));
        }
    };
}

pub(crate) use nem_ensure;

/// Work the emulation thread hands back to the outer loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ring3Request {
    /// IN needing a ring-3 device; RAX is merged by the outer loop.
    IoPortRead { port: u16, instr_len: u8, size: u8 },
    /// OUT needing a ring-3 device.
    IoPortWrite {
        port: u16,
        instr_len: u8,
        size: u8,
        value: u32,
    },
    MsrRead { msr: u32 },
    MsrWrite { msr: u32, value: u64 },
    /// CR3 changed and paging must be resynced outside of the loop.
    FlushTlb,
    /// Single step or I/O breakpoint hit after an emulated access.
    DebugEvent,
    /// The instruction has to be emulated with the full state.
    Emulator,
}

/// Status returned by the intercept handlers and the emulator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmStatus {
    Continue,
    /// The emulator raised an exception into the guest.
    RaisedXcpt,
    Halt,
    TripleFault,
    ToRing3(Ring3Request),
}

impl EmStatus {
    /// Folds `RaisedXcpt` into `Continue`.
    pub fn fold_raised_xcpt(self) -> Self {
        match self {
            EmStatus::RaisedXcpt => EmStatus::Continue,
            status => status,
        }
    }
}

/// Status returned by `run_vcpu`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    Halt,
    TripleFault,
    Cancelled,
    ToRing3(Ring3Request),
}

impl From<EmStatus> for RunStatus {
    fn from(status: EmStatus) -> Self {
        match status {
            EmStatus::Continue | EmStatus::RaisedXcpt => RunStatus::Success,
            EmStatus::Halt => RunStatus::Halt,
            EmStatus::TripleFault => RunStatus::TripleFault,
            EmStatus::ToRing3(request) => RunStatus::ToRing3(request),
        }
    }
}

/// Scheduling state of a vCPU as seen by the canceller.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuState {
    Started = 0,
    /// Executing the run loop.
    Exec = 1,
    /// Blocked in the message slot wait.
    Wait = 2,
    /// Cancellation requested, observed by the run loop.
    Cancelled = 3,
}

impl CpuState {
    fn from_raw(raw: u32) -> Self {
        match raw {
            1 => CpuState::Exec,
            2 => CpuState::Wait,
            3 => CpuState::Cancelled,
            _ => CpuState::Started,
        }
    }
}

#[derive(Debug)]
pub struct CpuStateCell(AtomicU32);

impl Default for CpuStateCell {
    fn default() -> Self {
        CpuStateCell(AtomicU32::new(CpuState::Started as u32))
    }
}

impl CpuStateCell {
    pub fn get(&self) -> CpuState {
        CpuState::from_raw(self.0.load(Ordering::Acquire))
    }

    /// Moves from `current` to `new`, returning false if the state changed
    /// underneath.
    pub fn compare_exchange(&self, current: CpuState, new: CpuState) -> bool {
        self.0
            .compare_exchange(
                current as u32,
                new as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

bitflags! {
    /// Per vCPU pending work.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct VcpuForceFlags: u32 {
        const INTERRUPT_APIC = 1 << 0;
        const INTERRUPT_PIC = 1 << 1;
        const INTERRUPT_NMI = 1 << 2;
        const INTERRUPT_SMI = 1 << 3;
        const UPDATE_APIC = 1 << 4;
        const TIMER = 1 << 5;
        const REQUEST = 1 << 6;
        const TO_R3 = 1 << 7;
        const PDM_CRITSECT = 1 << 8;
        const PGM_SYNC_CR3 = 1 << 9;

        const INTERRUPT_MASK = Self::INTERRUPT_APIC.bits()
            | Self::INTERRUPT_PIC.bits()
            | Self::INTERRUPT_NMI.bits()
            | Self::INTERRUPT_SMI.bits()
            | Self::UPDATE_APIC.bits();
        /// Work that can only be done by the outer loop.
        const TO_R3_MASK = Self::TO_R3.bits() | Self::TIMER.bits() | Self::PDM_CRITSECT.bits();
        /// Work that ends the run loop after the current exit.
        const HIGH_PRIORITY_MASK = Self::TO_R3_MASK.bits()
            | Self::REQUEST.bits()
            | Self::PGM_SYNC_CR3.bits();
    }
}

bitflags! {
    /// VM wide pending work.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct VmForceFlags: u32 {
        const EMT_RENDEZVOUS = 1 << 0;
        const TM_VIRTUAL_SYNC = 1 << 1;
        const REQUEST = 1 << 2;
        const PGM_NEED_HANDY_PAGES = 1 << 3;
        const PGM_NO_MEMORY = 1 << 4;
        const RESET = 1 << 5;
        const DEBUG_SUSPEND = 1 << 6;

        const HIGH_PRIORITY_MASK = Self::EMT_RENDEZVOUS.bits()
            | Self::TM_VIRTUAL_SYNC.bits()
            | Self::REQUEST.bits()
            | Self::PGM_NEED_HANDY_PAGES.bits()
            | Self::PGM_NO_MEMORY.bits()
            | Self::RESET.bits()
            | Self::DEBUG_SUSPEND.bits();
    }
}

macro_rules! atomic_flags_cell {
    ($(#[$attr:meta])* $cell:ident, $flags:ty) => {
        $(#[$attr])*
        #[derive(Debug, Default)]
        pub struct $cell(AtomicU32);

        impl $cell {
            pub fn get(&self) -> $flags {
                <$flags>::from_bits_retain(self.0.load(Ordering::Acquire))
            }

            pub fn set(&self, flags: $flags) {
                self.0.fetch_or(flags.bits(), Ordering::AcqRel);
            }

            pub fn clear(&self, flags: $flags) {
                self.0.fetch_and(!flags.bits(), Ordering::AcqRel);
            }

            /// Clears `flags`, returning whether any of them was set.
            pub fn test_and_clear(&self, flags: $flags) -> bool {
                self.0.fetch_and(!flags.bits(), Ordering::AcqRel) & flags.bits() != 0
            }

            pub fn is_any_set(&self, flags: $flags) -> bool {
                self.get().intersects(flags)
            }
        }
    };
}

atomic_flags_cell!(
    /// Force flags of one vCPU, raised by any thread.
    VcpuForceFlagsCell,
    VcpuForceFlags
);
atomic_flags_cell!(
    /// Force flags of the whole VM.
    VmForceFlagsCell,
    VmForceFlags
);

/// Hyper-V specific per vCPU bookkeeping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NemCpuState {
    /// Interrupt window notifications wanted on the next entry.
    pub desired_windows: u8,
    /// Interrupt window notifications the platform currently has armed.
    pub current_windows: u8,
    /// Interrupt shadow reported by the last intercept header.
    pub last_interrupt_shadow: bool,
    /// Flags for the next handle-and-get-next call.
    pub handle_flags: SlotFlags,
    /// A CR3 import could not be applied to the paging code.
    pub pending_flush_tlb: bool,
}

/// State only the emulation thread touches while the vCPU runs.
pub struct VcpuContext {
    pub ctx: GuestCtx,
    /// RIP the one instruction interrupt shadow is anchored at.
    pub inhibit_pc: Option<u64>,
    pub block_nmis: bool,
    pub nem: NemCpuState,
    pub(crate) page: ScratchPage,
    pub(crate) history: ExitHistory,
}

impl VcpuContext {
    pub(crate) fn new(page: ScratchPage, history: ExitHistory) -> Self {
        VcpuContext {
            ctx: GuestCtx::default(),
            inhibit_pc: None,
            block_nmis: false,
            nem: NemCpuState::default(),
            page,
            history,
        }
    }

    /// True while the interrupt shadow covers the current instruction.
    pub fn interrupts_inhibited(&self) -> bool {
        self.inhibit_pc == Some(self.ctx.rip)
    }
}

pub struct Vcpu {
    id: u32,
    pub(crate) state: CpuStateCell,
    pub(crate) force_flags: VcpuForceFlagsCell,
    pub(crate) context: Mutex<VcpuContext>,
    pub(crate) stats: ExitStats,
}

impl Vcpu {
    pub(crate) fn new(id: u32, context: VcpuContext) -> Self {
        Vcpu {
            id,
            state: CpuStateCell::default(),
            force_flags: VcpuForceFlagsCell::default(),
            context: Mutex::new(context),
            stats: ExitStats::default(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> CpuState {
        self.state.get()
    }

    pub fn force_flags(&self) -> &VcpuForceFlagsCell {
        &self.force_flags
    }

    pub fn stats(&self) -> ExitStatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn lock_context(&self) -> Result<MutexGuard<'_, VcpuContext>> {
        self.context.lock().map_err(|_| {
            HypervisorCpuError::RunVcpu(anyhow::anyhow!("vCPU {} context lock poisoned", self.id))
        })
    }
}
