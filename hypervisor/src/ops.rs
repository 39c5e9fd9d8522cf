// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//
// Copyright © 2020, Microsoft Corporation
//
// Copyright 2018-2019 CrowdStrike, Inc.
//
//

//! Interfaces of the VMM components the NEM core collaborates with.
//!
//! Physical memory (PGM), CPU database (CPUM), APIC, port I/O dispatch
//! (IOM), instruction emulation (IEM), timers (TM) and interrupt
//! controllers (PDM) live outside of this crate and are reached through
//! the traits below.

use crate::arch::x86::{EventKind, ExternMask, GuestCtx};
use crate::cpu::{self, EmStatus, VcpuForceFlagsCell};
use bitflags::bitflags;
use std::sync::Arc;
use std::time::Duration;

///
/// Guest register access handed to collaborators running on the EMT.
///
/// Reading a field whose bit is set in `extern_mask` requires an
/// `import` first.
///
pub trait GuestState {
    fn vcpu_id(&self) -> u32;
    fn ctx(&self) -> &GuestCtx;
    fn ctx_mut(&mut self) -> &mut GuestCtx;
    ///
    /// Fetch the named fields from the platform
    ///
    fn import(&mut self, what: ExternMask) -> cpu::Result<()>;
    ///
    /// Arm (`Some(rip)`) or clear the one instruction interrupt shadow
    ///
    fn set_inhibit_interrupts(&mut self, pc: Option<u64>);
}

bitflags! {
    /// Guest page protection as tracked by PGM.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct NemPageProt: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const EXECUTE = 0x4;
    }
}

/// Second level mapping state of a guest page, stored by PGM.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NemPageState {
    #[default]
    NotSet = 0,
    Unmapped = 1,
    Readable = 2,
    Writable = 3,
}

impl NemPageState {
    pub fn name(&self) -> &'static str {
        match self {
            NemPageState::NotSet => "not-set",
            NemPageState::Unmapped => "unmapped",
            NemPageState::Readable => "readable",
            NemPageState::Writable => "writable",
        }
    }
}

/// Page information produced by [`Pgm::page_info_checker`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PageInfo {
    pub hc_phys: u64,
    pub prot: NemPageProt,
    pub nem_state: NemPageState,
    /// State when the checker was entered.
    pub old_nem_state: NemPageState,
    /// Access handlers (MMIO, write monitoring) cover the page.
    pub has_handlers: bool,
}

/// Callback run by PGM with the page lock held.
pub type PageChecker<'a> = dyn FnMut(u64, &mut PageInfo) -> anyhow::Result<()> + 'a;

/// Callback run by PGM for every page in a given state.
pub type PageEnumerator<'a> = dyn FnMut(u64, &mut NemPageState) -> anyhow::Result<()> + 'a;

///
/// Physical memory manager
///
pub trait Pgm: Send + Sync {
    ///
    /// Host physical address backing guest physical address `gpa`
    ///
    fn gpa_to_hpa(&self, gpa: u64) -> anyhow::Result<u64>;
    ///
    /// Look up `gpa`, optionally making it writable, and run `checker`
    /// on it under the PGM lock. State changes made by the checker are
    /// stored back into the page descriptor.
    ///
    fn page_info_checker(
        &self,
        vcpu_id: u32,
        gpa: u64,
        make_writable: bool,
        checker: Option<&mut PageChecker<'_>>,
    ) -> anyhow::Result<PageInfo>;
    ///
    /// Run `callback` for every RAM page whose state equals `state`
    ///
    fn enum_pages_by_state(
        &self,
        vcpu_id: u32,
        state: NemPageState,
        callback: &mut PageEnumerator<'_>,
    ) -> anyhow::Result<()>;
    ///
    /// Paging mode changed (CR0, CR4 or EFER)
    ///
    fn change_mode(&self, vcpu_id: u32, cr0: u64, cr4: u64, efer: u64) -> anyhow::Result<()>;
    ///
    /// CR3 changed, resync the shadow paging structures
    ///
    fn update_cr3(&self, vcpu_id: u32, cr3: u64) -> anyhow::Result<()>;
    ///
    /// EFER.NXE toggled
    ///
    fn notify_nxe_changed(&self, vcpu_id: u32, enabled: bool);
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CpuidResult {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

/// Outcome of an MSR access.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MsrOutcome<T> {
    Done(T),
    /// The access must raise #GP(0).
    RaiseGp,
    /// The access needs the outer loop.
    Ring3,
}

///
/// CPU database and MSR emulation
///
pub trait Cpum: Send + Sync {
    fn cpuid(&self, vcpu_id: u32, leaf: u32, subleaf: u32) -> CpuidResult;
    fn read_msr(&self, guest: &mut dyn GuestState, msr: u32) -> MsrOutcome<u64>;
    fn write_msr(&self, guest: &mut dyn GuestState, msr: u32, value: u64) -> MsrOutcome<()>;
}

///
/// Local APIC
///
pub trait Apic: Send + Sync {
    fn base_msr(&self, vcpu_id: u32) -> u64;
    fn set_base_msr(&self, vcpu_id: u32, value: u64) -> anyhow::Result<()>;
    fn tpr(&self, vcpu_id: u32) -> u8;
    fn set_tpr(&self, vcpu_id: u32, tpr: u8) -> anyhow::Result<()>;
    ///
    /// Fold pending APIC state into the interrupt force flags
    ///
    fn update_pending_interrupts(&self, vcpu_id: u32, force_flags: &VcpuForceFlagsCell);
}

/// Outcome of a port access.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortIo<T> {
    Done(T),
    /// The handler lives in ring-3.
    Ring3,
}

///
/// Port I/O dispatch
///
pub trait Iom: Send + Sync {
    fn port_read(&self, vcpu_id: u32, port: u16, size: u8) -> anyhow::Result<PortIo<u32>>;
    fn port_write(&self, vcpu_id: u32, port: u16, size: u8, value: u32) -> anyhow::Result<PortIo<()>>;
    ///
    /// True when a hardware I/O breakpoint is armed in DR7
    ///
    fn io_breakpoints_armed(&self, vcpu_id: u32) -> bool;
}

///
/// Instruction emulator
///
pub trait Iem: Send + Sync {
    ///
    /// Deliver an event through the guest IDT
    ///
    fn inject_trap(
        &self,
        guest: &mut dyn GuestState,
        vector: u8,
        kind: EventKind,
        error_code: Option<u32>,
        cr2: u64,
        instruction_len: u8,
    ) -> anyhow::Result<EmStatus>;
    ///
    /// Emulate the instruction at CS:RIP
    ///
    fn execute_one(&self, guest: &mut dyn GuestState) -> anyhow::Result<EmStatus>;
    ///
    /// Emulate the instruction at CS:RIP, using `bytes` fetched at `pc`
    /// instead of reading guest memory
    ///
    fn execute_one_with_prefetched(
        &self,
        guest: &mut dyn GuestState,
        pc: u64,
        bytes: &[u8],
    ) -> anyhow::Result<EmStatus>;
}

///
/// Timer manager
///
pub trait Tm: Send + Sync {
    ///
    /// Time left until the next timer deadline of this vCPU
    ///
    fn poll_next_deadline(&self, vcpu_id: u32) -> Duration;
}

/// Interrupt acknowledge result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterruptAck {
    Vector(u8),
    /// Highest pending vector is masked by the TPR.
    MaskedByTpr(u8),
    None,
}

///
/// Interrupt controllers (PIC/APIC)
///
pub trait Pdm: Send + Sync {
    ///
    /// Acknowledge the highest priority pending interrupt, clearing the
    /// interrupt force flags once nothing else is pending
    ///
    fn get_interrupt(&self, vcpu_id: u32, force_flags: &VcpuForceFlagsCell) -> InterruptAck;
}

/// Collaborators handed to a partition.
#[derive(Clone)]
pub struct VmOps {
    pub pgm: Arc<dyn Pgm>,
    pub cpum: Arc<dyn Cpum>,
    pub apic: Arc<dyn Apic>,
    pub iom: Arc<dyn Iom>,
    pub iem: Arc<dyn Iem>,
    pub tm: Arc<dyn Tm>,
    pub pdm: Arc<dyn Pdm>,
}
