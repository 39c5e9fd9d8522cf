// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//
// Copyright © 2020, Microsoft Corporation
//
// Copyright 2018-2019 CrowdStrike, Inc.
//
//

use crate::arch::x86::{ExternMask, GuestCtx};
use crate::config::NemConfig;
use crate::cpu::{self, HypervisorCpuError, Vcpu, VcpuContext, VmForceFlagsCell};
use crate::hyperv::history::{ExitHistory, ExitStatsSnapshot, PageStats, PageStatsSnapshot};
use crate::hyperv::hypercall::Transport;
use crate::hyperv::pages::{PageMapper, A20_BIT, A20_WINDOW};
use crate::hyperv::regs::VcpuRegs;
use crate::hypervisor::{HypervisorError, HypervisorPlatform, ScratchPage};
use crate::ops::{NemPageProt, NemPageState, VmOps};
use hvdef::{HvRegisterName, HvRegisterValue, HV_PAGE_SIZE};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use thiserror::Error;
use vm_memory::{Address, GuestAddress};

#[derive(Error, Debug)]
///
/// Enum for VM error
pub enum HypervisorVmError {
    ///
    /// vCPU initialization error
    ///
    #[error("Failed to initialize vCPU: {0}")]
    InitVcpu(#[source] anyhow::Error),
    ///
    /// Map guest physical pages error
    ///
    #[error("Failed to map guest physical pages: {0}")]
    MapGpa(#[source] anyhow::Error),
    ///
    /// Unmap guest physical pages error
    ///
    #[error("Failed to unmap guest physical pages: {0}")]
    UnmapGpa(#[source] anyhow::Error),
    ///
    /// Query CPU tick error
    ///
    #[error("Failed to query CPU tick: {0}")]
    QueryCpuTick(#[source] anyhow::Error),
    ///
    /// Resume CPU tick error
    ///
    #[error("Failed to resume CPU tick: {0}")]
    ResumeCpuTick(#[source] anyhow::Error),
    ///
    /// Cancel vCPU error
    ///
    #[error("Failed to cancel vCPU: {0}")]
    CancelVcpu(#[source] anyhow::Error),
    ///
    /// vCPU index out of range or not initialized
    ///
    #[error("Invalid vCPU {0}")]
    InvalidVcpu(u32),
}

///
/// Result type for returning from a function
///
pub type Result<T> = std::result::Result<T, HypervisorVmError>;

/// Guest visible time stamp counter of one vCPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CpuTick {
    pub tsc: u64,
    pub tsc_aux: u32,
}

/// A Hyper-V partition and the vCPUs running in it.
pub struct Partition {
    id: u64,
    pub(crate) platform: Arc<dyn HypervisorPlatform>,
    pub(crate) ops: VmOps,
    pub(crate) config: NemConfig,
    vcpus: Vec<OnceLock<Vcpu>>,
    pub(crate) mapped_pages: AtomicU32,
    pub(crate) unmap_all_requested: AtomicBool,
    a20_enabled: AtomicBool,
    pub(crate) vm_ff: VmForceFlagsCell,
    /// Scratch page for callers that are not a vCPU thread.
    global_page: Mutex<ScratchPage>,
    pub(crate) page_stats: PageStats,
}

impl Partition {
    /// Creates a partition for `cpu_count` vCPUs.
    ///
    /// Fails when the host lacks the hypercall or memory deposit entry
    /// points.
    pub fn new(
        platform: Arc<dyn HypervisorPlatform>,
        ops: VmOps,
        config: NemConfig,
        cpu_count: u32,
    ) -> std::result::Result<Self, HypervisorError> {
        config
            .validate()
            .map_err(|e| HypervisorError::CreatePartition(e.into()))?;
        platform.check_entry_points()?;
        let id = platform.create_partition(cpu_count)?;
        let global_page = platform.allocate_scratch_page()?;
        info!("Created partition {:#x} with {} vCPUs", id, cpu_count);

        Ok(Partition {
            id,
            platform,
            ops,
            config,
            vcpus: (0..cpu_count).map(|_| OnceLock::new()).collect(),
            mapped_pages: AtomicU32::new(0),
            unmap_all_requested: AtomicBool::new(false),
            a20_enabled: AtomicBool::new(true),
            vm_ff: VmForceFlagsCell::default(),
            global_page: Mutex::new(global_page),
            page_stats: PageStats::default(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &NemConfig {
        &self.config
    }

    pub fn cpu_count(&self) -> u32 {
        self.vcpus.len() as u32
    }

    /// Allocates the per vCPU scratch page and exit history.
    pub fn init_vcpu(&self, vcpu_id: u32) -> Result<()> {
        let slot = self
            .vcpus
            .get(vcpu_id as usize)
            .ok_or(HypervisorVmError::InvalidVcpu(vcpu_id))?;
        let page = self
            .platform
            .allocate_scratch_page()
            .map_err(|e| HypervisorVmError::InitVcpu(e.into()))?;
        let context = VcpuContext::new(page, ExitHistory::new(&self.config.exit_history));
        slot.set(Vcpu::new(vcpu_id, context)).map_err(|_| {
            HypervisorVmError::InitVcpu(anyhow!("vCPU {} already initialized", vcpu_id))
        })?;
        info!("Initialized vCPU {} of partition {:#x}", vcpu_id, self.id);
        Ok(())
    }

    pub fn vcpu(&self, vcpu_id: u32) -> Result<&Vcpu> {
        self.vcpus
            .get(vcpu_id as usize)
            .and_then(OnceLock::get)
            .ok_or(HypervisorVmError::InvalidVcpu(vcpu_id))
    }

    pub(crate) fn cpu_vcpu(&self, vcpu_id: u32) -> cpu::Result<&Vcpu> {
        self.vcpu(vcpu_id)
            .map_err(|e| HypervisorCpuError::RunVcpu(e.into()))
    }

    /// Locks the register state of a vCPU that is not running.
    pub fn vcpu_context(&self, vcpu_id: u32) -> cpu::Result<MutexGuard<'_, VcpuContext>> {
        self.cpu_vcpu(vcpu_id)?.lock_context()
    }

    /// Fetches the fields in `what` from the platform into the canonical
    /// record.
    pub fn import_state(&self, vcpu_id: u32, what: ExternMask) -> cpu::Result<()> {
        let mut cx = self.vcpu_context(vcpu_id)?;
        self.vcpu_regs(vcpu_id).import(&mut cx, what)
    }

    /// Imports everything and returns a copy of the guest registers.
    pub fn guest_ctx(&self, vcpu_id: u32) -> cpu::Result<GuestCtx> {
        let mut cx = self.vcpu_context(vcpu_id)?;
        self.vcpu_regs(vcpu_id)
            .import(&mut cx, ExternMask::ALL | ExternMask::WIN_MASK)?;
        Ok(cx.ctx.clone())
    }

    pub fn vcpu_stats(&self, vcpu_id: u32) -> Result<ExitStatsSnapshot> {
        Ok(self.vcpu(vcpu_id)?.stats())
    }

    pub fn page_stats(&self) -> PageStatsSnapshot {
        self.page_stats.snapshot()
    }

    pub fn mapped_pages(&self) -> u32 {
        self.mapped_pages.load(Ordering::Acquire)
    }

    pub fn vm_force_flags(&self) -> &VmForceFlagsCell {
        &self.vm_ff
    }

    pub(crate) fn transport(&self) -> Transport<'_> {
        Transport::new(self.platform.as_ref(), self.id, &self.config)
    }

    pub(crate) fn mapper(&self) -> PageMapper<'_> {
        PageMapper {
            transport: self.transport(),
            pgm: self.ops.pgm.as_ref(),
            mapped_pages: &self.mapped_pages,
            unmap_all_requested: &self.unmap_all_requested,
            stats: &self.page_stats,
        }
    }

    pub(crate) fn vcpu_regs(&self, vcpu_id: u32) -> VcpuRegs<'_> {
        VcpuRegs {
            transport: self.transport(),
            ops: &self.ops,
            config: &self.config,
            vcpu_id,
        }
    }

    fn lock_global_page(&self) -> Result<MutexGuard<'_, ScratchPage>> {
        self.global_page
            .lock()
            .map_err(|_| HypervisorVmError::MapGpa(anyhow!("global scratch page lock poisoned")))
    }

    pub fn a20_enabled(&self) -> bool {
        self.a20_enabled.load(Ordering::Acquire)
    }

    /// Opens or closes the A20 gate.
    ///
    /// Aliases in the first 64 KiB above 1 MiB are dropped either way so the
    /// next access maps whatever the new gate state selects.
    pub fn set_a20(&self, enabled: bool) -> Result<()> {
        if self.a20_enabled.swap(enabled, Ordering::AcqRel) == enabled {
            return Ok(());
        }
        debug!("A20 gate {}", if enabled { "enabled" } else { "disabled" });
        let mut page = self.lock_global_page()?;
        let mapper = self.mapper();
        for offset in (0..A20_WINDOW).step_by(HV_PAGE_SIZE) {
            mapper.unmap_for_a20_gate(&mut page, 0, A20_BIT + offset)?;
        }
        Ok(())
    }

    fn notify_phys_page(
        &self,
        gpa: GuestAddress,
        prot: NemPageProt,
        state: &mut NemPageState,
        backing_changed: bool,
    ) -> Result<()> {
        let mut page = self.lock_global_page()?;
        self.mapper().update_page(
            &mut page,
            0,
            gpa.raw_value(),
            prot,
            state,
            backing_changed,
            self.a20_enabled(),
        )
    }

    /// PGM allocated backing for a page that had none.
    pub fn notify_phys_page_allocated(
        &self,
        gpa: GuestAddress,
        prot: NemPageProt,
        state: &mut NemPageState,
    ) -> Result<()> {
        self.notify_phys_page(gpa, prot, state, false)
    }

    /// PGM changed the protection of a page.
    pub fn notify_phys_page_prot_changed(
        &self,
        gpa: GuestAddress,
        prot: NemPageProt,
        state: &mut NemPageState,
    ) -> Result<()> {
        self.notify_phys_page(gpa, prot, state, false)
    }

    /// PGM replaced the host page backing `gpa`.
    pub fn notify_phys_page_changed(
        &self,
        gpa: GuestAddress,
        prot: NemPageProt,
        state: &mut NemPageState,
    ) -> Result<()> {
        self.notify_phys_page(gpa, prot, state, true)
    }

    pub fn notify_phys_ram_register(&self, gpa: GuestAddress, size: u64) {
        debug!(
            "RAM registered at {:#x}, {:#x} bytes",
            gpa.raw_value(),
            size
        );
    }

    pub fn notify_phys_mmio_ex_map(&self, gpa: GuestAddress, size: u64) {
        debug!("MMIO mapped at {:#x}, {:#x} bytes", gpa.raw_value(), size);
    }

    pub fn notify_phys_mmio_ex_unmap(&self, gpa: GuestAddress, size: u64) {
        debug!("MMIO unmapped at {:#x}, {:#x} bytes", gpa.raw_value(), size);
    }

    /// Maps a contiguous run of pages in one go, e.g. after restoring RAM.
    pub fn map_range(
        &self,
        gpa: GuestAddress,
        prot: NemPageProt,
        states: &mut [NemPageState],
    ) -> Result<()> {
        let mut page = self.lock_global_page()?;
        self.mapper()
            .map_pages(&mut page, gpa.raw_value(), gpa.raw_value(), prot, states)
    }

    pub fn unmap_range(&self, gpa: GuestAddress, states: &mut [NemPageState]) -> Result<()> {
        let mut page = self.lock_global_page()?;
        self.mapper().unmap_pages(&mut page, gpa.raw_value(), states)
    }

    /// Reads the guest TSC and TSC_AUX of a vCPU in a single call.
    pub fn query_cpu_tick(&self, vcpu_id: u32) -> Result<CpuTick> {
        let vcpu = self.vcpu(vcpu_id)?;
        let mut cx = vcpu
            .lock_context()
            .map_err(|e| HypervisorVmError::QueryCpuTick(e.into()))?;
        let names = [HvRegisterName::TSC, HvRegisterName::TSC_AUX];
        let mut values = [HvRegisterValue::default(); 2];
        self.transport()
            .get_vp_registers(&mut cx.page, vcpu_id, &names, &mut values)
            .map_err(|e| HypervisorVmError::QueryCpuTick(e.into()))?;
        Ok(CpuTick {
            tsc: values[0].as_u64(),
            tsc_aux: values[1].as_u32(),
        })
    }

    /// Restarts the guest TSC of every vCPU from `paused_tsc`.
    ///
    /// vCPU 0 gets the paused value; the others get it plus the host TSC
    /// that elapsed since vCPU 0 was written, keeping them in sync.
    pub fn resume_cpu_tick_on_all(&self, paused_tsc: u64) -> Result<()> {
        let mut page = self
            .global_page
            .lock()
            .map_err(|_| HypervisorVmError::ResumeCpuTick(anyhow!("global scratch page lock poisoned")))?;
        let transport = self.transport();
        let mut first_host_tsc = None;
        for vcpu in self.vcpus.iter().filter_map(OnceLock::get) {
            let host_tsc = self.platform.read_host_tsc();
            let first = *first_host_tsc.get_or_insert(host_tsc);
            let tsc = paused_tsc.wrapping_add(host_tsc.wrapping_sub(first));
            transport
                .set_vp_registers(&mut page, vcpu.id(), &[(HvRegisterName::TSC, tsc).into()])
                .map_err(|e| HypervisorVmError::ResumeCpuTick(e.into()))?;
        }
        Ok(())
    }
}
