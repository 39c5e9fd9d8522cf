// Copyright © 2020, Microsoft Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

//! In-memory stand-ins for the host platform and the VMM components, used
//! by the unit tests.

use crate::arch::x86::EventKind;
use crate::config::NemConfig;
use crate::cpu::{EmStatus, VcpuForceFlags, VcpuForceFlagsCell};
use crate::hypervisor::{
    self, HypervisorError, HypervisorPlatform, ScratchPage, SlotFlags, SlotMessage, SlotWait,
    StopResult,
};
use crate::ops::{
    Apic, Cpum, CpuidResult, GuestState, Iem, InterruptAck, Iom, MsrOutcome, NemPageProt,
    NemPageState, PageChecker, PageEnumerator, PageInfo, Pdm, Pgm, PortIo, Tm, VmOps,
};
use crate::vm::Partition;
use hvdef::{
    HvInputMapGpaPages, HvInputUnmapGpaPages, HvInputVpRegisters, HvInterceptAccessType,
    HvMessage, HvMessageType, HvRegisterAssoc, HvRegisterName, HvRegisterValue, HvStatus,
    HvX64ExceptionInfo, HvX64ExceptionInterceptMessage, HvX64InterceptMessageHeader,
    HvX64IoPortAccessInfo, HvX64IoPortInterceptMessage, HvX64MemoryInterceptMessage,
    HvX64MsrInterceptMessage, HvX64SegmentRegister, HvX64VpExecutionState, HypercallCode,
    HypercallControl, HypercallOutput, HV_MAP_GPA_HEADER_SIZE, HV_PAGE_SHIFT,
};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use zerocopy::{FromZeros, Immutable, IntoBytes};

pub const PARTITION_ID: u64 = 0x2a;

/// Consecutive empty waits after which a test is considered stuck.
const MAX_IDLE_WAITS: u32 = 4;

/// Platform calls observed by [`MockPlatform`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordedCall {
    Map {
        gpa: u64,
        hpas: Vec<u64>,
        flags: u32,
    },
    Unmap {
        gpa: u64,
        count: u16,
    },
    Uncommit {
        gpa: u64,
        count: u16,
    },
    SetRegisters {
        vp: u32,
        names: Vec<HvRegisterName>,
    },
    GetRegisters {
        vp: u32,
        names: Vec<HvRegisterName>,
    },
    StartVp {
        vp: u32,
    },
    StopVp {
        vp: u32,
    },
    HandleAndGetNext {
        vp: u32,
        flags: SlotFlags,
    },
    Alert {
        vp: u32,
    },
}

#[derive(Default)]
struct VpState {
    registers: HashMap<HvRegisterName, HvRegisterValue>,
    messages: VecDeque<SlotMessage>,
    on_start: VecDeque<HvMessage>,
    alerted: bool,
}

#[derive(Default)]
struct PlatformState {
    vps: Vec<VpState>,
    calls: Vec<RecordedCall>,
    mappings: BTreeMap<u64, (u64, u32)>,
    failing_maps: Option<(HvStatus, usize)>,
    deposited: usize,
    deposit_limit: Option<usize>,
    truncate_next: bool,
    missing_entry_point: Option<&'static str>,
    host_tsc: u64,
    host_tsc_step: u64,
    next_scratch: u64,
    idle_waits: u32,
}

/// Hypervisor and VID driver stand-in with a register file and message
/// slot per VP.
pub struct MockPlatform {
    state: Mutex<PlatformState>,
    wakeup: Condvar,
}

fn output(status: HvStatus, processed: u16) -> HypercallOutput {
    HypercallOutput::new()
        .with_call_status(status.0)
        .with_elements_processed(processed)
}

impl MockPlatform {
    pub fn new(vps: u32) -> Self {
        let state = PlatformState {
            vps: (0..vps).map(|_| VpState::default()).collect(),
            next_scratch: 0x10_0000,
            ..Default::default()
        };
        MockPlatform {
            state: Mutex::new(state),
            wakeup: Condvar::new(),
        }
    }

    pub fn partition_id(&self) -> u64 {
        PARTITION_ID
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Host frame and flags mapped at guest page `gpa`.
    pub fn mapping(&self, gpa: u64) -> Option<(u64, u32)> {
        self.state.lock().unwrap().mappings.get(&gpa).copied()
    }

    /// Fails the next `count` map hypercalls with `status`.
    pub fn fail_next_maps(&self, status: HvStatus, count: usize) {
        self.state.lock().unwrap().failing_maps = Some((status, count));
    }

    pub fn deposited_pages(&self) -> usize {
        self.state.lock().unwrap().deposited
    }

    pub fn set_deposit_limit(&self, pages: usize) {
        self.state.lock().unwrap().deposit_limit = Some(pages);
    }

    /// The next register hypercall completes one rep short.
    pub fn truncate_next_register_call(&self) {
        self.state.lock().unwrap().truncate_next = true;
    }

    pub fn register(&self, vp: u32, name: HvRegisterName) -> HvRegisterValue {
        let state = self.state.lock().unwrap();
        state.vps[vp as usize]
            .registers
            .get(&name)
            .copied()
            .unwrap_or_default()
    }

    pub fn set_register(&self, vp: u32, name: HvRegisterName, value: HvRegisterValue) {
        let mut state = self.state.lock().unwrap();
        state.vps[vp as usize].registers.insert(name, value);
    }

    pub fn remove_entry_point(&self, name: &'static str) {
        self.state.lock().unwrap().missing_entry_point = Some(name);
    }

    /// Every host TSC read advances the counter by `step`.
    pub fn set_host_tsc_step(&self, step: u64) {
        self.state.lock().unwrap().host_tsc_step = step;
    }

    /// Queues an intercept message in the slot of `vp`.
    pub fn push_message(&self, vp: u32, msg: HvMessage) {
        let mut state = self.state.lock().unwrap();
        state.vps[vp as usize]
            .messages
            .push_back(SlotMessage::Hypervisor(msg));
        self.wakeup.notify_all();
    }

    /// Queues a message that only shows up once `vp` is started.
    pub fn push_message_on_start(&self, vp: u32, msg: HvMessage) {
        let mut state = self.state.lock().unwrap();
        state.vps[vp as usize].on_start.push_back(msg);
    }

    fn map(state: &mut PlatformState, page: &ScratchPage, reps: u16) -> HypercallOutput {
        let input: HvInputMapGpaPages = page.read(0);
        let gpa = input.target_gpa_base << HV_PAGE_SHIFT;
        let hpas: Vec<u64> = (0..reps as usize)
            .map(|i| page.read::<u64>(HV_MAP_GPA_HEADER_SIZE + i * 8) << HV_PAGE_SHIFT)
            .collect();
        state.calls.push(RecordedCall::Map {
            gpa,
            hpas: hpas.clone(),
            flags: input.map_flags,
        });

        if let Some((status, count)) = state.failing_maps {
            state.failing_maps = (count > 1).then(|| (status, count - 1));
            return output(status, 0);
        }
        for (i, hpa) in hpas.into_iter().enumerate() {
            state
                .mappings
                .insert(gpa + ((i as u64) << HV_PAGE_SHIFT), (hpa, input.map_flags));
        }
        output(HvStatus::SUCCESS, reps)
    }

    fn unmap(
        state: &mut PlatformState,
        page: &ScratchPage,
        reps: u16,
        code: HypercallCode,
    ) -> HypercallOutput {
        let input: HvInputUnmapGpaPages = page.read(0);
        let gpa = input.target_gpa_base << HV_PAGE_SHIFT;
        if code == HypercallCode::UNMAP_GPA_PAGES {
            for i in 0..reps as u64 {
                state.mappings.remove(&(gpa + (i << HV_PAGE_SHIFT)));
            }
            state.calls.push(RecordedCall::Unmap { gpa, count: reps });
        } else {
            state.calls.push(RecordedCall::Uncommit { gpa, count: reps });
        }
        output(HvStatus::SUCCESS, reps)
    }

    fn registers(
        state: &mut PlatformState,
        page: &mut ScratchPage,
        reps: u16,
        code: HypercallCode,
        output_offset: Option<usize>,
    ) -> HypercallOutput {
        let input: HvInputVpRegisters = page.read(0);
        let vp = input.vp_index;
        if vp as usize >= state.vps.len() {
            return output(HvStatus::INVALID_VP_INDEX, 0);
        }
        let processed = if std::mem::take(&mut state.truncate_next) {
            reps - 1
        } else {
            reps
        };
        let base = size_of::<HvInputVpRegisters>();

        if code == HypercallCode::SET_VP_REGISTERS {
            let assocs: Vec<HvRegisterAssoc> = (0..reps as usize)
                .map(|i| page.read(base + i * size_of::<HvRegisterAssoc>()))
                .collect();
            for assoc in &assocs[..processed as usize] {
                state.vps[vp as usize]
                    .registers
                    .insert(assoc.name, assoc.value);
            }
            state.calls.push(RecordedCall::SetRegisters {
                vp,
                names: assocs.iter().map(|a| a.name).collect(),
            });
        } else {
            let Some(offset) = output_offset else {
                return output(HvStatus::INVALID_HYPERCALL_INPUT, 0);
            };
            let names: Vec<HvRegisterName> = (0..reps as usize)
                .map(|i| page.read(base + i * size_of::<HvRegisterName>()))
                .collect();
            for (i, name) in names[..processed as usize].iter().enumerate() {
                let value = state.vps[vp as usize]
                    .registers
                    .get(name)
                    .copied()
                    .unwrap_or_default();
                page.write(offset + i * size_of::<HvRegisterValue>(), &value);
            }
            state.calls.push(RecordedCall::GetRegisters { vp, names });
        }
        output(HvStatus::SUCCESS, processed)
    }
}

impl HypervisorPlatform for MockPlatform {
    fn check_entry_points(&self) -> hypervisor::Result<()> {
        match self.state.lock().unwrap().missing_entry_point {
            Some(name) => Err(HypervisorError::MissingPlatformApi(name)),
            None => Ok(()),
        }
    }

    fn create_partition(&self, _cpu_count: u32) -> hypervisor::Result<u64> {
        Ok(PARTITION_ID)
    }

    fn allocate_scratch_page(&self) -> hypervisor::Result<ScratchPage> {
        let mut state = self.state.lock().unwrap();
        let phys = state.next_scratch;
        state.next_scratch += 0x1000;
        Ok(ScratchPage::new(phys))
    }

    fn invoke_hypercall(
        &self,
        control: HypercallControl,
        page: &mut ScratchPage,
        output_offset: Option<usize>,
    ) -> HypercallOutput {
        let mut state = self.state.lock().unwrap();
        let code = HypercallCode(control.code());
        let reps = control.rep_count();
        match code {
            HypercallCode::MAP_GPA_PAGES => Self::map(&mut state, page, reps),
            HypercallCode::UNMAP_GPA_PAGES | HypercallCode::UNCOMMIT_GPA_PAGES => {
                Self::unmap(&mut state, page, reps, code)
            }
            HypercallCode::SET_VP_REGISTERS | HypercallCode::GET_VP_REGISTERS => {
                Self::registers(&mut state, page, reps, code, output_offset)
            }
            _ => output(HvStatus::INVALID_HYPERCALL_CODE, 0),
        }
    }

    fn deposit_memory(&self, partition_id: u64, pages: usize) -> hypervisor::Result<usize> {
        assert_eq!(partition_id, PARTITION_ID);
        let mut state = self.state.lock().unwrap();
        let pages = state.deposit_limit.map_or(pages, |limit| pages.min(limit));
        state.deposited += pages;
        Ok(pages)
    }

    fn start_vp(&self, vp_index: u32) -> hypervisor::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(RecordedCall::StartVp { vp: vp_index });
        let vp = &mut state.vps[vp_index as usize];
        while let Some(msg) = vp.on_start.pop_front() {
            vp.messages.push_back(SlotMessage::Hypervisor(msg));
        }
        Ok(())
    }

    fn stop_vp(&self, vp_index: u32) -> hypervisor::Result<StopResult> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(RecordedCall::StopVp { vp: vp_index });
        let vp = &mut state.vps[vp_index as usize];
        if vp.messages.is_empty() {
            return Ok(StopResult::Stopped);
        }
        vp.messages.push_back(SlotMessage::StopRequestComplete);
        Ok(StopResult::Pending)
    }

    fn handle_and_get_next(
        &self,
        vp_index: u32,
        flags: SlotFlags,
        timeout_ms: u32,
    ) -> hypervisor::Result<SlotWait> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(RecordedCall::HandleAndGetNext {
            vp: vp_index,
            flags,
        });
        if !flags.contains(SlotFlags::GET_NEXT_MESSAGE) {
            return Ok(SlotWait::Timeout);
        }

        let deadline = Instant::now() + Duration::from_millis(timeout_ms.into());
        loop {
            let vp = &mut state.vps[vp_index as usize];
            if let Some(msg) = vp.messages.pop_front() {
                state.idle_waits = 0;
                return Ok(SlotWait::Message(msg));
            }
            if std::mem::take(&mut vp.alerted) {
                state.idle_waits = 0;
                return Ok(SlotWait::Alerted);
            }
            let now = Instant::now();
            if now >= deadline {
                state.idle_waits += 1;
                assert!(
                    state.idle_waits <= MAX_IDLE_WAITS,
                    "vp {} keeps waiting on an empty slot",
                    vp_index
                );
                return Ok(SlotWait::Timeout);
            }
            state = self.wakeup.wait_timeout(state, deadline - now).unwrap().0;
        }
    }

    fn alert_vp_thread(&self, vp_index: u32) -> hypervisor::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(RecordedCall::Alert { vp: vp_index });
        state.vps[vp_index as usize].alerted = true;
        self.wakeup.notify_all();
        Ok(())
    }

    fn read_host_tsc(&self) -> u64 {
        let mut state = self.state.lock().unwrap();
        let tsc = state.host_tsc;
        state.host_tsc += state.host_tsc_step;
        tsc
    }
}

#[derive(Clone, Copy)]
struct RamPage {
    hpa: u64,
    prot: NemPageProt,
    state: NemPageState,
}

#[derive(Default)]
struct PgmState {
    pages: BTreeMap<u64, RamPage>,
    mode_changes: Vec<(u64, u64, u64)>,
    nxe_changes: Vec<bool>,
    cr3_updates: Vec<u64>,
}

/// Guest RAM table keyed by page address.
#[derive(Default)]
pub struct MockPgm {
    state: Mutex<PgmState>,
}

fn page_of(gpa: u64) -> u64 {
    gpa & !0xfff
}

impl MockPgm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backs `gpa` with `hpa`, keeping the mapping state of a known page.
    pub fn add_ram(&self, gpa: u64, hpa: u64, prot: NemPageProt) {
        let mut state = self.state.lock().unwrap();
        let page = state.pages.entry(page_of(gpa)).or_insert(RamPage {
            hpa,
            prot,
            state: NemPageState::NotSet,
        });
        page.hpa = hpa;
        page.prot = prot;
    }

    pub fn set_state(&self, gpa: u64, nem_state: NemPageState) {
        let mut state = self.state.lock().unwrap();
        if let Some(page) = state.pages.get_mut(&page_of(gpa)) {
            page.state = nem_state;
        }
    }

    pub fn state(&self, gpa: u64) -> NemPageState {
        let state = self.state.lock().unwrap();
        state
            .pages
            .get(&page_of(gpa))
            .map_or(NemPageState::NotSet, |page| page.state)
    }

    pub fn mode_changes(&self) -> Vec<(u64, u64, u64)> {
        self.state.lock().unwrap().mode_changes.clone()
    }

    pub fn nxe_changes(&self) -> Vec<bool> {
        self.state.lock().unwrap().nxe_changes.clone()
    }

    pub fn cr3_updates(&self) -> Vec<u64> {
        self.state.lock().unwrap().cr3_updates.clone()
    }
}

impl Pgm for MockPgm {
    fn gpa_to_hpa(&self, gpa: u64) -> anyhow::Result<u64> {
        let state = self.state.lock().unwrap();
        state
            .pages
            .get(&page_of(gpa))
            .map(|page| page.hpa)
            .ok_or_else(|| anyhow!("no RAM at {:#x}", gpa))
    }

    fn page_info_checker(
        &self,
        _vcpu_id: u32,
        gpa: u64,
        _make_writable: bool,
        checker: Option<&mut PageChecker<'_>>,
    ) -> anyhow::Result<PageInfo> {
        let known = self.state.lock().unwrap().pages.get(&page_of(gpa)).copied();
        let mut info = known.map_or_else(PageInfo::default, |page| PageInfo {
            hc_phys: page.hpa,
            prot: page.prot,
            nem_state: page.state,
            old_nem_state: page.state,
            has_handlers: false,
        });
        if let Some(checker) = checker {
            checker(gpa, &mut info)?;
        }
        if known.is_some() {
            self.set_state(gpa, info.nem_state);
        }
        Ok(info)
    }

    fn enum_pages_by_state(
        &self,
        _vcpu_id: u32,
        nem_state: NemPageState,
        callback: &mut PageEnumerator<'_>,
    ) -> anyhow::Result<()> {
        let gpas: Vec<u64> = {
            let state = self.state.lock().unwrap();
            state
                .pages
                .iter()
                .filter(|(_, page)| page.state == nem_state)
                .map(|(gpa, _)| *gpa)
                .collect()
        };
        for gpa in gpas {
            let mut page_state = nem_state;
            callback(gpa, &mut page_state)?;
            self.set_state(gpa, page_state);
        }
        Ok(())
    }

    fn change_mode(&self, _vcpu_id: u32, cr0: u64, cr4: u64, efer: u64) -> anyhow::Result<()> {
        self.state.lock().unwrap().mode_changes.push((cr0, cr4, efer));
        Ok(())
    }

    fn update_cr3(&self, _vcpu_id: u32, cr3: u64) -> anyhow::Result<()> {
        self.state.lock().unwrap().cr3_updates.push(cr3);
        Ok(())
    }

    fn notify_nxe_changed(&self, _vcpu_id: u32, enabled: bool) {
        self.state.lock().unwrap().nxe_changes.push(enabled);
    }
}

/// CPUID table and MSR file; unknown MSRs raise #GP.
#[derive(Default)]
pub struct MockCpum {
    cpuid: Mutex<HashMap<(u32, u32), CpuidResult>>,
    msrs: Mutex<HashMap<u32, u64>>,
}

impl MockCpum {
    pub fn set_cpuid(&self, leaf: u32, subleaf: u32, result: CpuidResult) {
        self.cpuid.lock().unwrap().insert((leaf, subleaf), result);
    }

    pub fn set_msr(&self, msr: u32, value: u64) {
        self.msrs.lock().unwrap().insert(msr, value);
    }

    pub fn msr(&self, msr: u32) -> Option<u64> {
        self.msrs.lock().unwrap().get(&msr).copied()
    }
}

impl Cpum for MockCpum {
    fn cpuid(&self, _vcpu_id: u32, leaf: u32, subleaf: u32) -> CpuidResult {
        self.cpuid
            .lock()
            .unwrap()
            .get(&(leaf, subleaf))
            .copied()
            .unwrap_or_default()
    }

    fn read_msr(&self, _guest: &mut dyn GuestState, msr: u32) -> MsrOutcome<u64> {
        self.msr(msr).map_or(MsrOutcome::RaiseGp, MsrOutcome::Done)
    }

    fn write_msr(&self, _guest: &mut dyn GuestState, msr: u32, value: u64) -> MsrOutcome<()> {
        match self.msrs.lock().unwrap().get_mut(&msr) {
            Some(slot) => {
                *slot = value;
                MsrOutcome::Done(())
            }
            None => MsrOutcome::RaiseGp,
        }
    }
}

#[derive(Default)]
pub struct MockApic {
    tpr: Mutex<HashMap<u32, u8>>,
    base: Mutex<HashMap<u32, u64>>,
    updates: Mutex<u32>,
}

impl MockApic {
    pub fn tpr(&self, vcpu_id: u32) -> u8 {
        self.tpr.lock().unwrap().get(&vcpu_id).copied().unwrap_or(0)
    }

    pub fn base_msr(&self, vcpu_id: u32) -> u64 {
        self.base.lock().unwrap().get(&vcpu_id).copied().unwrap_or(0)
    }

    pub fn updates(&self) -> u32 {
        *self.updates.lock().unwrap()
    }
}

impl Apic for MockApic {
    fn base_msr(&self, vcpu_id: u32) -> u64 {
        MockApic::base_msr(self, vcpu_id)
    }

    fn set_base_msr(&self, vcpu_id: u32, value: u64) -> anyhow::Result<()> {
        self.base.lock().unwrap().insert(vcpu_id, value);
        Ok(())
    }

    fn tpr(&self, vcpu_id: u32) -> u8 {
        MockApic::tpr(self, vcpu_id)
    }

    fn set_tpr(&self, vcpu_id: u32, tpr: u8) -> anyhow::Result<()> {
        self.tpr.lock().unwrap().insert(vcpu_id, tpr);
        Ok(())
    }

    fn update_pending_interrupts(&self, _vcpu_id: u32, _force_flags: &VcpuForceFlagsCell) {
        *self.updates.lock().unwrap() += 1;
    }
}

/// Port space; unknown ports float high, ring-3 ports defer.
#[derive(Default)]
pub struct MockIom {
    ports: Mutex<HashMap<u16, u32>>,
    ring3: Mutex<HashSet<u16>>,
    writes: Mutex<Vec<(u16, u8, u32)>>,
    breakpoints: Mutex<bool>,
}

impl MockIom {
    pub fn set_port(&self, port: u16, value: u32) {
        self.ports.lock().unwrap().insert(port, value);
    }

    pub fn set_ring3_port(&self, port: u16) {
        self.ring3.lock().unwrap().insert(port);
    }

    pub fn set_breakpoints_armed(&self, armed: bool) {
        *self.breakpoints.lock().unwrap() = armed;
    }

    pub fn writes(&self) -> Vec<(u16, u8, u32)> {
        self.writes.lock().unwrap().clone()
    }

    fn in_ring3(&self, port: u16) -> bool {
        self.ring3.lock().unwrap().contains(&port)
    }
}

impl Iom for MockIom {
    fn port_read(&self, _vcpu_id: u32, port: u16, _size: u8) -> anyhow::Result<PortIo<u32>> {
        if self.in_ring3(port) {
            return Ok(PortIo::Ring3);
        }
        let value = self.ports.lock().unwrap().get(&port).copied();
        Ok(PortIo::Done(value.unwrap_or(0xffff_ffff)))
    }

    fn port_write(
        &self,
        _vcpu_id: u32,
        port: u16,
        size: u8,
        value: u32,
    ) -> anyhow::Result<PortIo<()>> {
        if self.in_ring3(port) {
            return Ok(PortIo::Ring3);
        }
        self.writes.lock().unwrap().push((port, size, value));
        Ok(PortIo::Done(()))
    }

    fn io_breakpoints_armed(&self, _vcpu_id: u32) -> bool {
        *self.breakpoints.lock().unwrap()
    }
}

/// Emulator requests observed by [`MockIem`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IemCall {
    InjectTrap {
        vector: u8,
        kind: EventKind,
        error_code: Option<u32>,
        cr2: u64,
        instruction_len: u8,
    },
    ExecuteOne,
    Prefetched {
        pc: u64,
        bytes: Vec<u8>,
    },
}

type ExecuteHook =
    Arc<dyn Fn(&mut dyn GuestState, Option<&[u8]>) -> anyhow::Result<EmStatus> + Send + Sync>;

#[derive(Default)]
pub struct MockIem {
    calls: Mutex<Vec<IemCall>>,
    hook: Mutex<Option<ExecuteHook>>,
}

impl MockIem {
    /// Runs `hook` for every emulated instruction instead of doing nothing.
    pub fn on_execute<F>(&self, hook: F)
    where
        F: Fn(&mut dyn GuestState, Option<&[u8]>) -> anyhow::Result<EmStatus>
            + Send
            + Sync
            + 'static,
    {
        *self.hook.lock().unwrap() = Some(Arc::new(hook));
    }

    pub fn calls(&self) -> Vec<IemCall> {
        self.calls.lock().unwrap().clone()
    }

    fn execute(
        &self,
        call: IemCall,
        guest: &mut dyn GuestState,
        bytes: Option<&[u8]>,
    ) -> anyhow::Result<EmStatus> {
        self.calls.lock().unwrap().push(call);
        let hook = self.hook.lock().unwrap().clone();
        match hook {
            Some(hook) => hook(guest, bytes),
            None => Ok(EmStatus::Continue),
        }
    }
}

impl Iem for MockIem {
    fn inject_trap(
        &self,
        _guest: &mut dyn GuestState,
        vector: u8,
        kind: EventKind,
        error_code: Option<u32>,
        cr2: u64,
        instruction_len: u8,
    ) -> anyhow::Result<EmStatus> {
        self.calls.lock().unwrap().push(IemCall::InjectTrap {
            vector,
            kind,
            error_code,
            cr2,
            instruction_len,
        });
        Ok(EmStatus::Continue)
    }

    fn execute_one(&self, guest: &mut dyn GuestState) -> anyhow::Result<EmStatus> {
        self.execute(IemCall::ExecuteOne, guest, None)
    }

    fn execute_one_with_prefetched(
        &self,
        guest: &mut dyn GuestState,
        pc: u64,
        bytes: &[u8],
    ) -> anyhow::Result<EmStatus> {
        let call = IemCall::Prefetched {
            pc,
            bytes: bytes.to_vec(),
        };
        self.execute(call, guest, Some(bytes))
    }
}

pub struct MockTm {
    deadline: Mutex<Duration>,
}

impl Default for MockTm {
    fn default() -> Self {
        MockTm {
            deadline: Mutex::new(Duration::from_secs(10)),
        }
    }
}

impl MockTm {
    pub fn set_deadline(&self, deadline: Duration) {
        *self.deadline.lock().unwrap() = deadline;
    }
}

impl Tm for MockTm {
    fn poll_next_deadline(&self, _vcpu_id: u32) -> Duration {
        *self.deadline.lock().unwrap()
    }
}

/// Interrupt controller handing out queued acknowledge results.
#[derive(Default)]
pub struct MockPdm {
    pending: Mutex<VecDeque<InterruptAck>>,
}

impl MockPdm {
    pub fn push(&self, ack: InterruptAck) {
        self.pending.lock().unwrap().push_back(ack);
    }
}

impl Pdm for MockPdm {
    fn get_interrupt(&self, _vcpu_id: u32, force_flags: &VcpuForceFlagsCell) -> InterruptAck {
        let mut pending = self.pending.lock().unwrap();
        let ack = pending.pop_front().unwrap_or(InterruptAck::None);
        let drained = pending.is_empty() && !matches!(ack, InterruptAck::MaskedByTpr(_));
        if drained {
            force_flags.clear(VcpuForceFlags::INTERRUPT_APIC | VcpuForceFlags::INTERRUPT_PIC);
        }
        ack
    }
}

/// Mock collaborators, kept typed so tests can steer them.
pub struct MockOps {
    pub pgm: Arc<MockPgm>,
    pub cpum: Arc<MockCpum>,
    pub apic: Arc<MockApic>,
    pub iom: Arc<MockIom>,
    pub iem: Arc<MockIem>,
    pub tm: Arc<MockTm>,
    pub pdm: Arc<MockPdm>,
}

impl MockOps {
    pub fn new() -> Self {
        MockOps {
            pgm: Arc::new(MockPgm::new()),
            cpum: Arc::default(),
            apic: Arc::default(),
            iom: Arc::default(),
            iem: Arc::default(),
            tm: Arc::default(),
            pdm: Arc::default(),
        }
    }

    pub fn vm_ops(&self) -> VmOps {
        VmOps {
            pgm: self.pgm.clone(),
            cpum: self.cpum.clone(),
            apic: self.apic.clone(),
            iom: self.iom.clone(),
            iem: self.iem.clone(),
            tm: self.tm.clone(),
            pdm: self.pdm.clone(),
        }
    }
}

/// Partition over the mocks with every vCPU initialized.
pub struct TestVm {
    pub platform: Arc<MockPlatform>,
    pub mocks: MockOps,
    pub partition: Arc<Partition>,
}

impl TestVm {
    pub fn new(cpus: u32) -> Self {
        Self::with_config(cpus, NemConfig::default())
    }

    pub fn with_config(cpus: u32, config: NemConfig) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let platform = Arc::new(MockPlatform::new(cpus));
        let mocks = MockOps::new();
        let partition = Partition::new(platform.clone(), mocks.vm_ops(), config, cpus).unwrap();
        for id in 0..cpus {
            partition.init_vcpu(id).unwrap();
        }
        TestVm {
            platform,
            mocks,
            partition: Arc::new(partition),
        }
    }
}

pub trait HeaderExt {
    fn with_instruction_len(self, len: u8) -> Self;
    fn with_access(self, access: HvInterceptAccessType) -> Self;
}

impl HeaderExt for HvX64InterceptMessageHeader {
    fn with_instruction_len(mut self, len: u8) -> Self {
        self.instruction_length_and_cr8 = (self.instruction_length_and_cr8 & 0xf0) | (len & 0xf);
        self
    }

    fn with_access(mut self, access: HvInterceptAccessType) -> Self {
        self.intercept_access_type = access;
        self
    }
}

/// Flat 16-bit code segment at `rip`.
pub fn intercept_header(vp: u32, rip: u64, cs_selector: u16) -> HvX64InterceptMessageHeader {
    HvX64InterceptMessageHeader {
        vp_index: vp,
        instruction_length_and_cr8: 0,
        intercept_access_type: HvInterceptAccessType::READ,
        execution_state: HvX64VpExecutionState::new(),
        cs_segment: HvX64SegmentRegister {
            base: 0,
            limit: 0xffff,
            selector: cs_selector,
            attributes: 0x9b,
        },
        rip,
        rflags: 0x2,
    }
}

pub fn message<T: IntoBytes + Immutable>(typ: HvMessageType, value: &T) -> HvMessage {
    HvMessage::new(typ, 0, value.as_bytes())
}

fn instruction_bytes(bytes: &[u8]) -> ([u8; 16], u8) {
    let mut buf = [0; 16];
    let len = bytes.len().min(buf.len());
    buf[..len].copy_from_slice(&bytes[..len]);
    (buf, len as u8)
}

pub fn memory_message(
    header: HvX64InterceptMessageHeader,
    gpa: u64,
    is_write: bool,
    bytes: &[u8],
) -> HvMessage {
    let access = if is_write {
        HvInterceptAccessType::WRITE
    } else {
        HvInterceptAccessType::READ
    };
    let (instruction_bytes, instruction_byte_count) = instruction_bytes(bytes);
    let msg = HvX64MemoryInterceptMessage {
        header: header.with_access(access),
        guest_physical_address: gpa,
        instruction_byte_count,
        instruction_bytes,
        ..HvX64MemoryInterceptMessage::new_zeroed()
    };
    message(HvMessageType::GPA_INTERCEPT, &msg)
}

pub fn io_message_raw(
    header: HvX64InterceptMessageHeader,
    port: u16,
    size: u8,
    is_write: bool,
    rax: u64,
) -> HvX64IoPortInterceptMessage {
    let header = if is_write {
        header.with_access(HvInterceptAccessType::WRITE)
    } else {
        header
    };
    HvX64IoPortInterceptMessage {
        header,
        port_number: port,
        access_info: HvX64IoPortAccessInfo::new().with_access_size(size),
        rax,
        ..HvX64IoPortInterceptMessage::new_zeroed()
    }
}

pub fn io_message(
    header: HvX64InterceptMessageHeader,
    port: u16,
    size: u8,
    is_write: bool,
    rax: u64,
) -> HvMessage {
    message(
        HvMessageType::X64_IO_PORT_INTERCEPT,
        &io_message_raw(header, port, size, is_write, rax),
    )
}

pub fn msr_message(header: HvX64InterceptMessageHeader, msr: u32, rax: u64, rdx: u64) -> HvMessage {
    message(
        HvMessageType::X64_MSR_INTERCEPT,
        &HvX64MsrInterceptMessage {
            header,
            msr_number: msr,
            reserved: 0,
            rdx,
            rax,
        },
    )
}

pub fn exception_message_raw(
    header: HvX64InterceptMessageHeader,
    vector: u16,
    error_code: Option<u32>,
    bytes: &[u8],
) -> HvX64ExceptionInterceptMessage {
    let (instruction_bytes, instruction_byte_count) = instruction_bytes(bytes);
    HvX64ExceptionInterceptMessage {
        header,
        vector,
        exception_info: HvX64ExceptionInfo::new().with_error_code_valid(error_code.is_some()),
        instruction_byte_count,
        error_code: error_code.unwrap_or(0),
        instruction_bytes,
        ..HvX64ExceptionInterceptMessage::new_zeroed()
    }
}

pub fn exception_message(
    header: HvX64InterceptMessageHeader,
    vector: u16,
    error_code: Option<u32>,
    bytes: &[u8],
) -> HvMessage {
    message(
        HvMessageType::X64_EXCEPTION_INTERCEPT,
        &exception_message_raw(header, vector, error_code, bytes),
    )
}

