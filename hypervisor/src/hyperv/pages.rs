// Copyright © 2020, Microsoft Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

//! Second level page mapping.
//!
//! Keeps the hypervisor's GPA to HPA tables in line with the protection
//! PGM tracks for each guest page. The per page state lives in PGM and is
//! only changed through the callbacks PGM runs under its lock.

use super::history::{inc, PageStats};
use super::hypercall::Transport;
use crate::hypervisor::ScratchPage;
use crate::ops::{NemPageProt, NemPageState, PageInfo, Pgm};
use crate::vm::HypervisorVmError;
use hvdef::{
    HV_MAP_GPA_KERNEL_EXECUTABLE, HV_MAP_GPA_MAX_PAGES, HV_MAP_GPA_PERMISSIONS_ALL,
    HV_MAP_GPA_READABLE, HV_MAP_GPA_USER_EXECUTABLE, HV_PAGE_SIZE,
};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

pub const A20_BIT: u64 = 1 << 20;
pub const A20_WINDOW: u64 = 0x1_0000;

pub const MAP_READ_EXECUTE: u32 =
    HV_MAP_GPA_READABLE | HV_MAP_GPA_KERNEL_EXECUTABLE | HV_MAP_GPA_USER_EXECUTABLE;

/// Pages in the 64 KiB above 1 MiB wrap to low memory while A20 is off.
pub fn is_subject_to_a20(gpa: u64) -> bool {
    gpa.wrapping_sub(A20_BIT) < A20_WINDOW
}

/// Pages whose mapping depends on the A20 gate.
pub fn is_a20_relevant(gpa: u64) -> bool {
    is_subject_to_a20(gpa) || gpa < A20_WINDOW
}

pub fn page_align(gpa: u64) -> u64 {
    gpa & !(HV_PAGE_SIZE as u64 - 1)
}

/// Map flags and resulting page state for a PGM protection.
pub fn map_flags_for(prot: NemPageProt) -> Option<(u32, NemPageState)> {
    if prot.contains(NemPageProt::WRITE) {
        Some((HV_MAP_GPA_PERMISSIONS_ALL, NemPageState::Writable))
    } else if prot.intersects(NemPageProt::READ | NemPageProt::EXECUTE) {
        Some((MAP_READ_EXECUTE, NemPageState::Readable))
    } else {
        None
    }
}

/// Result of the memory intercept checker.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AccessCheck {
    /// The mapping was fixed up and the instruction can simply be restarted.
    pub can_resume: bool,
    pub did_something: bool,
}

/// Page mapping operations of one partition.
pub struct PageMapper<'a> {
    pub transport: Transport<'a>,
    pub pgm: &'a dyn Pgm,
    pub mapped_pages: &'a AtomicU32,
    pub unmap_all_requested: &'a AtomicBool,
    pub stats: &'a PageStats,
}

impl PageMapper<'_> {
    fn inc_mapped(&self) -> u32 {
        self.mapped_pages.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn dec_mapped(&self) -> u32 {
        match self
            .mapped_pages
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(old) => old - 1,
            Err(_) => 0,
        }
    }

    /// Maps guest page `src` at `dst` with `flags`.
    pub fn map_page(
        &self,
        page: &mut ScratchPage,
        src: u64,
        dst: u64,
        flags: u32,
    ) -> Result<(), HypervisorVmError> {
        let hpa = self
            .pgm
            .gpa_to_hpa(page_align(src))
            .map_err(HypervisorVmError::MapGpa)?;
        self.transport
            .map_gpa_pages(page, page_align(dst), &[hpa], flags)
            .map_err(|e| {
                inc(&self.stats.map_page_failed);
                HypervisorVmError::MapGpa(e.into())
            })?;
        inc(&self.stats.map_page);
        Ok(())
    }

    pub fn unmap_page(&self, page: &mut ScratchPage, gpa: u64) -> Result<(), HypervisorVmError> {
        self.transport
            .unmap_gpa_pages(page, page_align(gpa), 1)
            .map_err(|e| {
                inc(&self.stats.unmap_page_failed);
                HypervisorVmError::UnmapGpa(e.into())
            })?;
        inc(&self.stats.unmap_page);
        Ok(())
    }

    /// Maps a run of pages in one call, updating each page's state.
    pub fn map_pages(
        &self,
        page: &mut ScratchPage,
        src: u64,
        dst: u64,
        prot: NemPageProt,
        states: &mut [NemPageState],
    ) -> Result<(), HypervisorVmError> {
        let Some((flags, target)) = map_flags_for(prot) else {
            return self.unmap_pages(page, dst, states);
        };

        for (chunk_index, chunk) in states.chunks_mut(HV_MAP_GPA_MAX_PAGES).enumerate() {
            let offset = (chunk_index * HV_MAP_GPA_MAX_PAGES * HV_PAGE_SIZE) as u64;
            let mut hpas = Vec::with_capacity(chunk.len());
            for i in 0..chunk.len() {
                let gpa = page_align(src) + offset + (i * HV_PAGE_SIZE) as u64;
                hpas.push(self.pgm.gpa_to_hpa(gpa).map_err(HypervisorVmError::MapGpa)?);
            }
            self.transport
                .map_gpa_pages(page, page_align(dst) + offset, &hpas, flags)
                .map_err(|e| {
                    inc(&self.stats.map_page_failed);
                    HypervisorVmError::MapGpa(e.into())
                })?;
            for state in chunk.iter_mut() {
                if *state <= NemPageState::Unmapped {
                    self.inc_mapped();
                }
                *state = target;
                inc(&self.stats.map_page);
            }
        }
        Ok(())
    }

    /// Unmaps a run of pages, moving mapped ones to `Unmapped`.
    pub fn unmap_pages(
        &self,
        page: &mut ScratchPage,
        gpa: u64,
        states: &mut [NemPageState],
    ) -> Result<(), HypervisorVmError> {
        for (chunk_index, chunk) in states.chunks_mut(HV_MAP_GPA_MAX_PAGES).enumerate() {
            let offset = (chunk_index * HV_MAP_GPA_MAX_PAGES * HV_PAGE_SIZE) as u64;
            self.transport
                .unmap_gpa_pages(page, page_align(gpa) + offset, chunk.len() as u16)
                .map_err(|e| {
                    inc(&self.stats.unmap_page_failed);
                    HypervisorVmError::UnmapGpa(e.into())
                })?;
            for state in chunk.iter_mut() {
                if *state > NemPageState::Unmapped {
                    self.dec_mapped();
                }
                *state = NemPageState::Unmapped;
                inc(&self.stats.unmap_page);
            }
        }
        Ok(())
    }

    /// Brings one page to the mapping `prot` asks for.
    ///
    /// No hypercall is made when the page already is in the target state
    /// and its backing did not change.
    pub fn set_phys_page(
        &self,
        page: &mut ScratchPage,
        src: u64,
        dst: u64,
        prot: NemPageProt,
        state: &mut NemPageState,
        backing_changed: bool,
    ) -> Result<(), HypervisorVmError> {
        let old = *state;
        let Some((flags, target)) = map_flags_for(prot) else {
            if old > NemPageState::Unmapped {
                self.unmap_page(page, dst)?;
                *state = NemPageState::Unmapped;
                let mapped = self.dec_mapped();
                debug!("Unmapped {:#x} ({} mapped)", dst, mapped);
            }
            return Ok(());
        };

        if old == target && !backing_changed {
            return Ok(());
        }

        self.map_page(page, src, dst, flags)?;
        *state = target;
        if old <= NemPageState::Unmapped {
            let mapped = self.inc_mapped();
            debug!(
                "Mapped {:#x} -> {:#x} {} ({} mapped)",
                src,
                dst,
                target.name(),
                mapped
            );
        }
        Ok(())
    }

    /// Unmaps every readable page, letting the guest fault them back in.
    pub fn unmap_all_readable(
        &self,
        page: &mut ScratchPage,
        vcpu_id: u32,
    ) -> Result<u32, HypervisorVmError> {
        let mut unmapped = 0;
        self.pgm
            .enum_pages_by_state(vcpu_id, NemPageState::Readable, &mut |gpa, state| {
                match self.unmap_page(page, gpa) {
                    Ok(()) => {
                        *state = NemPageState::Unmapped;
                        unmapped += 1;
                    }
                    Err(e) => {
                        warn!("Failed to unmap {:#x}: {}", gpa, e);
                        *state = NemPageState::NotSet;
                    }
                }
                self.dec_mapped();
                Ok(())
            })
            .map_err(HypervisorVmError::UnmapGpa)?;

        inc(&self.stats.unmap_all_pages);
        info!(
            "Unmapped {} readable pages, {} still mapped",
            unmapped,
            self.mapped_pages.load(Ordering::Acquire)
        );
        Ok(unmapped)
    }

    /// Drops the mapping of an A20 alias so it gets resynced on access.
    pub fn unmap_for_a20_gate(
        &self,
        page: &mut ScratchPage,
        vcpu_id: u32,
        gpa: u64,
    ) -> Result<(), HypervisorVmError> {
        let mut failure = None;
        self.pgm
            .page_info_checker(
                vcpu_id,
                gpa,
                false,
                Some(&mut |gpa, info: &mut PageInfo| {
                    if info.nem_state > NemPageState::Unmapped {
                        match self.unmap_page(page, gpa) {
                            Ok(()) => {
                                info.nem_state = NemPageState::Unmapped;
                                self.dec_mapped();
                            }
                            Err(e) => failure = Some(e),
                        }
                    }
                    Ok(())
                }),
            )
            .map_err(HypervisorVmError::UnmapGpa)?;
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Applies a PGM protection change, honouring the A20 gate.
    #[allow(clippy::too_many_arguments)]
    pub fn update_page(
        &self,
        page: &mut ScratchPage,
        vcpu_id: u32,
        gpa: u64,
        prot: NemPageProt,
        state: &mut NemPageState,
        backing_changed: bool,
        a20_enabled: bool,
    ) -> Result<(), HypervisorVmError> {
        if a20_enabled || !is_a20_relevant(gpa) {
            return self.set_phys_page(page, gpa, gpa, prot, state, backing_changed);
        }

        self.unmap_for_a20_gate(page, vcpu_id, gpa | A20_BIT)?;
        if !is_subject_to_a20(gpa) {
            self.set_phys_page(page, gpa, gpa, prot, state, backing_changed)?;
        }
        Ok(())
    }

    /// Fixes up the mapping of a page the guest faulted on.
    ///
    /// `src` is the page PGM looked up, `dst` the faulting page; they differ
    /// for A20 aliases.
    pub fn check_memory_access(
        &self,
        page: &mut ScratchPage,
        src: u64,
        dst: u64,
        is_write: bool,
        info: &mut PageInfo,
    ) -> Result<AccessCheck, HypervisorVmError> {
        let mut check = AccessCheck::default();
        match info.nem_state {
            NemPageState::Unmapped | NemPageState::NotSet => {
                if info.prot.is_empty() {
                    return Ok(check);
                }
                if is_write && !info.prot.contains(NemPageProt::WRITE) {
                    return Ok(check);
                }
                let mut state = info.nem_state;
                let result = self.set_phys_page(page, src, dst, info.prot, &mut state, true);
                info.nem_state = state;
                if let Err(e) = result {
                    warn!("Failed to map {:#x} on access: {}", dst, e);
                    self.unmap_all_requested.store(true, Ordering::Release);
                    return Err(e);
                }
                check.did_something = true;
                check.can_resume = true;
                return Ok(check);
            }
            NemPageState::Readable => {
                if !info.prot.contains(NemPageProt::WRITE)
                    && info.prot.intersects(NemPageProt::READ | NemPageProt::EXECUTE)
                {
                    return Ok(check);
                }
                if is_write && info.prot.contains(NemPageProt::WRITE) {
                    match self.map_page(page, src, dst, HV_MAP_GPA_PERMISSIONS_ALL) {
                        Ok(()) => {
                            info.nem_state = NemPageState::Writable;
                            check.did_something = true;
                            check.can_resume = true;
                            return Ok(check);
                        }
                        Err(e) => warn!("Failed to make {:#x} writable: {}", dst, e),
                    }
                }
            }
            NemPageState::Writable => {
                if info.prot.contains(NemPageProt::WRITE) {
                    // Another vCPU may have made it writable already.
                    check.can_resume = info.old_nem_state != NemPageState::Writable;
                    return Ok(check);
                }
            }
        }

        // Drop the mapping and restart the instruction.
        match self.unmap_page(page, dst) {
            Ok(()) => {
                info.nem_state = NemPageState::Unmapped;
                self.dec_mapped();
                check.did_something = true;
                check.can_resume = true;
                Ok(check)
            }
            Err(e) => {
                warn!("Failed to unmap {:#x} on access: {}", dst, e);
                self.unmap_all_requested.store(true, Ordering::Release);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NemConfig;
    use crate::mock::{MockPgm, MockPlatform, RecordedCall};

    struct Fixture {
        platform: MockPlatform,
        pgm: MockPgm,
        config: NemConfig,
        mapped: AtomicU32,
        unmap_all: AtomicBool,
        stats: PageStats,
    }

    impl Fixture {
        fn new() -> Self {
            Fixture {
                platform: MockPlatform::new(1),
                pgm: MockPgm::new(),
                config: NemConfig::default(),
                mapped: AtomicU32::new(0),
                unmap_all: AtomicBool::new(false),
                stats: PageStats::default(),
            }
        }

        fn mapper(&self) -> PageMapper<'_> {
            PageMapper {
                transport: Transport::new(
                    &self.platform,
                    self.platform.partition_id(),
                    &self.config,
                ),
                pgm: &self.pgm,
                mapped_pages: &self.mapped,
                unmap_all_requested: &self.unmap_all,
                stats: &self.stats,
            }
        }

        fn mapped(&self) -> u32 {
            self.mapped.load(Ordering::Acquire)
        }
    }

    #[test]
    fn test_a20_helpers() {
        assert!(is_subject_to_a20(0x10_0000));
        assert!(is_subject_to_a20(0x10_f000));
        assert!(!is_subject_to_a20(0x11_0000));
        assert!(!is_subject_to_a20(0xf_f000));
        assert!(is_a20_relevant(0x0));
        assert!(is_a20_relevant(0xf000));
        assert!(!is_a20_relevant(0x1_0000));
        assert!(is_a20_relevant(0x10_8000));
    }

    #[test]
    fn test_set_phys_page_idempotent() {
        let f = Fixture::new();
        f.pgm.add_ram(0x3000, 0x88_3000, NemPageProt::all());
        let mapper = f.mapper();
        let mut page = ScratchPage::new(0);
        let prot = NemPageProt::READ | NemPageProt::WRITE | NemPageProt::EXECUTE;
        let mut state = NemPageState::Writable;

        mapper
            .set_phys_page(&mut page, 0x3000, 0x3000, prot, &mut state, false)
            .unwrap();
        assert!(f.platform.calls().is_empty());
        assert_eq!(state, NemPageState::Writable);

        mapper
            .set_phys_page(&mut page, 0x3000, 0x3000, prot, &mut state, true)
            .unwrap();
        assert_eq!(f.platform.calls().len(), 1);
        // Already mapped: the counter only tracks unmapped -> mapped.
        assert_eq!(f.mapped(), 0);
    }

    #[test]
    fn test_set_phys_page_transitions() {
        let f = Fixture::new();
        f.pgm.add_ram(0x4000, 0x99_4000, NemPageProt::READ | NemPageProt::EXECUTE);
        let mapper = f.mapper();
        let mut page = ScratchPage::new(0);
        let mut state = NemPageState::NotSet;

        mapper
            .set_phys_page(
                &mut page,
                0x4000,
                0x4000,
                NemPageProt::READ | NemPageProt::EXECUTE,
                &mut state,
                false,
            )
            .unwrap();
        assert_eq!(state, NemPageState::Readable);
        assert_eq!(f.mapped(), 1);
        assert_eq!(f.platform.mapping(0x4000), Some((0x99_4000, MAP_READ_EXECUTE)));

        mapper
            .set_phys_page(&mut page, 0x4000, 0x4000, NemPageProt::WRITE, &mut state, false)
            .unwrap();
        assert_eq!(state, NemPageState::Writable);
        assert_eq!(f.mapped(), 1);
        assert_eq!(
            f.platform.mapping(0x4000),
            Some((0x99_4000, HV_MAP_GPA_PERMISSIONS_ALL))
        );

        mapper
            .set_phys_page(&mut page, 0x4000, 0x4000, NemPageProt::empty(), &mut state, false)
            .unwrap();
        assert_eq!(state, NemPageState::Unmapped);
        assert_eq!(f.mapped(), 0);
        assert_eq!(f.platform.mapping(0x4000), None);

        // Unmapping an unmapped page is a no-op.
        let calls = f.platform.calls().len();
        mapper
            .set_phys_page(&mut page, 0x4000, 0x4000, NemPageProt::empty(), &mut state, false)
            .unwrap();
        assert_eq!(f.platform.calls().len(), calls);
    }

    #[test]
    fn test_batched_map_and_unmap() {
        let f = Fixture::new();
        for i in 0..4u64 {
            f.pgm.add_ram(0x2_0000 + i * 0x1000, 0x50_0000 + i * 0x1000, NemPageProt::all());
        }
        let mapper = f.mapper();
        let mut page = ScratchPage::new(0);
        let mut states = [
            NemPageState::NotSet,
            NemPageState::Unmapped,
            NemPageState::Readable,
            NemPageState::NotSet,
        ];

        mapper
            .map_pages(&mut page, 0x2_0000, 0x2_0000, NemPageProt::all(), &mut states)
            .unwrap();
        assert_eq!(states, [NemPageState::Writable; 4]);
        assert_eq!(f.mapped(), 3);
        assert_eq!(
            f.platform.calls(),
            vec![RecordedCall::Map {
                gpa: 0x2_0000,
                hpas: vec![0x50_0000, 0x50_1000, 0x50_2000, 0x50_3000],
                flags: HV_MAP_GPA_PERMISSIONS_ALL,
            }]
        );

        mapper.unmap_pages(&mut page, 0x2_0000, &mut states).unwrap();
        assert_eq!(states, [NemPageState::Unmapped; 4]);
        assert_eq!(f.mapped(), 0);
        assert_eq!(f.platform.mapping(0x2_2000), None);
    }

    #[test]
    fn test_write_to_readable_page_upgrades_mapping() {
        let f = Fixture::new();
        f.pgm.add_ram(0x8000, 0x77_8000, NemPageProt::all());
        f.pgm.set_state(0x8000, NemPageState::Readable);
        f.mapped.store(1, Ordering::Release);
        let mapper = f.mapper();
        let mut page = ScratchPage::new(0);

        let mut check = None;
        f.pgm
            .page_info_checker(
                0,
                0x8000,
                true,
                Some(&mut |gpa, info: &mut PageInfo| {
                    check = Some(mapper.check_memory_access(&mut page, gpa, gpa, true, info)?);
                    Ok(())
                }),
            )
            .unwrap();

        assert_eq!(
            check,
            Some(AccessCheck {
                can_resume: true,
                did_something: true
            })
        );
        assert_eq!(f.pgm.state(0x8000), NemPageState::Writable);
        assert_eq!(f.mapped(), 1);
        assert_eq!(
            f.platform.mapping(0x8000),
            Some((0x77_8000, HV_MAP_GPA_PERMISSIONS_ALL))
        );
    }

    #[test]
    fn test_access_checker_outcomes() {
        let f = Fixture::new();
        let mapper = f.mapper();
        let mut page = ScratchPage::new(0);
        f.pgm.add_ram(0x1000, 0x66_1000, NemPageProt::READ);

        // MMIO with no protection: nothing to do, emulate.
        let mut info = PageInfo {
            nem_state: NemPageState::Unmapped,
            ..Default::default()
        };
        let check = mapper
            .check_memory_access(&mut page, 0x1000, 0x1000, false, &mut info)
            .unwrap();
        assert!(!check.can_resume);

        // Write to a read-only page: leave it to the emulator.
        info.prot = NemPageProt::READ;
        let check = mapper
            .check_memory_access(&mut page, 0x1000, 0x1000, true, &mut info)
            .unwrap();
        assert!(!check.can_resume);

        // Read of an unmapped readable page maps it.
        let check = mapper
            .check_memory_access(&mut page, 0x1000, 0x1000, false, &mut info)
            .unwrap();
        assert!(check.can_resume);
        assert_eq!(info.nem_state, NemPageState::Readable);
        assert_eq!(f.mapped(), 1);

        // Readable page with read-only protection: emulate.
        let check = mapper
            .check_memory_access(&mut page, 0x1000, 0x1000, false, &mut info)
            .unwrap();
        assert!(!check.can_resume);

        // Writable page that lost its write protection gets unmapped.
        info.nem_state = NemPageState::Writable;
        info.prot = NemPageProt::READ;
        let check = mapper
            .check_memory_access(&mut page, 0x1000, 0x1000, true, &mut info)
            .unwrap();
        assert!(check.can_resume);
        assert_eq!(info.nem_state, NemPageState::Unmapped);
        assert_eq!(f.mapped(), 0);

        // Writable page already writable before the check: nothing changed.
        info.nem_state = NemPageState::Writable;
        info.old_nem_state = NemPageState::Writable;
        info.prot = NemPageProt::all();
        let check = mapper
            .check_memory_access(&mut page, 0x1000, 0x1000, true, &mut info)
            .unwrap();
        assert!(!check.can_resume);
    }

    #[test]
    fn test_map_failure_requests_unmap_all() {
        let f = Fixture::new();
        f.pgm.add_ram(0x1000, 0x66_1000, NemPageProt::all());
        f.platform.fail_next_maps(hvdef::HvStatus::ACCESS_DENIED, 1);
        let mapper = f.mapper();
        let mut page = ScratchPage::new(0);
        let mut info = PageInfo {
            prot: NemPageProt::all(),
            ..Default::default()
        };

        assert!(mapper
            .check_memory_access(&mut page, 0x1000, 0x1000, true, &mut info)
            .is_err());
        assert!(f.unmap_all.load(Ordering::Acquire));
        assert_eq!(f.mapped(), 0);
        assert_eq!(f.stats.snapshot().map_page_failed, 1);
    }

    #[test]
    fn test_unmap_all_readable() {
        let f = Fixture::new();
        let mapper = f.mapper();
        let mut page = ScratchPage::new(0);
        for i in 0..3u64 {
            let gpa = 0x10_0000 + i * 0x1000;
            f.pgm.add_ram(gpa, 0x40_0000 + i * 0x1000, NemPageProt::READ);
            let mut state = NemPageState::NotSet;
            mapper
                .set_phys_page(&mut page, gpa, gpa, NemPageProt::READ, &mut state, false)
                .unwrap();
            f.pgm.set_state(gpa, state);
        }
        f.pgm.add_ram(0x20_0000, 0x41_0000, NemPageProt::all());
        let mut state = NemPageState::NotSet;
        mapper
            .set_phys_page(&mut page, 0x20_0000, 0x20_0000, NemPageProt::all(), &mut state, false)
            .unwrap();
        f.pgm.set_state(0x20_0000, state);
        assert_eq!(f.mapped(), 4);

        assert_eq!(mapper.unmap_all_readable(&mut page, 0).unwrap(), 3);
        assert_eq!(f.mapped(), 1);
        assert_eq!(f.pgm.state(0x10_1000), NemPageState::Unmapped);
        assert_eq!(f.pgm.state(0x20_0000), NemPageState::Writable);
        assert_eq!(f.stats.snapshot().unmap_all_pages, 1);
    }

    #[test]
    fn test_update_page_with_a20_disabled() {
        let f = Fixture::new();
        let mapper = f.mapper();
        let mut page = ScratchPage::new(0);
        f.pgm.add_ram(0x10_2000, 0x30_2000, NemPageProt::all());
        f.pgm.add_ram(0x2000, 0x31_2000, NemPageProt::all());
        let mut alias = NemPageState::NotSet;
        mapper
            .set_phys_page(&mut page, 0x10_2000, 0x10_2000, NemPageProt::all(), &mut alias, false)
            .unwrap();
        f.pgm.set_state(0x10_2000, alias);
        assert_eq!(f.mapped(), 1);

        // Low page: the HMA alias is dropped and the page itself mapped.
        let mut state = NemPageState::NotSet;
        mapper
            .update_page(&mut page, 0, 0x2000, NemPageProt::all(), &mut state, false, false)
            .unwrap();
        assert_eq!(f.pgm.state(0x10_2000), NemPageState::Unmapped);
        assert_eq!(state, NemPageState::Writable);
        assert_eq!(f.mapped(), 1);

        // Page subject to A20: only its (own) alias is dropped.
        let mut state = NemPageState::NotSet;
        mapper
            .update_page(&mut page, 0, 0x10_2000, NemPageProt::all(), &mut state, false, false)
            .unwrap();
        assert_eq!(state, NemPageState::NotSet);
        assert_eq!(f.platform.mapping(0x10_2000), None);

        // With A20 enabled everything maps directly.
        mapper
            .update_page(&mut page, 0, 0x10_2000, NemPageProt::all(), &mut state, false, true)
            .unwrap();
        assert_eq!(state, NemPageState::Writable);
        assert_eq!(f.mapped(), 2);
    }
}
