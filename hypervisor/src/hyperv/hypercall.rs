// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//
// Copyright © 2020, Microsoft Corporation
//

use crate::config::NemConfig;
use crate::hypervisor::{self, HypervisorError, HypervisorPlatform, ScratchPage};
use hvdef::{
    get_vp_registers_output_offset, HvInputMapGpaPages, HvInputUnmapGpaPages, HvInputVpRegisters,
    HvRegisterAssoc, HvRegisterName, HvRegisterValue, HvStatus, HypercallCode, HypercallControl,
    HypercallOutput, HV_MAP_GPA_HEADER_SIZE, HV_MAP_GPA_MAX_PAGES, HV_PAGE_SHIFT, HV_PAGE_SIZE,
    HV_SET_VP_REGISTERS_MAX,
};

/// Highest guest physical address a map request may name.
const MAX_GPA: u64 = 1 << 60;

/// Names that fit in one get VP registers page with their values.
pub const HV_GET_VP_REGISTERS_MAX: usize = {
    let header = size_of::<HvInputVpRegisters>();
    let per_register = size_of::<HvRegisterName>() + size_of::<HvRegisterValue>();
    // Leave room for the output alignment padding.
    (HV_PAGE_SIZE - header - 32) / per_register
};

fn check_output(
    code: HypercallCode,
    output: HypercallOutput,
    reps: u16,
) -> hypervisor::Result<()> {
    if output.status().is_success() && output.completed(reps) {
        return Ok(());
    }
    let status = if output.status().is_success() {
        // Partial completion of a rep call is as bad as a failure.
        HvStatus::INVALID_PARAMETER
    } else {
        output.status()
    };
    Err(HypervisorError::HypercallFailed { code, status })
}

/// Hypercall transport of one partition.
///
/// Every call marshals its input into a pinned scratch page owned by the
/// caller: the vCPU's own page on the emulation thread, or the partition
/// wide page under its lock.
pub struct Transport<'a> {
    platform: &'a dyn HypervisorPlatform,
    partition_id: u64,
    config: &'a NemConfig,
}

impl<'a> Transport<'a> {
    pub fn new(
        platform: &'a dyn HypervisorPlatform,
        partition_id: u64,
        config: &'a NemConfig,
    ) -> Self {
        Transport {
            platform,
            partition_id,
            config,
        }
    }

    pub fn platform(&self) -> &'a dyn HypervisorPlatform {
        self.platform
    }

    /// Maps the host frames `hpas` at `gpa` with `flags`, depositing more
    /// memory into the partition when the hypervisor runs short.
    pub fn map_gpa_pages(
        &self,
        page: &mut ScratchPage,
        gpa: u64,
        hpas: &[u64],
        flags: u32,
    ) -> hypervisor::Result<()> {
        if hpas.is_empty() || hpas.len() > HV_MAP_GPA_MAX_PAGES {
            return Err(HypervisorError::InvalidInput("map page count out of range"));
        }
        if gpa & ((1 << HV_PAGE_SHIFT) - 1) != 0 {
            return Err(HypervisorError::InvalidInput("guest address not page aligned"));
        }
        if gpa >= MAX_GPA {
            return Err(HypervisorError::InvalidInput("guest address out of range"));
        }

        let reps = hpas.len() as u16;
        let mut attempts = 0;
        loop {
            page.write(
                0,
                &HvInputMapGpaPages {
                    target_partition_id: self.partition_id,
                    target_gpa_base: gpa >> HV_PAGE_SHIFT,
                    map_flags: flags,
                    padding: 0,
                },
            );
            for (i, hpa) in hpas.iter().enumerate() {
                page.write(HV_MAP_GPA_HEADER_SIZE + i * 8, &(hpa >> HV_PAGE_SHIFT));
            }

            let control = HypercallControl::call(HypercallCode::MAP_GPA_PAGES, reps);
            let output = self.platform.invoke_hypercall(control, page, None);
            if output.status() != HvStatus::INSUFFICIENT_MEMORY {
                return check_output(HypercallCode::MAP_GPA_PAGES, output, reps);
            }

            attempts += 1;
            if attempts > self.config.deposit_max_attempts {
                return Err(HypervisorError::HypercallFailed {
                    code: HypercallCode::MAP_GPA_PAGES,
                    status: output.status(),
                });
            }
            debug!(
                "Map of {:#x} ({} pages) ran out of partition memory, attempt {}",
                gpa, reps, attempts
            );
            let deposited = self
                .platform
                .deposit_memory(self.partition_id, self.config.deposit_pages)?;
            if deposited == 0 {
                return Err(HypervisorError::DepositMemory(anyhow::anyhow!(
                    "no pages deposited for partition {}",
                    self.partition_id
                )));
            }
            info!(
                "Deposited {} pages into partition {}",
                deposited, self.partition_id
            );
        }
    }

    /// Unmaps `count` pages at `gpa` and releases the hypervisor's
    /// bookkeeping for them.
    pub fn unmap_gpa_pages(
        &self,
        page: &mut ScratchPage,
        gpa: u64,
        count: u16,
    ) -> hypervisor::Result<()> {
        if count == 0 || count as usize > HV_MAP_GPA_MAX_PAGES {
            return Err(HypervisorError::InvalidInput("unmap page count out of range"));
        }

        for code in [
            HypercallCode::UNMAP_GPA_PAGES,
            HypercallCode::UNCOMMIT_GPA_PAGES,
        ] {
            page.write(
                0,
                &HvInputUnmapGpaPages {
                    target_partition_id: self.partition_id,
                    target_gpa_base: gpa >> HV_PAGE_SHIFT,
                    unmap_flags: 0,
                    padding: 0,
                },
            );
            let output = self
                .platform
                .invoke_hypercall(HypercallControl::call(code, count), page, None);
            check_output(code, output, count)?;
        }
        Ok(())
    }

    pub fn set_vp_registers(
        &self,
        page: &mut ScratchPage,
        vp_index: u32,
        assocs: &[HvRegisterAssoc],
    ) -> hypervisor::Result<()> {
        if assocs.is_empty() {
            return Ok(());
        }
        if assocs.len() > HV_SET_VP_REGISTERS_MAX {
            return Err(HypervisorError::InvalidInput("too many registers to set"));
        }

        page.write(0, &self.vp_registers_header(vp_index));
        let base = size_of::<HvInputVpRegisters>();
        for (i, assoc) in assocs.iter().enumerate() {
            page.write(base + i * size_of::<HvRegisterAssoc>(), assoc);
        }

        let reps = assocs.len() as u16;
        let output = self.platform.invoke_hypercall(
            HypercallControl::call(HypercallCode::SET_VP_REGISTERS, reps),
            page,
            None,
        );
        check_output(HypercallCode::SET_VP_REGISTERS, output, reps)
    }

    /// Fetches `names` into the parallel `values` slice.
    pub fn get_vp_registers(
        &self,
        page: &mut ScratchPage,
        vp_index: u32,
        names: &[HvRegisterName],
        values: &mut [HvRegisterValue],
    ) -> hypervisor::Result<()> {
        if names.len() != values.len() {
            return Err(HypervisorError::InvalidInput("register name/value count mismatch"));
        }
        if names.is_empty() {
            return Ok(());
        }
        if names.len() > HV_GET_VP_REGISTERS_MAX {
            return Err(HypervisorError::InvalidInput("too many registers to get"));
        }

        page.write(0, &self.vp_registers_header(vp_index));
        let base = size_of::<HvInputVpRegisters>();
        for (i, name) in names.iter().enumerate() {
            page.write(base + i * size_of::<HvRegisterName>(), name);
        }

        let reps = names.len() as u16;
        let output_offset = get_vp_registers_output_offset(names.len());
        let output = self.platform.invoke_hypercall(
            HypercallControl::call(HypercallCode::GET_VP_REGISTERS, reps),
            page,
            Some(output_offset),
        );
        check_output(HypercallCode::GET_VP_REGISTERS, output, reps)?;

        for (i, value) in values.iter_mut().enumerate() {
            *value = page.read(output_offset + i * size_of::<HvRegisterValue>());
        }
        Ok(())
    }

    fn vp_registers_header(&self, vp_index: u32) -> HvInputVpRegisters {
        HvInputVpRegisters {
            partition_id: self.partition_id,
            vp_index,
            target_vtl: 0,
            rsvd: [0; 3],
        }
    }
}
