// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//
// Copyright © 2020, Microsoft Corporation
//
// Copyright 2018-2019 CrowdStrike, Inc.
//
//

use bitflags::bitflags;
use hvdef::{
    HvMessage, HvStatus, HypercallCode, HypercallControl, HypercallOutput, HV_PAGE_SIZE,
};
use thiserror::Error;
use zerocopy::{FromBytes, Immutable, IntoBytes};

#[derive(Error, Debug)]
///
///
pub enum HypervisorError {
    ///
    /// Host entry point could not be resolved
    ///
    #[error("Platform API {0} is not available")]
    MissingPlatformApi(&'static str),
    ///
    /// Hypercall returned a failure status
    ///
    #[error("Hypercall {code} failed: {status}")]
    HypercallFailed { code: HypercallCode, status: HvStatus },
    ///
    /// Hypercall input rejected before issuing the call
    ///
    #[error("Invalid hypercall input: {0}")]
    InvalidInput(&'static str),
    ///
    /// Depositing memory to the partition failed
    ///
    #[error("Failed to deposit memory: {0}")]
    DepositMemory(#[source] anyhow::Error),
    ///
    /// Partition creation failure
    ///
    #[error("Failed to create partition: {0}")]
    CreatePartition(#[source] anyhow::Error),
    ///
    /// Pinned scratch page allocation failure
    ///
    #[error("Failed to allocate hypercall scratch page: {0}")]
    AllocateScratch(#[source] anyhow::Error),
    ///
    /// Virtual processor start failure
    ///
    #[error("Failed to start virtual processor: {0}")]
    StartVp(#[source] anyhow::Error),
    ///
    /// Virtual processor stop failure
    ///
    #[error("Failed to stop virtual processor: {0}")]
    StopVp(#[source] anyhow::Error),
    ///
    /// Message slot wait failure
    ///
    #[error("Failed to handle and get next message: {0}")]
    MessageSlot(#[source] anyhow::Error),
    ///
    /// Alerting the emulation thread failed
    ///
    #[error("Failed to alert virtual processor thread: {0}")]
    AlertThread(#[source] anyhow::Error),
}

///
/// Result type for returning from a function
///
pub type Result<T> = std::result::Result<T, HypervisorError>;

bitflags! {
    /// Flags of the VID message slot handle-and-get-next call.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SlotFlags: u32 {
        /// Acknowledge the message currently in the slot.
        const HANDLE_MESSAGE = 0x1;
        /// Wait for the next message.
        const GET_NEXT_MESSAGE = 0x2;
    }
}

/// Message found in the slot after a successful wait.
#[derive(Clone, Copy, Debug)]
pub enum SlotMessage {
    /// Hypervisor intercept message.
    Hypervisor(HvMessage),
    /// Stop request issued by `stop_vp` completed.
    StopRequestComplete,
    /// Any other VID message type.
    Other(u32),
}

/// Outcome of a message slot wait.
#[derive(Clone, Copy, Debug)]
pub enum SlotWait {
    Message(SlotMessage),
    Timeout,
    Alerted,
    UserApc,
    KernelApc,
}

/// Outcome of a stop request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopResult {
    /// The processor stopped before taking another exit.
    Stopped,
    /// The processor exited on its own; messages are pending.
    Pending,
}

#[repr(C, align(4096))]
struct PageBuffer([u8; HV_PAGE_SIZE]);

///
/// Pinned, physically contiguous page used as hypercall input and output.
///
pub struct ScratchPage {
    buf: Box<PageBuffer>,
    phys: u64,
}

impl ScratchPage {
    /// Wraps a zeroed page whose host physical address is `phys`.
    pub fn new(phys: u64) -> Self {
        ScratchPage {
            buf: Box::new(PageBuffer([0; HV_PAGE_SIZE])),
            phys,
        }
    }

    pub fn phys(&self) -> u64 {
        self.phys
    }

    pub fn bytes(&self) -> &[u8; HV_PAGE_SIZE] {
        &self.buf.0
    }

    pub fn bytes_mut(&mut self) -> &mut [u8; HV_PAGE_SIZE] {
        &mut self.buf.0
    }

    /// Copies `value` into the page at `offset`.
    pub fn write<T: IntoBytes + Immutable>(&mut self, offset: usize, value: &T) {
        let bytes = value.as_bytes();
        self.buf.0[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Reads a `T` from the page at `offset`.
    pub fn read<T: FromBytes + IntoBytes + Immutable>(&self, offset: usize) -> T {
        let mut value = T::new_zeroed();
        let len = value.as_bytes().len();
        value
            .as_mut_bytes()
            .copy_from_slice(&self.buf.0[offset..offset + len]);
        value
    }
}

///
/// Trait to represent the host side of the Hyper-V partition interface
///
/// Implemented by the host glue (kernel driver or user mode VID bindings)
/// and consumed by the NEM core.
///
pub trait HypervisorPlatform: Send + Sync {
    ///
    /// Checks that the hypercall and memory deposit entry points exist
    ///
    fn check_entry_points(&self) -> Result<()>;
    ///
    /// Create a partition for `cpu_count` virtual processors and return its id
    ///
    fn create_partition(&self, cpu_count: u32) -> Result<u64>;
    ///
    /// Allocate and pin a hypercall scratch page
    ///
    fn allocate_scratch_page(&self) -> Result<ScratchPage>;
    ///
    /// Invoke a slow hypercall with the page as input. When `output_offset`
    /// is set the output lands in the same page at that offset.
    ///
    fn invoke_hypercall(
        &self,
        control: HypercallControl,
        page: &mut ScratchPage,
        output_offset: Option<usize>,
    ) -> HypercallOutput;
    ///
    /// Donate `pages` host pages to the partition, returning how many were added
    ///
    fn deposit_memory(&self, partition_id: u64, pages: usize) -> Result<usize>;
    ///
    /// Start (resume) a virtual processor
    ///
    fn start_vp(&self, vp_index: u32) -> Result<()>;
    ///
    /// Ask a virtual processor to stop
    ///
    fn stop_vp(&self, vp_index: u32) -> Result<StopResult>;
    ///
    /// Acknowledge and/or wait for the next message in the VP message slot
    ///
    fn handle_and_get_next(
        &self,
        vp_index: u32,
        flags: SlotFlags,
        timeout_ms: u32,
    ) -> Result<SlotWait>;
    ///
    /// Wake the thread blocked in `handle_and_get_next` for this VP
    ///
    fn alert_vp_thread(&self, vp_index: u32) -> Result<()>;
    ///
    /// Read the host time stamp counter
    ///
    fn read_host_tsc(&self) -> u64;
}
