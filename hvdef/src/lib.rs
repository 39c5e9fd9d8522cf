// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//
// Copyright © 2020, Microsoft Corporation
//
// Copyright 2018-2019 CrowdStrike, Inc.
//
//

//! Microsoft Hypervisor hypercall ABI definitions
//!
//! Plain data types shared between the NEM backend and the host platform:
//! hypercall codes and status values, the register namespace, the 16 byte
//! register value union and the intercept messages delivered through the
//! VID message slot.
//!

use bitfield_struct::bitfield;
use static_assertions::const_assert_eq;
use std::fmt;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const HV_PAGE_SIZE: usize = 4096;
pub const HV_PAGE_SHIFT: u64 = 12;

/// Size of the fixed part of the map/unmap GPA pages input.
pub const HV_MAP_GPA_HEADER_SIZE: usize = size_of::<HvInputMapGpaPages>();

/// Largest rep count a single map GPA pages call can carry in one page.
pub const HV_MAP_GPA_MAX_PAGES: usize = (HV_PAGE_SIZE - HV_MAP_GPA_HEADER_SIZE) / size_of::<u64>();

/// Largest number of name/value pairs a single set VP registers call can carry.
pub const HV_SET_VP_REGISTERS_MAX: usize =
    (HV_PAGE_SIZE - size_of::<HvInputVpRegisters>()) / size_of::<HvRegisterAssoc>();

// Map GPA flags
pub const HV_MAP_GPA_READABLE: u32 = 0x1;
pub const HV_MAP_GPA_WRITABLE: u32 = 0x2;
pub const HV_MAP_GPA_KERNEL_EXECUTABLE: u32 = 0x4;
pub const HV_MAP_GPA_USER_EXECUTABLE: u32 = 0x8;
pub const HV_MAP_GPA_PERMISSIONS_ALL: u32 = HV_MAP_GPA_READABLE
    | HV_MAP_GPA_WRITABLE
    | HV_MAP_GPA_KERNEL_EXECUTABLE
    | HV_MAP_GPA_USER_EXECUTABLE;

macro_rules! open_enum {
    (
        $(#[$attr:meta])*
        pub struct $name:ident($repr:ty) {
            $($variant:ident = $value:expr,)*
        }
    ) => {
        $(#[$attr])*
        #[repr(transparent)]
        #[derive(Copy, Clone, PartialEq, Eq, Hash, IntoBytes, Immutable, KnownLayout, FromBytes)]
        pub struct $name(pub $repr);

        impl $name {
            $(pub const $variant: Self = Self($value);)*

            /// Returns the symbolic name of a known value.
            pub fn name(&self) -> Option<&'static str> {
                match *self {
                    $(Self::$variant => Some(stringify!($variant)),)*
                    _ => None,
                }
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.name() {
                    Some(name) => f.write_str(name),
                    None => write!(f, "{}({:#x})", stringify!($name), self.0),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Debug::fmt(self, f)
            }
        }
    };
}

open_enum! {
    /// Hypercall call codes used by the NEM backend.
    pub struct HypercallCode(u16) {
        MAP_GPA_PAGES = 0x004b,
        UNMAP_GPA_PAGES = 0x004c,
        GET_VP_REGISTERS = 0x0050,
        SET_VP_REGISTERS = 0x0051,
        UNCOMMIT_GPA_PAGES = 0x00c4,
    }
}

open_enum! {
    /// Hypercall completion status.
    pub struct HvStatus(u16) {
        SUCCESS = 0x0000,
        INVALID_HYPERCALL_CODE = 0x0002,
        INVALID_HYPERCALL_INPUT = 0x0003,
        INVALID_ALIGNMENT = 0x0004,
        INVALID_PARAMETER = 0x0005,
        ACCESS_DENIED = 0x0006,
        INVALID_PARTITION_STATE = 0x0007,
        OPERATION_DENIED = 0x0008,
        UNKNOWN_PROPERTY = 0x0009,
        PROPERTY_VALUE_OUT_OF_RANGE = 0x000a,
        INSUFFICIENT_MEMORY = 0x000b,
        INVALID_PARTITION_ID = 0x000d,
        INVALID_VP_INDEX = 0x000e,
    }
}

impl HvStatus {
    pub fn is_success(&self) -> bool {
        *self == Self::SUCCESS
    }
}

/// Hypercall input control word.
///
/// The call code lives in bits 0-15 and the rep count in bits 32-43.
#[bitfield(u64)]
#[derive(PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HypercallControl {
    pub code: u16,
    pub fast: bool,
    #[bits(10)]
    pub variable_header_size: u16,
    #[bits(4)]
    _rsvd0: u8,
    pub nested: bool,
    #[bits(12)]
    pub rep_count: u16,
    #[bits(4)]
    _rsvd1: u8,
    #[bits(12)]
    pub rep_start: u16,
    #[bits(4)]
    _rsvd2: u8,
}

impl HypercallControl {
    /// Builds the call info word for a (possibly repeated) slow hypercall.
    pub fn call(code: HypercallCode, reps: u16) -> Self {
        Self::new().with_code(code.0).with_rep_count(reps)
    }
}

/// Hypercall result word.
#[bitfield(u64)]
#[derive(PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HypercallOutput {
    pub call_status: u16,
    _rsvd0: u16,
    #[bits(12)]
    pub elements_processed: u16,
    #[bits(20)]
    _rsvd1: u32,
}

impl HypercallOutput {
    pub fn status(&self) -> HvStatus {
        HvStatus(self.call_status())
    }

    /// A rep hypercall succeeded only if the result is exactly the
    /// completed rep count with a zero status.
    pub fn completed(&self, reps: u16) -> bool {
        self.into_bits() == (reps as u64) << 32
    }
}

open_enum! {
    /// Synthetic message types delivered to the VP message slot.
    pub struct HvMessageType(u32) {
        NONE = 0x0000_0000,
        UNMAPPED_GPA = 0x8000_0000,
        GPA_INTERCEPT = 0x8000_0001,
        TIMER_EXPIRED = 0x8000_0010,
        INVALID_VP_REGISTER_VALUE = 0x8000_0020,
        UNRECOVERABLE_EXCEPTION = 0x8000_0021,
        UNSUPPORTED_FEATURE = 0x8000_0022,
        TLB_PAGE_SIZE_MISMATCH = 0x8000_0023,
        EVENT_LOG_BUFFER_COMPLETE = 0x8000_0040,
        X64_IO_PORT_INTERCEPT = 0x8001_0000,
        X64_MSR_INTERCEPT = 0x8001_0001,
        X64_CPUID_INTERCEPT = 0x8001_0002,
        X64_EXCEPTION_INTERCEPT = 0x8001_0003,
        X64_APIC_EOI = 0x8001_0004,
        X64_REGISTER_INTERCEPT = 0x8001_0006,
        X64_HALT = 0x8001_0007,
        X64_INTERRUPTION_DELIVERABLE = 0x8001_0008,
    }
}

open_enum! {
    /// Intercept access type carried in the intercept message header.
    pub struct HvInterceptAccessType(u8) {
        READ = 0,
        WRITE = 1,
        EXECUTE = 2,
    }
}

open_enum! {
    /// Hyper-V register namespace (x64).
    pub struct HvRegisterName(u32) {
        PENDING_INTERRUPTION = 0x0001_0002,
        INTERRUPT_STATE = 0x0001_0003,
        PENDING_EVENT0 = 0x0001_0004,
        PENDING_EVENT1 = 0x0001_0005,
        DELIVERABILITY_NOTIFICATIONS = 0x0001_0006,

        RAX = 0x0002_0000,
        RCX = 0x0002_0001,
        RDX = 0x0002_0002,
        RBX = 0x0002_0003,
        RSP = 0x0002_0004,
        RBP = 0x0002_0005,
        RSI = 0x0002_0006,
        RDI = 0x0002_0007,
        R8 = 0x0002_0008,
        R9 = 0x0002_0009,
        R10 = 0x0002_000a,
        R11 = 0x0002_000b,
        R12 = 0x0002_000c,
        R13 = 0x0002_000d,
        R14 = 0x0002_000e,
        R15 = 0x0002_000f,
        RIP = 0x0002_0010,
        RFLAGS = 0x0002_0011,

        XMM0 = 0x0003_0000,
        XMM1 = 0x0003_0001,
        XMM2 = 0x0003_0002,
        XMM3 = 0x0003_0003,
        XMM4 = 0x0003_0004,
        XMM5 = 0x0003_0005,
        XMM6 = 0x0003_0006,
        XMM7 = 0x0003_0007,
        XMM8 = 0x0003_0008,
        XMM9 = 0x0003_0009,
        XMM10 = 0x0003_000a,
        XMM11 = 0x0003_000b,
        XMM12 = 0x0003_000c,
        XMM13 = 0x0003_000d,
        XMM14 = 0x0003_000e,
        XMM15 = 0x0003_000f,
        FP_MMX0 = 0x0003_0010,
        FP_MMX1 = 0x0003_0011,
        FP_MMX2 = 0x0003_0012,
        FP_MMX3 = 0x0003_0013,
        FP_MMX4 = 0x0003_0014,
        FP_MMX5 = 0x0003_0015,
        FP_MMX6 = 0x0003_0016,
        FP_MMX7 = 0x0003_0017,
        FP_CONTROL_STATUS = 0x0003_0018,
        XMM_CONTROL_STATUS = 0x0003_0019,

        CR0 = 0x0004_0000,
        CR2 = 0x0004_0001,
        CR3 = 0x0004_0002,
        CR4 = 0x0004_0003,
        CR8 = 0x0004_0004,

        DR0 = 0x0005_0000,
        DR1 = 0x0005_0001,
        DR2 = 0x0005_0002,
        DR3 = 0x0005_0003,
        DR6 = 0x0005_0004,
        DR7 = 0x0005_0005,

        ES = 0x0006_0000,
        CS = 0x0006_0001,
        SS = 0x0006_0002,
        DS = 0x0006_0003,
        FS = 0x0006_0004,
        GS = 0x0006_0005,
        LDTR = 0x0006_0006,
        TR = 0x0006_0007,

        IDTR = 0x0007_0000,
        GDTR = 0x0007_0001,

        TSC = 0x0008_0000,
        EFER = 0x0008_0001,
        KERNEL_GS_BASE = 0x0008_0002,
        APIC_BASE = 0x0008_0003,
        PAT = 0x0008_0004,
        SYSENTER_CS = 0x0008_0005,
        SYSENTER_EIP = 0x0008_0006,
        SYSENTER_ESP = 0x0008_0007,
        STAR = 0x0008_0008,
        LSTAR = 0x0008_0009,
        CSTAR = 0x0008_000a,
        SFMASK = 0x0008_000b,
        MTRR_CAP = 0x0008_000d,
        MTRR_DEF_TYPE = 0x0008_000e,
        MTRR_FIX64K_00000 = 0x0008_0070,
        MTRR_FIX16K_80000 = 0x0008_0071,
        MTRR_FIX16K_A0000 = 0x0008_0072,
        MTRR_FIX4K_C0000 = 0x0008_0073,
        MTRR_FIX4K_C8000 = 0x0008_0074,
        MTRR_FIX4K_D0000 = 0x0008_0075,
        MTRR_FIX4K_D8000 = 0x0008_0076,
        MTRR_FIX4K_E0000 = 0x0008_0077,
        MTRR_FIX4K_E8000 = 0x0008_0078,
        MTRR_FIX4K_F0000 = 0x0008_0079,
        MTRR_FIX4K_F8000 = 0x0008_007a,
        TSC_AUX = 0x0008_007b,
    }
}

/// 16 byte register value union.
///
/// Aliases 64-bit and 128-bit scalars, segment and table registers, and
/// the FP/XMM control-status layouts. High padding must be zero on input.
#[repr(C, align(16))]
#[derive(Copy, Clone, Default, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HvRegisterValue(pub [u8; 16]);

impl HvRegisterValue {
    pub fn as_u128(&self) -> u128 {
        u128::from_le_bytes(self.0)
    }

    pub fn as_u64(&self) -> u64 {
        self.as_u128() as u64
    }

    pub fn as_u32(&self) -> u32 {
        self.as_u128() as u32
    }

    pub fn as_segment(&self) -> HvX64SegmentRegister {
        zerocopy::transmute!(self.0)
    }

    pub fn as_table(&self) -> HvX64TableRegister {
        zerocopy::transmute!(self.0)
    }

    pub fn as_fp_control_status(&self) -> HvX64FpControlStatusRegister {
        zerocopy::transmute!(self.0)
    }

    pub fn as_xmm_control_status(&self) -> HvX64XmmControlStatusRegister {
        zerocopy::transmute!(self.0)
    }
}

impl fmt::Debug for HvRegisterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.as_u128())
    }
}

impl From<u128> for HvRegisterValue {
    fn from(val: u128) -> Self {
        Self(val.to_le_bytes())
    }
}

impl From<u64> for HvRegisterValue {
    fn from(val: u64) -> Self {
        (val as u128).into()
    }
}

impl From<u32> for HvRegisterValue {
    fn from(val: u32) -> Self {
        (val as u128).into()
    }
}

macro_rules! register_value_from {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for HvRegisterValue {
                fn from(val: $ty) -> Self {
                    Self(zerocopy::transmute!(val))
                }
            }
        )*
    };
}

register_value_from!(
    HvX64SegmentRegister,
    HvX64TableRegister,
    HvX64FpControlStatusRegister,
    HvX64XmmControlStatusRegister
);

macro_rules! register_value_from_bitfield {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for HvRegisterValue {
                fn from(val: $ty) -> Self {
                    val.into_bits().into()
                }
            }

            impl From<HvRegisterValue> for $ty {
                fn from(val: HvRegisterValue) -> Self {
                    Self::from_bits(val.as_u64())
                }
            }
        )*
    };
}

register_value_from_bitfield!(
    HvX64PendingInterruptionRegister,
    HvX64InterruptStateRegister,
    HvDeliverabilityNotificationsRegister
);

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HvX64SegmentRegister {
    pub base: u64,
    pub limit: u32,
    pub selector: u16,
    pub attributes: u16,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HvX64TableRegister {
    pub pad: [u16; 3],
    pub limit: u16,
    pub base: u64,
}

/// x87 control/status, with the last instruction pointer packed as
/// FPUIP (bits 0-31) and CS (bits 32-47) outside of 64-bit mode.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HvX64FpControlStatusRegister {
    pub fp_control: u16,
    pub fp_status: u16,
    pub fp_tag: u8,
    pub reserved: u8,
    pub last_fp_op: u16,
    pub last_fp_rip: u64,
}

/// SSE control/status, with the last data pointer packed as FPUDP
/// (bits 0-31) and DS (bits 32-47) outside of 64-bit mode.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HvX64XmmControlStatusRegister {
    pub last_fp_rdp: u64,
    pub xmm_status_control: u32,
    pub xmm_status_control_mask: u32,
}

open_enum! {
    /// Interruption type held in the pending interruption register.
    pub struct HvX64PendingInterruptionType(u8) {
        EXTERNAL = 0,
        NMI = 2,
        EXCEPTION = 3,
        SOFTWARE_INTERRUPT = 4,
        PRIVILEGED_SOFTWARE_EXCEPTION = 5,
        SOFTWARE_EXCEPTION = 6,
    }
}

#[bitfield(u64)]
#[derive(PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HvX64PendingInterruptionRegister {
    pub interruption_pending: bool,
    #[bits(3)]
    pub interruption_type: u8,
    pub deliver_error_code: bool,
    #[bits(4)]
    pub instruction_length: u8,
    pub nested_event: bool,
    #[bits(6)]
    _reserved: u8,
    pub interruption_vector: u16,
    pub error_code: u32,
}

#[bitfield(u64)]
#[derive(PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HvX64InterruptStateRegister {
    pub interrupt_shadow: bool,
    pub nmi_masked: bool,
    #[bits(62)]
    _reserved: u64,
}

#[bitfield(u64)]
#[derive(PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HvDeliverabilityNotificationsRegister {
    pub nmi_notification: bool,
    pub interrupt_notification: bool,
    #[bits(4)]
    pub interrupt_priority: u8,
    #[bits(42)]
    _reserved: u64,
    pub sints: u16,
}

/// One entry of the set VP registers input list.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HvRegisterAssoc {
    pub name: HvRegisterName,
    pub pad: [u32; 3],
    pub value: HvRegisterValue,
}

impl<T: Into<HvRegisterValue>> From<(HvRegisterName, T)> for HvRegisterAssoc {
    fn from((name, value): (HvRegisterName, T)) -> Self {
        Self {
            name,
            pad: [0; 3],
            value: value.into(),
        }
    }
}

/// Fixed header of both the get and the set VP registers inputs.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HvInputVpRegisters {
    pub partition_id: u64,
    pub vp_index: u32,
    pub target_vtl: u8,
    pub rsvd: [u8; 3],
}

/// Offset of the value array written by a get VP registers call
/// issued with `count` names from a single page.
pub const fn get_vp_registers_output_offset(count: usize) -> usize {
    let end = size_of::<HvInputVpRegisters>() + count * size_of::<HvRegisterName>();
    (end + 31) & !31
}

/// Fixed header of the map GPA pages input, followed by host PFNs.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HvInputMapGpaPages {
    pub target_partition_id: u64,
    pub target_gpa_base: u64,
    pub map_flags: u32,
    pub padding: u32,
}

/// Input of both the unmap and the uncommit GPA pages calls.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HvInputUnmapGpaPages {
    pub target_partition_id: u64,
    pub target_gpa_base: u64,
    pub unmap_flags: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HvMessageHeader {
    pub typ: HvMessageType,
    pub len: u8,
    pub flags: u8,
    pub rsvd: u16,
    pub id: u64,
}

pub const HV_MESSAGE_SIZE: usize = 256;
pub const HV_MESSAGE_PAYLOAD_SIZE: usize = 240;

/// A message as found in the VP message slot.
#[repr(C, align(16))]
#[derive(Clone, Copy, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HvMessage {
    pub header: HvMessageHeader,
    pub payload_buffer: [u8; HV_MESSAGE_PAYLOAD_SIZE],
}

impl HvMessage {
    /// Builds a message of type `typ` carrying `payload`, truncated to the
    /// slot's payload capacity.
    pub fn new(typ: HvMessageType, id: u64, payload: &[u8]) -> Self {
        let len = payload.len().min(HV_MESSAGE_PAYLOAD_SIZE);
        let mut msg = Self {
            header: HvMessageHeader {
                typ,
                len: len as u8,
                flags: 0,
                rsvd: 0,
                id,
            },
            payload_buffer: [0; HV_MESSAGE_PAYLOAD_SIZE],
        };
        msg.payload_buffer[..len].copy_from_slice(&payload[..len]);
        msg
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload_buffer[..(self.header.len as usize).min(HV_MESSAGE_PAYLOAD_SIZE)]
    }

    /// Reads the payload as `T` if the advertised payload size matches.
    pub fn as_message<T: FromBytes + KnownLayout + Immutable>(&self) -> Option<T> {
        if self.header.len as usize != size_of::<T>() {
            return None;
        }
        T::read_from_prefix(self.payload()).ok().map(|(t, _)| t)
    }
}

impl fmt::Debug for HvMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HvMessage")
            .field("header", &self.header)
            .finish_non_exhaustive()
    }
}

#[bitfield(u16)]
#[derive(PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HvX64VpExecutionState {
    #[bits(2)]
    pub cpl: u8,
    pub cr0_pe: bool,
    pub cr0_am: bool,
    pub efer_lma: bool,
    pub debug_active: bool,
    pub interruption_pending: bool,
    #[bits(4)]
    pub vtl: u8,
    pub enclave_mode: bool,
    pub interrupt_shadow: bool,
    pub virtualization_fault_active: bool,
    #[bits(2)]
    _reserved: u8,
}

/// Common header of every x64 intercept message.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HvX64InterceptMessageHeader {
    pub vp_index: u32,
    pub instruction_length_and_cr8: u8,
    pub intercept_access_type: HvInterceptAccessType,
    pub execution_state: HvX64VpExecutionState,
    pub cs_segment: HvX64SegmentRegister,
    pub rip: u64,
    pub rflags: u64,
}

impl HvX64InterceptMessageHeader {
    pub fn instruction_len(&self) -> u8 {
        self.instruction_length_and_cr8 & 0xf
    }

    pub fn cr8(&self) -> u8 {
        self.instruction_length_and_cr8 >> 4
    }
}

#[bitfield(u8)]
#[derive(PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HvX64IoPortAccessInfo {
    #[bits(3)]
    pub access_size: u8,
    pub string_op: bool,
    pub rep_prefix: bool,
    #[bits(3)]
    _reserved: u8,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HvX64IoPortInterceptMessage {
    pub header: HvX64InterceptMessageHeader,
    pub port_number: u16,
    pub access_info: HvX64IoPortAccessInfo,
    pub instruction_byte_count: u8,
    pub reserved: u32,
    pub rax: u64,
    pub instruction_bytes: [u8; 16],
    pub ds_segment: HvX64SegmentRegister,
    pub es_segment: HvX64SegmentRegister,
    pub rcx: u64,
    pub rsi: u64,
    pub rdi: u64,
}

#[bitfield(u8)]
#[derive(PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HvX64MemoryAccessInfo {
    pub gva_valid: bool,
    pub gva_gpa_valid: bool,
    pub hypercall_output_pending: bool,
    pub tlb_locked: bool,
    #[bits(4)]
    _reserved: u8,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HvX64MemoryInterceptMessage {
    pub header: HvX64InterceptMessageHeader,
    pub cache_type: u32,
    pub instruction_byte_count: u8,
    pub memory_access_info: HvX64MemoryAccessInfo,
    pub tpr_priority: u8,
    pub reserved: u8,
    pub guest_virtual_address: u64,
    pub guest_physical_address: u64,
    pub instruction_bytes: [u8; 16],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HvX64MsrInterceptMessage {
    pub header: HvX64InterceptMessageHeader,
    pub msr_number: u32,
    pub reserved: u32,
    pub rdx: u64,
    pub rax: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HvX64CpuidInterceptMessage {
    pub header: HvX64InterceptMessageHeader,
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub default_result_rax: u64,
    pub default_result_rcx: u64,
    pub default_result_rdx: u64,
    pub default_result_rbx: u64,
}

#[bitfield(u8)]
#[derive(PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HvX64ExceptionInfo {
    pub error_code_valid: bool,
    pub software_exception: bool,
    #[bits(6)]
    _reserved: u8,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HvX64ExceptionInterceptMessage {
    pub header: HvX64InterceptMessageHeader,
    pub vector: u16,
    pub exception_info: HvX64ExceptionInfo,
    pub instruction_byte_count: u8,
    pub error_code: u32,
    pub exception_parameter: u64,
    pub reserved: u64,
    pub instruction_bytes: [u8; 16],
    pub ds_segment: HvX64SegmentRegister,
    pub ss_segment: HvX64SegmentRegister,
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
}

open_enum! {
    pub struct HvX64PendingInterruptionDeliverableType(u8) {
        INTERRUPT = 0,
        NMI = 2,
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HvX64InterruptionDeliverableMessage {
    pub header: HvX64InterceptMessageHeader,
    pub deliverable_type: HvX64PendingInterruptionDeliverableType,
    pub rsvd: [u8; 3],
    pub rsvd2: u32,
}

/// Payload of halt and unrecoverable exception messages.
pub type HvX64HaltMessage = HvX64InterceptMessageHeader;
pub type HvX64UnrecoverableExceptionMessage = HvX64InterceptMessageHeader;

const_assert_eq!(size_of::<HvRegisterValue>(), 16);
const_assert_eq!(size_of::<HvRegisterAssoc>(), 32);
const_assert_eq!(size_of::<HvX64SegmentRegister>(), 16);
const_assert_eq!(size_of::<HvX64TableRegister>(), 16);
const_assert_eq!(size_of::<HvX64FpControlStatusRegister>(), 16);
const_assert_eq!(size_of::<HvX64XmmControlStatusRegister>(), 16);
const_assert_eq!(size_of::<HvInputVpRegisters>(), 16);
const_assert_eq!(size_of::<HvInputMapGpaPages>(), 24);
const_assert_eq!(size_of::<HvInputUnmapGpaPages>(), 24);
const_assert_eq!(size_of::<HvMessageHeader>(), 16);
const_assert_eq!(size_of::<HvMessage>(), HV_MESSAGE_SIZE);
const_assert_eq!(size_of::<HvX64InterceptMessageHeader>(), 0x28);
const_assert_eq!(size_of::<HvX64IoPortInterceptMessage>(), 0x80);
const_assert_eq!(size_of::<HvX64MemoryInterceptMessage>(), 0x50);
const_assert_eq!(size_of::<HvX64MsrInterceptMessage>(), 0x40);
const_assert_eq!(size_of::<HvX64CpuidInterceptMessage>(), 0x68);
const_assert_eq!(size_of::<HvX64ExceptionInterceptMessage>(), 0xf0);
const_assert_eq!(size_of::<HvX64InterruptionDeliverableMessage>(), 0x30);
