//
// Copyright © 2020 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

// EFER (technically not a register) bits
pub const EFER_LME: u64 = 0x100;
pub const EFER_LMA: u64 = 0x400;
pub const EFER_NXE: u64 = 0x800;

// CR0 bits
pub const CR0_PE: u64 = 0x1;
pub const CR0_PG: u64 = 0x80000000;

// RFlags bits
pub const TF_SHIFT: usize = 8;
pub const IF_SHIFT: usize = 9;
pub const RF_SHIFT: usize = 16;

pub const TF: u64 = 1 << TF_SHIFT;
pub const IF: u64 = 1 << IF_SHIFT;
pub const RF: u64 = 1 << RF_SHIFT;

/// Bit 1 of RFLAGS always reads as one.
pub const RFLAGS_RA1: u64 = 0x2;

// DR7 bits
pub const DR7_RA1: u64 = 0x400;
