// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//
// Copyright © 2020, Microsoft Corporation
//

use serde::{Deserialize, Serialize};

pub mod ctx;
pub mod regs;

pub use ctx::{EventKind, ExternMask, FpuState, GuestCtx, MsrState, PendingEvent};

// X86 Exceptions
#[allow(dead_code, clippy::upper_case_acronyms)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Exception {
    DE = 0,  // Divide Error
    DB = 1,  // Debug Exception
    NMI = 2, // Non-Maskable Interrupt
    BP = 3,  // Breakpoint
    OF = 4,  // Overflow
    BR = 5,  // BOUND Range Exceeded
    UD = 6,  // Invalid/Undefined Opcode
    NM = 7,  // No Math Coprocessor
    DF = 8,  // Double Fault
    TS = 10, // Invalid TSS
    NP = 11, // Segment Not Present
    SS = 12, // Stack Segment Fault
    GP = 13, // General Protection
    PF = 14, // Page Fault
    MF = 16, // Math Fault
    AC = 17, // Alignment Check
    MC = 18, // Machine Check
    XM = 19, // SIMD Floating-Point Exception
    VE = 20, // Virtualization Exception
    CP = 21, // Control Protection Exception
}

impl Exception {
    pub fn vector(self) -> u8 {
        self as u8
    }
}

// Abstracted segment register ops.
pub trait SegmentRegisterOps {
    // Segment type
    fn segment_type(&self) -> u8;
    fn set_segment_type(&mut self, val: u8);

    // Descriptor Privilege Level (DPL)
    fn dpl(&self) -> u8;

    // Memory Presence
    fn present(&self) -> u8;

    // Long mode
    fn long(&self) -> u8;

    // Descriptor type (System or code/data)
    fn desc_type(&self) -> u8;

    // D/B
    fn db(&self) -> u8;
}

// System segment types
pub const SYS_286_TSS_AVAIL: u8 = 0x1;
pub const SYS_286_TSS_BUSY: u8 = 0x3;
pub const SYS_386_TSS_AVAIL: u8 = 0x9;
pub const SYS_386_TSS_BUSY: u8 = 0xb;

// Code segment
pub const CODE_SEGMENT_TYPE: u8 = 0x8;

pub fn segment_type_code(t: u8) -> bool {
    t & CODE_SEGMENT_TYPE != 0
}

/// Guest segment register.
///
/// `attributes` uses the packed descriptor layout: type in bits 0-3, S in
/// bit 4, DPL in bits 5-6, P in bit 7, AVL in bit 12, L in bit 13, D/B in
/// bit 14 and G in bit 15.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentRegister {
    pub selector: u16,
    pub base: u64,
    pub limit: u32,
    pub attributes: u16,
}

impl SegmentRegister {
    /// Flat code segment as found after reset in real mode.
    pub fn flat(selector: u16, attributes: u16) -> Self {
        SegmentRegister {
            selector,
            base: (selector as u64) << 4,
            limit: 0xffff,
            attributes,
        }
    }

    /// The TSS referenced by TR must be flagged busy in the descriptor.
    pub fn with_tss_busy(mut self) -> Self {
        match self.segment_type() {
            SYS_386_TSS_AVAIL => self.set_segment_type(SYS_386_TSS_BUSY),
            SYS_286_TSS_AVAIL => self.set_segment_type(SYS_286_TSS_BUSY),
            _ => {}
        }
        self
    }
}

impl SegmentRegisterOps for SegmentRegister {
    fn segment_type(&self) -> u8 {
        (self.attributes & 0xf) as u8
    }
    fn set_segment_type(&mut self, val: u8) {
        self.attributes = (self.attributes & !0xf) | (val as u16 & 0xf);
    }

    fn dpl(&self) -> u8 {
        ((self.attributes >> 5) & 0x3) as u8
    }

    fn present(&self) -> u8 {
        ((self.attributes >> 7) & 0x1) as u8
    }

    fn long(&self) -> u8 {
        ((self.attributes >> 13) & 0x1) as u8
    }

    fn desc_type(&self) -> u8 {
        ((self.attributes >> 4) & 0x1) as u8
    }

    fn db(&self) -> u8 {
        ((self.attributes >> 14) & 0x1) as u8
    }
}

/// GDTR/IDTR.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRegister {
    pub base: u64,
    pub limit: u16,
}
