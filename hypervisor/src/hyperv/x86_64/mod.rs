// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//
// Copyright © 2020, Microsoft Corporation
//
// Copyright 2018-2019 CrowdStrike, Inc.
//
//

//! Decoding helpers for the instruction bytes carried by intercept messages.

use crate::arch::x86::GuestCtx;

/// Port the VMware backdoor listens on.
pub const MESA_BACKDOOR_PORT: u16 = 0x5658;
/// Magic the backdoor expects in EAX ("VMXh").
pub const MESA_BACKDOOR_MAGIC: u64 = 0x564d_5868;

const OPCODE_IN_EAX_DX: u8 = 0xed;

fn is_legacy_prefix(byte: u8) -> bool {
    matches!(
        byte,
        0x26 | 0x2e | 0x36 | 0x3e | 0x64 | 0x65 | 0x66 | 0x67 | 0xf0 | 0xf2 | 0xf3
    )
}

fn is_rex_prefix(byte: u8) -> bool {
    byte & 0xf0 == 0x40
}

/// Returns true when `bytes` hold a VMCALL (`0f 01 c1`) or VMMCALL
/// (`0f 01 d9`), optionally preceded by legacy prefixes and, in long mode,
/// a REX prefix.
pub fn is_hypercall_instruction(bytes: &[u8], long_mode: bool) -> bool {
    let mut i = 0;
    while i < bytes.len() && is_legacy_prefix(bytes[i]) {
        i += 1;
    }
    // REX must come last, right before the opcode.
    if long_mode && i < bytes.len() && is_rex_prefix(bytes[i]) {
        i += 1;
    }
    matches!(bytes.get(i..i + 3), Some([0x0f, 0x01, 0xc1 | 0xd9]))
}

/// Matches the `IN EAX, DX` a Mesa guest driver issues against the VMware
/// backdoor from flat ring-3 code.
///
/// Needs RAX, RDX and CS to be local in `ctx`.
pub fn is_mesa_backdoor(ctx: &GuestCtx, cpl: u8, bytes: &[u8]) -> bool {
    ctx.rdx as u16 == MESA_BACKDOOR_PORT
        && ctx.rax == MESA_BACKDOOR_MAGIC
        && cpl == 3
        && ctx.cs.base == 0
        && bytes.first() == Some(&OPCODE_IN_EAX_DX)
}
