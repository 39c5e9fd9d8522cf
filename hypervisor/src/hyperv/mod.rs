// Copyright © 2020, Microsoft Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

//! Hyper-V backend of the native execution manager.
//!
//! The partition talks to the hypervisor through the host's hypercall
//! and VP message slot interfaces; everything in here runs on the
//! emulation thread of the vCPU it operates on, except cancellation.

pub mod cancel;
pub mod history;
pub mod hypercall;
pub mod intercept;
pub mod pages;
pub mod regs;
pub mod run;
pub mod x86_64;
