// Copyright © 2020, Microsoft Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

use crate::config::ExitHistoryConfig;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::num::Wrapping;
use std::sync::atomic::{AtomicU64, Ordering};

/// Classification of an intercept for the exit history.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExitKind {
    MemoryUnmapped,
    MemoryIntercept,
    IoPortRead,
    IoPortWrite,
    IoPortString,
    Cpuid,
    MsrRead,
    MsrWrite,
    Exception(u8),
    InterruptWindow,
    Halt,
    Unrecoverable,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExitRecord {
    pub kind: ExitKind,
    /// Flat CS:RIP of the exiting instruction.
    pub pc: u64,
    /// Host TSC when the exit was recorded.
    pub timestamp: u64,
}

/// Ring of the most recent exits of one vCPU.
///
/// Counts exits per (kind, pc) over the ring so repeated exits at the same
/// instruction can be sent down the emulator's full state path.
#[derive(Debug)]
pub struct ExitHistory {
    enabled: bool,
    size: usize,
    hot_threshold: u32,
    records: VecDeque<ExitRecord>,
    counts: HashMap<(ExitKind, u64), u32>,
}

impl ExitHistory {
    pub fn new(config: &ExitHistoryConfig) -> Self {
        ExitHistory {
            enabled: config.enabled,
            size: config.size,
            hot_threshold: config.hot_threshold,
            records: VecDeque::with_capacity(if config.enabled { config.size } else { 0 }),
            counts: HashMap::new(),
        }
    }

    /// Records an exit and returns true if it is hot.
    pub fn add_exit(&mut self, kind: ExitKind, pc: u64, timestamp: u64) -> bool {
        if !self.enabled || self.size == 0 {
            return false;
        }

        if self.records.len() == self.size {
            if let Some(old) = self.records.pop_front() {
                let key = (old.kind, old.pc);
                if let Some(count) = self.counts.get_mut(&key) {
                    *count -= 1;
                    if *count == 0 {
                        self.counts.remove(&key);
                    }
                }
            }
        }

        self.records.push_back(ExitRecord {
            kind,
            pc,
            timestamp,
        });
        let count = self.counts.entry((kind, pc)).or_insert(0);
        *count += 1;
        *count >= self.hot_threshold
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn last(&self) -> Option<&ExitRecord> {
        self.records.back()
    }
}

macro_rules! nem_stats {
    (
        $(#[$attr:meta])*
        $name:ident, $snapshot:ident {
            $($field:ident,)*
        }
    ) => {
        $(#[$attr])*
        #[derive(Debug, Default)]
        pub struct $name {
            $(pub $field: AtomicU64,)*
        }

        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
        pub struct $snapshot {
            $(pub $field: u64,)*
        }

        impl $name {
            pub fn snapshot(&self) -> $snapshot {
                $snapshot {
                    $($field: self.$field.load(Ordering::Acquire),)*
                }
            }

            pub fn counters(&self) -> HashMap<&'static str, Wrapping<u64>> {
                let mut counters = HashMap::new();
                $(
                    counters.insert(
                        stringify!($field),
                        Wrapping(self.$field.load(Ordering::Acquire)),
                    );
                )*
                counters
            }
        }
    };
}

nem_stats!(
    /// Per vCPU exit and run loop counters.
    ExitStats, ExitStatsSnapshot {
        exit_memory_unmapped,
        exit_memory_intercept,
        exit_port_io,
        exit_cpuid,
        exit_msr,
        exit_exception,
        exit_interrupt_window,
        exit_halt,
        exit_unrecoverable,
        exit_hot,
        cancel_changed_state,
        cancel_alerted,
        stop_cpu_success,
        stop_cpu_pending,
        stop_cpu_pending_odd,
        injected_interrupts,
        injected_nmis,
        window_requests,
        break_on_ff,
        break_on_status,
        break_on_cancel,
    }
);

nem_stats!(
    /// Partition wide second level mapping counters.
    PageStats, PageStatsSnapshot {
        map_page,
        unmap_page,
        map_page_failed,
        unmap_page_failed,
        unmap_all_pages,
    }
);

/// Bumps a statistics counter.
pub(crate) fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}
