//! Process-wide id sequences, one per entity kind

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy)]
pub(crate) enum IdKind {
    Group,
    Automation,
    Trigger,
    Condition,
    Action,
    Runner,
    Scene,
}

static SEQUENCES: [AtomicU64; 7] = [const { AtomicU64::new(1) }; 7];

/// Next id for `kind`; strictly increasing for the life of the process
pub(crate) fn next_id(kind: IdKind) -> u64 {
    SEQUENCES[kind as usize].fetch_add(1, Ordering::Relaxed)
}
