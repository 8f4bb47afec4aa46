// src/task.rs
//
// The unit of cooperative scheduling: a resumable computation stored as a
// pinned future, exclusively owned by one worker. Slots are recycled
// through an intrusive free list so spawning never reallocates.

use std::future::Future;
use std::pin::Pin;

pub type TaskId = u32;

pub type TaskFuture = Pin<Box<dyn Future<Output = ()> + 'static>>;

enum Slot {
    /// Free; carries the next free index (-1 terminates the list).
    Vacant(i32),
    /// Parked or runnable; the future sits here between polls.
    Stored(TaskFuture),
    /// Temporarily taken out for polling.
    Polling,
}

pub struct TaskSlab {
    slots: Vec<Slot>,
    head_free: i32,
    live: usize,
}

impl TaskSlab {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        for i in 0..capacity {
            let next = if i == capacity - 1 { -1 } else { (i + 1) as i32 };
            slots.push(Slot::Vacant(next));
        }
        TaskSlab {
            slots,
            head_free: if capacity == 0 { -1 } else { 0 },
            live: 0,
        }
    }

    /// O(1) insert. Returns None when the slab is full.
    pub fn spawn(&mut self, fut: TaskFuture) -> Option<TaskId> {
        if self.head_free < 0 {
            return None;
        }
        let idx = self.head_free as usize;
        match self.slots[idx] {
            Slot::Vacant(next) => self.head_free = next,
            _ => unreachable!("free list points at an occupied slot"),
        }
        self.slots[idx] = Slot::Stored(fut);
        self.live += 1;
        Some(idx as TaskId)
    }

    /// Take the future out for polling. None for vacant or already-taken
    /// slots (stale ready-queue entries resolve here).
    pub fn take(&mut self, id: TaskId) -> Option<TaskFuture> {
        let idx = id as usize;
        if idx >= self.slots.len() {
            return None;
        }
        match std::mem::replace(&mut self.slots[idx], Slot::Polling) {
            Slot::Stored(fut) => Some(fut),
            other => {
                self.slots[idx] = other;
                None
            }
        }
    }

    /// Put a pending future back after polling.
    pub fn park(&mut self, id: TaskId, fut: TaskFuture) {
        debug_assert!(matches!(self.slots[id as usize], Slot::Polling));
        self.slots[id as usize] = Slot::Stored(fut);
    }

    /// Release a finished slot back to the free list.
    pub fn finish(&mut self, id: TaskId) {
        let idx = id as usize;
        debug_assert!(matches!(self.slots[idx], Slot::Polling));
        self.slots[idx] = Slot::Vacant(self.head_free);
        self.head_free = idx as i32;
        self.live -= 1;
    }

    pub fn is_live(&self, id: TaskId) -> bool {
        matches!(
            self.slots.get(id as usize),
            Some(Slot::Stored(_)) | Some(Slot::Polling)
        )
    }

    pub fn live(&self) -> usize {
        self.live
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}
