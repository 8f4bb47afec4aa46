// src/mutex.rs
//
// Cooperative mutex. Contention parks the task instead of blocking the
// whole worker: a waiter records itself in the mutex's FIFO queue and
// suspends; unlock notifies the next live waiter through its worker's
// injector (eventfd wakeup), and the woken task retries the acquire.
//
// Prefer session-scoped mutexes; a server-wide mutex serializes every
// worker and is a denial-of-service vector.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};

use crate::reactor;
use crate::task::TaskId;

const WAITING: u8 = 0;
const NOTIFIED: u8 = 1;
const CANCELLED: u8 = 2;

struct WaiterNode {
    state: AtomicU8,
    injector: Arc<reactor::Injector>,
    task: TaskId,
}

pub struct CoMutex<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
    waiters: StdMutex<VecDeque<Arc<WaiterNode>>>,
}

unsafe impl<T: Send> Send for CoMutex<T> {}
unsafe impl<T: Send> Sync for CoMutex<T> {}

impl<T> CoMutex<T> {
    pub fn new(value: T) -> Self {
        CoMutex {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
            waiters: StdMutex::new(VecDeque::new()),
        }
    }

    /// Acquire the lock, suspending the current task while contended.
    /// Must be called from within a worker task.
    pub fn lock(&self) -> LockFuture<'_, T> {
        LockFuture {
            mutex: self,
            node: None,
        }
    }

    pub fn try_lock(&self) -> Option<CoMutexGuard<'_, T>> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(CoMutexGuard { mutex: self })
        } else {
            None
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    fn unlock(&self) {
        // Release first, then notify: a waiter that enqueues between the
        // store and the pop will succeed on its own retry CAS, so no
        // wakeup is lost in either interleaving.
        self.locked.store(false, Ordering::Release);
        self.notify_one();
    }

    fn notify_one(&self) {
        loop {
            let next = self.waiters.lock().unwrap().pop_front();
            match next {
                Some(node) => {
                    if node
                        .state
                        .compare_exchange(WAITING, NOTIFIED, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        node.injector.wake(node.task);
                        return;
                    }
                    // Cancelled waiter; skip to the next one.
                }
                None => return,
            }
        }
    }
}

pub struct LockFuture<'a, T> {
    mutex: &'a CoMutex<T>,
    node: Option<Arc<WaiterNode>>,
}

impl<'a, T> Future for LockFuture<'a, T> {
    type Output = CoMutexGuard<'a, T>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let me = &mut *self;

        if let Some(node) = &me.node {
            // Consume the notification (if any) before retrying, so a
            // failed retry re-enqueues cleanly.
            if node.state.load(Ordering::SeqCst) == WAITING {
                return Poll::Pending;
            }
        }

        if me
            .mutex
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            me.node = None;
            return Poll::Ready(CoMutexGuard { mutex: me.mutex });
        }

        // Contended: (re-)enqueue and suspend. The retry CAS below covers
        // the unlock that may have slipped in between.
        let (injector, task) = reactor::current_wake_handle();
        let node = Arc::new(WaiterNode {
            state: AtomicU8::new(WAITING),
            injector,
            task,
        });
        me.mutex.waiters.lock().unwrap().push_back(node.clone());

        if me
            .mutex
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            node.state.store(CANCELLED, Ordering::SeqCst);
            me.node = None;
            return Poll::Ready(CoMutexGuard { mutex: me.mutex });
        }

        me.node = Some(node);
        Poll::Pending
    }
}

impl<T> Drop for LockFuture<'_, T> {
    fn drop(&mut self) {
        if let Some(node) = self.node.take() {
            if node
                .state
                .compare_exchange(WAITING, CANCELLED, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                // Notified but never polled again: pass the notification
                // on so the next waiter is not stranded.
                self.mutex.notify_one();
            }
        }
    }
}

pub struct CoMutexGuard<'a, T> {
    mutex: &'a CoMutex<T>,
}

impl<T> Deref for CoMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for CoMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for CoMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_lock() {
        let m = CoMutex::new(1);
        let g = m.try_lock().unwrap();
        assert!(m.try_lock().is_none());
        drop(g);
        assert!(m.try_lock().is_some());
    }

    #[test]
    fn test_guard_gives_access() {
        let m = CoMutex::new(41);
        {
            let mut g = m.try_lock().unwrap();
            *g += 1;
        }
        assert_eq!(*m.try_lock().unwrap(), 42);
    }

    #[test]
    fn test_into_inner() {
        let m = CoMutex::new(7);
        assert_eq!(m.into_inner(), 7);
    }
}
