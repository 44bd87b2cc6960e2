// Long-term locks for processes. Unlike a spin lock, a sleep lock may be
// held across blocking disk I/O; waiters give up the CPU instead of
// spinning.

use crate::proc::{CPUS, PROCS};
use crate::spinlock::Mutex;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

pub struct SleepLock<T> {
    lk: Mutex<SleepLockInfo>, // spinlock protecting this sleep lock
    data: UnsafeCell<T>,
    name: &'static str,
}

unsafe impl<T: Send> Sync for SleepLock<T> {}
unsafe impl<T: Send> Send for SleepLock<T> {}

struct SleepLockInfo {
    locked: bool,
    pid: usize, // holder, for debugging
}

pub struct SleepLockGuard<'a, T> {
    sleep_lock: &'a SleepLock<T>,
}

impl<T> SleepLock<T> {
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            lk: Mutex::new(SleepLockInfo { locked: false, pid: 0 }, "sleep lock"),
            data: UnsafeCell::new(data),
            name,
        }
    }

    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        let p = CPUS.my_proc().unwrap();
        let mut lk = self.lk.lock();
        while lk.locked {
            lk = p.sleep(self as *const _ as usize, lk);
        }
        lk.locked = true;
        lk.pid = p.pid();
        SleepLockGuard { sleep_lock: self }
    }

    pub fn holding(&self) -> bool {
        let lk = self.lk.lock();
        lk.locked && lk.pid == CPUS.my_proc().unwrap().pid()
    }

    // Consume the guard, returning the lock, for relock loops.
    pub fn unlock(guard: SleepLockGuard<'_, T>) -> &'_ SleepLock<T> {
        guard.sleep_lock()
    }

    // Reach the payload without taking the lock.
    //
    // # Safety
    // The caller must know no one can hold or acquire this lock, e.g.
    // the inode table claiming a slot whose reference count is zero.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut(&self) -> &mut T {
        &mut *self.data.get()
    }
}

impl<'a, T: 'a> SleepLockGuard<'a, T> {
    pub fn sleep_lock(&self) -> &'a SleepLock<T> {
        self.sleep_lock
    }
}

impl<'a, T: 'a> Deref for SleepLockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        unsafe { &*self.sleep_lock.data.get() }
    }
}

impl<'a, T: 'a> DerefMut for SleepLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.sleep_lock.data.get() }
    }
}

impl<'a, T: 'a> Drop for SleepLockGuard<'a, T> {
    fn drop(&mut self) {
        assert!(self.sleep_lock.holding(), "release {}", self.sleep_lock.name);
        let mut lk = self.sleep_lock.lk.lock();
        lk.locked = false;
        lk.pid = 0;
        PROCS.wakeup(self.sleep_lock as *const _ as usize);
    }
}
