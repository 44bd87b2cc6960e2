// Mutual exclusion spin locks.
//
// Interrupts are disabled for as long as any spin lock is held, via the
// per-hart nesting counter in Cpu (see proc.rs). The IntrLock member of
// the guard keeps the count raised until the guard drops.

use crate::proc::{Cpus, IntrLock, CPUS};
use core::cell::{Cell, UnsafeCell};
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

pub struct Mutex<T: ?Sized> {
    locked: AtomicBool,
    name: &'static str,
    hart: Cell<isize>, // hart holding the lock, -1 if none
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}

pub struct MutexGuard<'a, T: ?Sized + 'a> {
    mutex: &'a Mutex<T>,
    _intr_lock: IntrLock,
}

impl<T> Mutex<T> {
    pub const fn new(value: T, name: &'static str) -> Self {
        Self {
            locked: AtomicBool::new(false),
            name,
            hart: Cell::new(-1),
            data: UnsafeCell::new(value),
        }
    }
}

impl<T: ?Sized> Mutex<T> {
    pub fn lock(&self) -> MutexGuard<'_, T> {
        let _intr_lock = CPUS.intr_lock(); // disable interrupts first
        assert!(!self.holding(), "acquire {}", self.name);
        while self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spin_loop();
        }
        self.hart.set(unsafe { Cpus::cpu_id() } as isize);
        MutexGuard {
            mutex: self,
            _intr_lock,
        }
    }

    // Check whether this hart holds the lock.
    // Interrupts must be off.
    pub fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed) && self.hart.get() == unsafe { Cpus::cpu_id() } as isize
    }

    // Release a lock that was handed across a context switch without its
    // guard (the scheduler acquires, the switched-to process releases).
    //
    // # Safety
    // The caller must actually hold the lock.
    pub unsafe fn force_unlock(&self) {
        assert!(self.holding(), "force_unlock {}", self.name);
        self.hart.set(-1);
        self.locked.store(false, Ordering::Release);
        CPUS.intr_unlock();
    }

    // Bypass the lock. Only for the panic path, where the printing hart
    // must not wedge on a console lock some other hart froze with.
    //
    // # Safety
    // No exclusion; the caller accepts torn state.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut(&self) -> &mut T {
        &mut *self.data.get()
    }

    // Consume the guard, returning a reference to the underlying Mutex.
    // Makes `guard = mutex.lock(); ...; mutex = Mutex::unlock(guard)`
    // loops expressible.
    pub fn unlock(guard: MutexGuard<'_, T>) -> &'_ Mutex<T> {
        guard.mutex()
    }
}

impl<'a, T: ?Sized> MutexGuard<'a, T> {
    pub fn mutex(&self) -> &'a Mutex<T> {
        self.mutex
    }

    pub fn holding(&self) -> bool {
        self.mutex.holding()
    }
}

impl<'a, T: ?Sized> Deref for MutexGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<'a, T: ?Sized> DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<'a, T: ?Sized> Drop for MutexGuard<'a, T> {
    fn drop(&mut self) {
        assert!(self.holding(), "release {}", self.mutex.name);
        self.mutex.hart.set(-1);
        self.mutex.locked.store(false, Ordering::Release);
        // _intr_lock drops after this body, re-enabling interrupts
        // once the hart's outermost lock is gone.
    }
}
