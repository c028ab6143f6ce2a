//! `Waker` construction for `Rc`-backed wakeup targets.
//!
//! `std::task::Waker` requires a `Send + Sync` vtable underneath, which an
//! `Rc` cannot provide directly. Every suspension point in this crate
//! (fibers, timers, channels, flows) wakes a single-threaded `Rc`-owned
//! target, so we build one small vtable once and reuse it everywhere
//! instead of re-deriving the unsafe construction at each call site.

use std::rc::Rc;
use std::task::{RawWaker, RawWakerVTable, Waker};

/// Implemented by anything that can be driven by being woken: a fiber's
/// scheduler-queue handle, a parked sender/receiver, a flow collector.
pub trait RcWake {
    fn wake_by_ref(self: &Rc<Self>);

    fn wake(self: Rc<Self>) {
        Self::wake_by_ref(&self)
    }

    /// Builds a `std::task::Waker` that calls back into this value when
    /// woken. The returned waker holds a strong reference for as long as
    /// it (or any of its clones) is alive.
    fn into_waker(self: Rc<Self>) -> Waker {
        let raw = Rc::into_raw(self) as *const ();
        unsafe { Waker::from_raw(RawWaker::new(raw, vtable::<Self>())) }
    }
}

fn vtable<T: RcWake>() -> &'static RawWakerVTable {
    &RawWakerVTable::new(clone::<T>, wake::<T>, wake_by_ref::<T>, drop::<T>)
}

unsafe fn clone<T: RcWake>(ptr: *const ()) -> RawWaker {
    let rc = Rc::from_raw(ptr as *const T);
    std::mem::forget(Rc::clone(&rc));
    std::mem::forget(rc);
    RawWaker::new(ptr, vtable::<T>())
}

unsafe fn wake<T: RcWake>(ptr: *const ()) {
    let rc = Rc::from_raw(ptr as *const T);
    RcWake::wake(rc);
}

unsafe fn wake_by_ref<T: RcWake>(ptr: *const ()) {
    let rc = Rc::from_raw(ptr as *const T);
    RcWake::wake_by_ref(&rc);
    std::mem::forget(rc);
}

unsafe fn drop<T: RcWake>(ptr: *const ()) {
    std::mem::drop(Rc::from_raw(ptr as *const T));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct Flag(Cell<bool>);

    impl RcWake for Flag {
        fn wake_by_ref(self: &Rc<Self>) {
            self.0.set(true);
        }
    }

    #[test]
    fn waking_invokes_wake_by_ref() {
        let flag = Rc::new(Flag(Cell::new(false)));
        let waker = flag.clone().into_waker();
        assert!(!flag.0.get());
        waker.wake_by_ref();
        assert!(flag.0.get());
    }

    #[test]
    fn clone_keeps_target_alive_independently() {
        let flag = Rc::new(Flag(Cell::new(false)));
        let waker = flag.clone().into_waker();
        let cloned = waker.clone();
        drop(waker);
        cloned.wake();
        assert!(flag.0.get());
    }
}
