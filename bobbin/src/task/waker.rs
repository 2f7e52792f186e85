use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    task::{RawWaker, RawWakerVTable, Waker},
};

/// Shared between a coroutine and the wakers handed to the futures it polls.
/// `woken` records that something asked for the coroutine to be polled again
#[derive(Debug, Default)]
pub(crate) struct StepHeader {
    pub(crate) woken: AtomicBool,
}

impl StepHeader {
    pub(crate) fn take_woken(&self) -> bool {
        self.woken.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn reset(&self) {
        self.woken.store(false, Ordering::SeqCst);
    }
}

pub(crate) struct StepWaker;

impl StepWaker {
    const VTABLE: RawWakerVTable =
        RawWakerVTable::new(Self::clone, Self::wake, Self::wake_by_ref, Self::drop);

    unsafe fn clone(raw_waker: *const ()) -> RawWaker {
        // SAFETY: every raw waker built here owns one strong count of the header
        unsafe { Arc::increment_strong_count(raw_waker as *const StepHeader) };
        RawWaker::new(raw_waker, &Self::VTABLE)
    }

    unsafe fn wake(raw_waker: *const ()) {
        // SAFETY: consumes the strong count owned by this waker
        let header = unsafe { Arc::from_raw(raw_waker as *const StepHeader) };
        Self::mark(&header);
    }

    unsafe fn wake_by_ref(raw_waker: *const ()) {
        // SAFETY: the waker holds a strong count for as long as it is borrowed
        Self::mark(unsafe { &*(raw_waker as *const StepHeader) });
    }

    unsafe fn drop(raw_waker: *const ()) {
        // SAFETY: releases the strong count owned by this waker
        drop(unsafe { Arc::from_raw(raw_waker as *const StepHeader) });
    }

    #[inline]
    fn mark(header: &StepHeader) {
        header.woken.store(true, Ordering::SeqCst);
    }

    pub(crate) fn new_waker(header: &Arc<StepHeader>) -> Waker {
        let raw = Arc::into_raw(header.clone()) as *const ();
        // SAFETY: the vtable functions above uphold the RawWaker contract for
        // pointers produced by Arc::into_raw on a StepHeader
        unsafe { Waker::from_raw(RawWaker::new(raw, &Self::VTABLE)) }
    }
}
