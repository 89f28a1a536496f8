use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

#[derive(Default)]
struct Slot {
    fired: Cell<bool>,
    waker: RefCell<Option<Waker>>,
}

/// A wait primitive where each [`Doorbell::ring`] resumes exactly one waiter,
/// in the order the waiters arrived.
///
/// Rings with nobody waiting are not remembered.
#[derive(Default)]
pub struct Doorbell {
    waiters: RefCell<VecDeque<Rc<Slot>>>,
}

impl Doorbell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resumes the oldest waiter. Returns whether there was one.
    pub fn ring(&self) -> bool {
        let Some(slot) = self.waiters.borrow_mut().pop_front() else {
            return false;
        };

        slot.fired.set(true);
        if let Some(waker) = slot.waker.borrow_mut().take() {
            waker.wake();
        }
        true
    }

    /// Number of suspended waiters.
    pub fn waiters(&self) -> usize {
        self.waiters.borrow().len()
    }

    pub fn async_wait(&self) -> DoorbellWait<'_> {
        DoorbellWait {
            doorbell: self,
            slot: None,
        }
    }
}

#[must_use = "futures do nothing unless polled"]
pub struct DoorbellWait<'a> {
    doorbell: &'a Doorbell,
    slot: Option<Rc<Slot>>,
}

impl Future for DoorbellWait<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let doorbell = self.doorbell;
        let slot = self.slot.get_or_insert_with(|| {
            let slot = Rc::new(Slot::default());
            doorbell.waiters.borrow_mut().push_back(slot.clone());
            slot
        });

        if slot.fired.get() {
            self.slot = None;
            return Poll::Ready(());
        }

        *slot.waker.borrow_mut() = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl Drop for DoorbellWait<'_> {
    fn drop(&mut self) {
        let Some(slot) = self.slot.take() else {
            return;
        };

        if slot.fired.get() {
            // Hand the signal to the next waiter.
            self.doorbell.ring();
        } else {
            self.doorbell
                .waiters
                .borrow_mut()
                .retain(|waiter| !Rc::ptr_eq(waiter, &slot));
        }
    }
}
