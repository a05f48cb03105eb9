//! FIFO wait queue for connection acquisition.
//!
//! The queue only orders and settles requests; it holds no connections. The
//! pool drives it from a periodic run loop that attempts the head member once
//! per tick, and from per-member timeout timers. Both run under the pool's
//! lock, which is what makes "finished at most once" hold.

use std::collections::VecDeque;

use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::address::ServerAddress;
use crate::error::PoolError;

/// Final result delivered to a waiting acquisition.
pub(crate) type Settlement<T> = Result<T, PoolError>;

struct WaitQueueMember<T> {
    id: u64,
    /// `None` once finished.
    settle: Option<oneshot::Sender<Settlement<T>>>,
    timer: Option<AbortHandle>,
}

impl<T> WaitQueueMember<T> {
    /// A member whose waiter went away is as good as finished.
    fn is_finished(&self) -> bool {
        self.settle.as_ref().is_none_or(|tx| tx.is_closed())
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    /// Settle the member. Hands the result back if nobody is listening.
    fn finish(&mut self, result: Settlement<T>) -> Result<(), Settlement<T>> {
        self.cancel_timer();
        match self.settle.take() {
            Some(tx) => tx.send(result),
            None => Err(result),
        }
    }
}

/// A successful [`WaitQueue::enter`].
pub(crate) struct Admission<T> {
    pub(crate) member_id: u64,
    pub(crate) receiver: oneshot::Receiver<Settlement<T>>,
    /// The run loop is not running and must be started by the caller.
    pub(crate) start_run_loop: bool,
}

/// Outcome of one run loop tick.
#[derive(Debug)]
pub(crate) enum Tick<T> {
    /// The queue is empty or destroyed; the loop must exit.
    Stopped,
    /// The head member could not be satisfied and stays first in line.
    Requeued,
    /// The head member was already finished and was dropped.
    Discarded,
    /// The head member received a resource.
    Served,
    /// The resource was produced but its waiter had gone away.
    Unclaimed(T),
}

pub(crate) struct WaitQueue<T> {
    members: VecDeque<WaitQueueMember<T>>,
    max_size: usize,
    destroyed: bool,
    running: bool,
    next_member_id: u64,
    pool_id: u32,
    address: ServerAddress,
}

impl<T> WaitQueue<T> {
    /// `max_size == 0` means unbounded.
    pub(crate) fn new(max_size: usize, pool_id: u32, address: ServerAddress) -> Self {
        Self {
            members: VecDeque::new(),
            max_size,
            destroyed: false,
            running: false,
            next_member_id: 0,
            pool_id,
            address,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.members.len()
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running
    }

    /// Record that the run loop task is gone.
    pub(crate) fn mark_stopped(&mut self) {
        self.running = false;
    }

    fn closed_error(&self) -> PoolError {
        PoolError::PoolClosed {
            pool_id: self.pool_id,
            address: self.address.clone(),
        }
    }

    /// Admit a new request at the tail.
    pub(crate) fn enter(&mut self) -> Result<Admission<T>, PoolError> {
        if self.max_size > 0 && self.members.len() >= self.max_size && !self.destroyed {
            return Err(PoolError::WaitQueueFull {
                pool_id: self.pool_id,
                address: self.address.clone(),
            });
        }
        self.admit(false)
    }

    /// Readmit a request that was already served once at the head.
    ///
    /// The request held a slot before, so the size limit does not apply.
    pub(crate) fn enter_front(&mut self) -> Result<Admission<T>, PoolError> {
        self.admit(true)
    }

    fn admit(&mut self, front: bool) -> Result<Admission<T>, PoolError> {
        if self.destroyed {
            return Err(self.closed_error());
        }

        let (tx, rx) = oneshot::channel();
        self.next_member_id += 1;
        let member_id = self.next_member_id;
        let member = WaitQueueMember {
            id: member_id,
            settle: Some(tx),
            timer: None,
        };
        if front {
            self.members.push_front(member);
        } else {
            self.members.push_back(member);
        }

        let start_run_loop = !self.running;
        self.running = true;

        Ok(Admission {
            member_id,
            receiver: rx,
            start_run_loop,
        })
    }

    /// Attach a timeout timer to a member.
    pub(crate) fn arm_timer(&mut self, member_id: u64, timer: AbortHandle) {
        match self.members.iter_mut().find(|m| m.id == member_id) {
            Some(member) => member.timer = Some(timer),
            // Already settled; the timer has nothing left to do.
            None => timer.abort(),
        }
    }

    /// Fail a member with a timeout if it is still waiting.
    ///
    /// Returns whether the member was still queued.
    pub(crate) fn expire(&mut self, member_id: u64) -> bool {
        let Some(index) = self.members.iter().position(|m| m.id == member_id) else {
            return false;
        };
        let Some(mut member) = self.members.remove(index) else {
            return false;
        };
        // The timer is the task running this; don't abort ourselves.
        member.timer = None;
        let _ = member.finish(Err(PoolError::WaitQueueTimeout {
            pool_id: self.pool_id,
            address: self.address.clone(),
        }));
        true
    }

    /// Fail every member with `PoolClosed` and refuse new ones.
    pub(crate) fn destroy(&mut self) {
        self.destroyed = true;
        self.drain();
    }

    fn drain(&mut self) {
        while let Some(mut member) = self.members.pop_front() {
            let err = self.closed_error();
            let _ = member.finish(Err(err));
        }
    }

    /// Process the head member once.
    ///
    /// `acquire` is only invoked for a head member that is still waiting.
    pub(crate) fn run_once<F>(&mut self, acquire: F) -> Tick<T>
    where
        F: FnOnce() -> Option<T>,
    {
        if self.destroyed {
            self.drain();
            self.running = false;
            return Tick::Stopped;
        }

        let Some(mut head) = self.members.pop_front() else {
            self.running = false;
            return Tick::Stopped;
        };

        if head.is_finished() {
            head.cancel_timer();
            return Tick::Discarded;
        }

        match acquire() {
            Some(resource) => match head.finish(Ok(resource)) {
                Ok(()) => Tick::Served,
                Err(Ok(resource)) => Tick::Unclaimed(resource),
                Err(Err(_)) => Tick::Served,
            },
            None => {
                self.members.push_front(head);
                Tick::Requeued
            }
        }
    }
}

impl<T> Drop for WaitQueue<T> {
    fn drop(&mut self) {
        for member in &mut self.members {
            member.cancel_timer();
        }
    }
}
