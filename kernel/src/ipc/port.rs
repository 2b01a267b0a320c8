//! Ports: bounded FIFO message queues with blocking endpoints
//!
//! A port holds a bounded queue of envelopes, a FIFO of tasks blocked in
//! receive, and a FIFO of tasks blocked in send (queue full). One
//! receiver is woken per send. Destroying a port wakes everyone with
//! `PortClosed`.
//!
//! Without a running scheduler (early boot, host tests) both operations
//! degrade to their non-blocking variants.

use alloc::{collections::VecDeque, vec::Vec};

use spin::Mutex;

use super::message::Message;
use crate::{
    error::{KernelError, KernelResult},
    sched::{self, task::TaskRef},
};

/// Default bound of a port's message queue
pub const DEFAULT_CAPACITY: usize = 32;

bitflags::bitflags! {
    /// Flags for `send`/`recv`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IpcFlags: u32 {
        /// Fail with `QueueFull`/`WouldBlock` instead of blocking
        const NONBLOCK = 1 << 0;
    }
}

struct PortInner {
    queue: VecDeque<Message>,
    capacity: usize,
    /// Tasks blocked in `recv`, oldest first
    receivers: Vec<TaskRef>,
    /// Tasks blocked in `send`, oldest first
    senders: Vec<TaskRef>,
    closed: bool,
}

/// A kernel message port
pub struct Port {
    pub id: u32,
    inner: Mutex<PortInner>,
}

impl core::fmt::Debug for Port {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Port").field("id", &self.id).finish()
    }
}

impl Port {
    pub fn new(id: u32, capacity: usize) -> Self {
        Self {
            id,
            inner: Mutex::new(PortInner {
                queue: VecDeque::new(),
                capacity: capacity.max(1),
                receivers: Vec::new(),
                senders: Vec::new(),
                closed: false,
            }),
        }
    }

    /// Enqueue a message, blocking while the queue is full. At most one
    /// receiver is woken per message.
    pub fn send(&self, msg: Message, flags: IpcFlags) -> KernelResult<()> {
        loop {
            let woken = {
                let mut inner = self.inner.lock();
                if inner.closed {
                    return Err(KernelError::PortClosed);
                }
                if inner.queue.len() < inner.capacity {
                    inner.queue.push_back(msg);
                    if inner.receivers.is_empty() {
                        None
                    } else {
                        Some(inner.receivers.remove(0))
                    }
                } else {
                    let Some(task) = sched::current_task() else {
                        return Err(KernelError::QueueFull);
                    };
                    if flags.contains(IpcFlags::NONBLOCK) {
                        return Err(KernelError::QueueFull);
                    }
                    inner.senders.push(task);
                    // Fall through to block outside the lock.
                    drop(inner);
                    sched::block();
                    continue;
                }
            };
            if let Some(task) = woken {
                sched::unblock(&task);
            }
            return Ok(());
        }
    }

    /// Dequeue a message, blocking while the queue is empty. Frees one
    /// blocked sender slot per message taken.
    pub fn recv(&self, flags: IpcFlags) -> KernelResult<Message> {
        loop {
            let (msg, woken) = {
                let mut inner = self.inner.lock();
                match inner.queue.pop_front() {
                    Some(msg) => {
                        let woken = if inner.senders.is_empty() {
                            None
                        } else {
                            Some(inner.senders.remove(0))
                        };
                        (msg, woken)
                    }
                    None => {
                        if inner.closed {
                            return Err(KernelError::PortClosed);
                        }
                        let Some(task) = sched::current_task() else {
                            return Err(KernelError::WouldBlock);
                        };
                        if flags.contains(IpcFlags::NONBLOCK) {
                            return Err(KernelError::WouldBlock);
                        }
                        inner.receivers.push(task);
                        drop(inner);
                        sched::block();
                        continue;
                    }
                }
            };
            if let Some(task) = woken {
                sched::unblock(&task);
            }
            return Ok(msg);
        }
    }

    /// Close the port and wake every blocked task; they observe
    /// `PortClosed` on their recheck.
    pub fn close(&self) {
        let waiters = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            let mut all = core::mem::take(&mut inner.receivers);
            all.append(&mut inner.senders);
            all
        };
        for task in &waiters {
            sched::unblock(task);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Messages currently queued (diagnostics).
    pub fn depth(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Tasks blocked in receive (diagnostics).
    pub fn receiver_count(&self) -> usize {
        self.inner.lock().receivers.len()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn msg(tag: u8) -> Message {
        Message::new(1, 0, &[tag], 0)
    }

    #[test]
    fn fifo_order_across_sends() {
        let port = Port::new(1, 8);
        port.send(msg(1), IpcFlags::empty()).unwrap();
        port.send(msg(2), IpcFlags::empty()).unwrap();
        port.send(msg(3), IpcFlags::empty()).unwrap();
        assert_eq!(port.depth(), 3);

        assert_eq!(port.recv(IpcFlags::empty()).unwrap().data(), &[1]);
        assert_eq!(port.recv(IpcFlags::empty()).unwrap().data(), &[2]);
        assert_eq!(port.recv(IpcFlags::empty()).unwrap().data(), &[3]);
    }

    #[test]
    fn empty_recv_would_block() {
        let port = Port::new(2, 8);
        assert_eq!(
            port.recv(IpcFlags::NONBLOCK).unwrap_err(),
            KernelError::WouldBlock
        );
    }

    #[test]
    fn full_queue_reports_queue_full() {
        let port = Port::new(3, 2);
        port.send(msg(1), IpcFlags::NONBLOCK).unwrap();
        port.send(msg(2), IpcFlags::NONBLOCK).unwrap();
        assert_eq!(
            port.send(msg(3), IpcFlags::NONBLOCK).unwrap_err(),
            KernelError::QueueFull
        );
        // Draining one slot makes room again.
        let _ = port.recv(IpcFlags::empty()).unwrap();
        port.send(msg(3), IpcFlags::NONBLOCK).unwrap();
    }

    #[test]
    fn closed_port_refuses_traffic() {
        let port = Port::new(4, 8);
        port.send(msg(1), IpcFlags::empty()).unwrap();
        port.close();

        assert_eq!(
            port.send(msg(2), IpcFlags::empty()).unwrap_err(),
            KernelError::PortClosed
        );
        // Queued messages drain first; then the closure shows through.
        assert_eq!(port.recv(IpcFlags::empty()).unwrap().data(), &[1]);
        assert_eq!(
            port.recv(IpcFlags::empty()).unwrap_err(),
            KernelError::PortClosed
        );
    }

    #[test]
    fn close_wakes_blocked_receivers() {
        use crate::sched::{task::testutil::dummy_task, TaskState};

        let port = Port::new(5, 8);
        let waiter = dummy_task(500, 5);
        waiter.set_state(TaskState::Blocked);
        port.inner.lock().receivers.push(waiter.clone());

        port.close();
        assert_eq!(waiter.state(), TaskState::Ready);
        assert_eq!(port.receiver_count(), 0);
    }

    #[test]
    fn send_wakes_exactly_one_receiver() {
        use crate::sched::{task::testutil::dummy_task, TaskState};

        let port = Port::new(6, 8);
        let a = dummy_task(510, 5);
        let b = dummy_task(511, 5);
        a.set_state(TaskState::Blocked);
        b.set_state(TaskState::Blocked);
        {
            let mut inner = port.inner.lock();
            inner.receivers.push(a.clone());
            inner.receivers.push(b.clone());
        }

        port.send(msg(9), IpcFlags::empty()).unwrap();
        assert_eq!(a.state(), TaskState::Ready);
        assert_eq!(b.state(), TaskState::Blocked);
    }
}
