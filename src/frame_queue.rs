use crate::frame::RadioPacket;
use crate::{INBOUND_FRAME_QUEUE_SIZE, OUTBOUND_FRAME_QUEUE_SIZE};

/// Returned by `enqueue` when the queue is at capacity. The frame is not
/// stored and the queue contents are untouched; backpressure is the caller's
/// to handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFull;

/// Returned by `dequeue` when no frame is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueEmpty;

/// Fixed-capacity circular frame queue.
///
/// The queue is full when `(tail + 1) % N == head` and empty when
/// `head == tail`, so one slot is always kept free and the usable capacity is
/// `N - 1`. There is no internal locking: only the producer advances `tail`
/// and only the consumer advances `head`. When the producer runs in interrupt
/// context the caller must keep the whole enqueue atomic with respect to the
/// mainline dequeue by masking interrupts around it.
pub struct FrameQueue<const N: usize> {
    slots: [RadioPacket; N],
    head: usize,
    tail: usize,
}

impl<const N: usize> FrameQueue<N> {
    pub const fn new() -> Self {
        FrameQueue {
            slots: [RadioPacket::new(); N],
            head: 0,
            tail: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn is_full(&self) -> bool {
        (self.tail + 1) % N == self.head
    }

    /// Number of frames currently queued.
    pub fn len(&self) -> usize {
        (self.tail + N - self.head) % N
    }

    pub fn enqueue(&mut self, packet: RadioPacket) -> Result<(), QueueFull> {
        if self.is_full() {
            return Err(QueueFull);
        }
        self.slots[self.tail] = packet;
        self.tail = (self.tail + 1) % N;
        Ok(())
    }

    pub fn dequeue(&mut self) -> Result<RadioPacket, QueueEmpty> {
        if self.is_empty() {
            return Err(QueueEmpty);
        }
        let packet = self.slots[self.head];
        self.head = (self.head + 1) % N;
        Ok(packet)
    }
}

impl<const N: usize> Default for FrameQueue<N> {
    fn default() -> Self {
        FrameQueue::new()
    }
}

/// The pair of frame queues the network layer runs on: inbound frames fed by
/// the receive-complete callback, outbound frames fed by mainline code and
/// drained by the transmit path.
pub struct FrameQueueManager {
    inbound: FrameQueue<INBOUND_FRAME_QUEUE_SIZE>,
    outbound: FrameQueue<OUTBOUND_FRAME_QUEUE_SIZE>,
}

impl FrameQueueManager {
    pub const fn new() -> Self {
        FrameQueueManager {
            inbound: FrameQueue::new(),
            outbound: FrameQueue::new(),
        }
    }

    pub fn enqueue_inbound(&mut self, packet: RadioPacket) -> Result<(), QueueFull> {
        self.inbound.enqueue(packet)
    }

    pub fn dequeue_inbound(&mut self) -> Result<RadioPacket, QueueEmpty> {
        self.inbound.dequeue()
    }

    pub fn enqueue_outbound(&mut self, packet: RadioPacket) -> Result<(), QueueFull> {
        self.outbound.enqueue(packet)
    }

    pub fn dequeue_outbound(&mut self) -> Result<RadioPacket, QueueEmpty> {
        self.outbound.dequeue()
    }

    pub fn inbound_pending(&self) -> usize {
        self.inbound.len()
    }

    pub fn outbound_pending(&self) -> usize {
        self.outbound.len()
    }
}

impl Default for FrameQueueManager {
    fn default() -> Self {
        FrameQueueManager::new()
    }
}
