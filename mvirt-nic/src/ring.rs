//! Descriptor ring bookkeeping
//!
//! `DescriptorRing` tracks the produce/consume cursors of one hardware
//! queue and owns the `FreeIdPool` that hands out request ids. Request ids
//! are what the device echoes back in completions; they index the per-slot
//! buffer tables of the TX and RX engines, which lets completions arrive in
//! any order.

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    #[error("ring size {0} is not a power of two")]
    NotPowerOfTwo(u32),

    #[error("request id {0} is out of range")]
    OutOfRange(u16),

    #[error("request id {0} is not in flight")]
    NotInFlight(u16),

    #[error("consume cursor would pass produce cursor")]
    Overrun,
}

/// Which cursor to move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    Produce,
    Consume,
}

/// Circular free list of request ids.
///
/// Ids come back in any order and are handed out again in the order they
/// were released.
#[derive(Debug)]
pub struct FreeIdPool {
    ids: Box<[u16]>,
    in_flight: Box<[bool]>,
    /// Total ids handed out (wrapping)
    head: usize,
    /// Total ids released (wrapping)
    tail: usize,
    mask: usize,
}

impl FreeIdPool {
    fn new(capacity: usize) -> Self {
        Self {
            ids: (0..capacity as u16).collect(),
            in_flight: vec![false; capacity].into_boxed_slice(),
            head: 0,
            tail: 0,
            mask: capacity - 1,
        }
    }

    /// Id that the next `acquire` will return, without taking it.
    #[inline]
    pub fn peek(&self) -> Option<u16> {
        if self.outstanding() == self.ids.len() {
            return None;
        }
        Some(self.ids[self.head & self.mask])
    }

    pub fn acquire(&mut self) -> Option<u16> {
        let id = self.peek()?;
        self.in_flight[id as usize] = true;
        self.head = self.head.wrapping_add(1);
        Some(id)
    }

    pub fn release(&mut self, id: u16) -> Result<(), RingError> {
        let slot = self
            .in_flight
            .get_mut(id as usize)
            .ok_or(RingError::OutOfRange(id))?;
        if !*slot {
            return Err(RingError::NotInFlight(id));
        }
        *slot = false;
        self.ids[self.tail & self.mask] = id;
        self.tail = self.tail.wrapping_add(1);
        Ok(())
    }

    #[inline]
    pub fn is_in_flight(&self, id: u16) -> bool {
        self.in_flight.get(id as usize).copied().unwrap_or(false)
    }

    #[inline]
    pub fn outstanding(&self) -> usize {
        self.head.wrapping_sub(self.tail)
    }
}

/// Cursors and request ids of one hardware ring of capacity N.
#[derive(Debug)]
pub struct DescriptorRing {
    capacity: u16,
    produce_at: u32,
    consume_at: u32,
    ids: FreeIdPool,
}

impl DescriptorRing {
    pub fn new(capacity: u16) -> Result<Self, RingError> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(RingError::NotPowerOfTwo(capacity as u32));
        }
        Ok(Self {
            capacity,
            produce_at: 0,
            consume_at: 0,
            ids: FreeIdPool::new(capacity as usize),
        })
    }

    #[inline]
    pub fn capacity(&self) -> u16 {
        self.capacity
    }

    /// Produce cursor as a ring index.
    #[inline]
    pub fn produce_at(&self) -> u16 {
        (self.produce_at & (self.capacity as u32 - 1)) as u16
    }

    /// Consume cursor as a ring index.
    #[inline]
    pub fn consume_at(&self) -> u16 {
        (self.consume_at & (self.capacity as u32 - 1)) as u16
    }

    /// Entries produced but not yet consumed.
    #[inline]
    pub fn outstanding(&self) -> u16 {
        self.produce_at.wrapping_sub(self.consume_at) as u16
    }

    #[inline]
    pub fn free_slots(&self) -> u16 {
        self.capacity - self.outstanding()
    }

    pub fn advance(&mut self, cursor: Cursor, n: u16) -> Result<(), RingError> {
        match cursor {
            Cursor::Produce => {
                if self.outstanding() as u32 + n as u32 > self.capacity as u32 {
                    return Err(RingError::Overrun);
                }
                self.produce_at = self.produce_at.wrapping_add(n as u32);
            }
            Cursor::Consume => {
                if n > self.outstanding() {
                    return Err(RingError::Overrun);
                }
                self.consume_at = self.consume_at.wrapping_add(n as u32);
            }
        }
        Ok(())
    }

    #[inline]
    pub fn peek_id(&self) -> Option<u16> {
        self.ids.peek()
    }

    #[inline]
    pub fn acquire_id(&mut self) -> Option<u16> {
        self.ids.acquire()
    }

    #[inline]
    pub fn release_id(&mut self, id: u16) -> Result<(), RingError> {
        self.ids.release(id)
    }

    #[inline]
    pub fn is_in_flight(&self, id: u16) -> bool {
        self.ids.is_in_flight(id)
    }

    /// Request ids currently owned by the device or the engine.
    #[inline]
    pub fn ids_in_flight(&self) -> usize {
        self.ids.outstanding()
    }
}
