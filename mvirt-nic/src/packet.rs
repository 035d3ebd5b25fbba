//! Packet representations crossing the engine boundary
//!
//! - `OutboundPacket`: host packet to transmit, head plus fragments
//! - `InboundPacket`: received packet handed to the host
//! - `Frame`: single-buffer frame sent through a redirect queue
//! - `PacketView`: mutable window over a receive buffer for the filter

use std::fmt;

use crate::buffer::RxPage;
use crate::error::TxError;

/// Checksum work requested from the device for a transmitted packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChecksumOffload {
    #[default]
    None,
    /// Device computes the L4 checksum starting at `start` and stores it
    /// at `start + offset`.
    Partial { start: u16, offset: u16 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OffloadHints {
    pub checksum: ChecksumOffload,
    /// Segmentation size for large sends.
    pub tso_mss: Option<u16>,
}

/// Packet handed to the engine for transmission.
#[derive(Clone, Default)]
pub struct OutboundPacket {
    head: Vec<u8>,
    frags: Vec<Vec<u8>>,
    pub offload: OffloadHints,
    /// Preferred queue; taken modulo the number of IO queues.
    pub queue_hint: Option<u16>,
}

impl OutboundPacket {
    pub fn new(head: Vec<u8>) -> Self {
        Self {
            head,
            ..Default::default()
        }
    }

    pub fn with_frags(head: Vec<u8>, frags: Vec<Vec<u8>>) -> Self {
        Self {
            head,
            frags,
            ..Default::default()
        }
    }

    pub fn queue(mut self, qid: u16) -> Self {
        self.queue_hint = Some(qid);
        self
    }

    #[inline]
    pub fn head(&self) -> &[u8] {
        &self.head
    }

    #[inline]
    pub fn frags(&self) -> &[Vec<u8>] {
        &self.frags
    }

    pub fn len(&self) -> usize {
        self.head.len() + self.frags.iter().map(Vec::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Non-empty buffers that have to be described to the device.
    pub fn segment_count(&self) -> usize {
        usize::from(!self.head.is_empty()) + self.frags.iter().filter(|f| !f.is_empty()).count()
    }

    /// All bytes in order, as separate slices.
    pub fn segments(&self) -> impl Iterator<Item = &[u8]> {
        std::iter::once(self.head.as_slice()).chain(self.frags.iter().map(Vec::as_slice))
    }

    /// Copy every fragment into the head so the packet fits one segment.
    pub fn linearize(&mut self) -> Result<(), TxError> {
        if self.frags.is_empty() {
            return Ok(());
        }
        let extra: usize = self.frags.iter().map(Vec::len).sum();
        self.head
            .try_reserve_exact(extra)
            .map_err(|_| TxError::LinearizeFailed)?;
        for frag in self.frags.drain(..) {
            self.head.extend_from_slice(&frag);
        }
        Ok(())
    }

    /// Copy of the first `n` bytes, following fragments if the head is
    /// shorter than `n`.
    pub fn copy_prefix(&self, out: &mut [u8]) -> usize {
        let mut copied = 0;
        for seg in self.segments() {
            if copied == out.len() {
                break;
            }
            let take = seg.len().min(out.len() - copied);
            out[copied..copied + take].copy_from_slice(&seg[..take]);
            copied += take;
        }
        copied
    }
}

impl fmt::Debug for OutboundPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundPacket")
            .field("len", &self.len())
            .field("segments", &self.segment_count())
            .field("queue_hint", &self.queue_hint)
            .finish()
    }
}

/// Checksum validation result reported by the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RxChecksum {
    #[default]
    NotChecked,
    Good,
    Bad,
}

/// Receive-side metadata from the last descriptor of a packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxMeta {
    pub checksum: RxChecksum,
    pub hash: Option<u32>,
}

/// Part of a receive page that holds packet data.
pub struct RxFrag {
    page: RxPage,
    offset: usize,
    len: usize,
}

impl RxFrag {
    pub(crate) fn new(page: RxPage, offset: usize, len: usize) -> Self {
        debug_assert!(offset + len <= page.page_size());
        Self { page, offset, len }
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.page.as_slice()[self.offset..self.offset + self.len]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for RxFrag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RxFrag")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

#[derive(Debug)]
pub enum RxBody {
    /// Short packet copied out of the receive buffer.
    Copied(Vec<u8>),
    /// Receive pages handed upward, one per descriptor.
    Pages(Vec<RxFrag>),
}

/// Packet delivered to the host stack.
#[derive(Debug)]
pub struct InboundPacket {
    pub qid: u16,
    pub body: RxBody,
    pub meta: RxMeta,
}

impl InboundPacket {
    pub fn len(&self) -> usize {
        match &self.body {
            RxBody::Copied(data) => data.len(),
            RxBody::Pages(frags) => frags.iter().map(RxFrag::len).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_copied(&self) -> bool {
        matches!(self.body, RxBody::Copied(_))
    }

    /// Contiguous copy of the packet bytes.
    pub fn to_vec(&self) -> Vec<u8> {
        match &self.body {
            RxBody::Copied(data) => data.clone(),
            RxBody::Pages(frags) => frags.iter().flat_map(|f| f.data()).copied().collect(),
        }
    }
}

/// Frame queued on a redirect queue.
#[derive(Debug)]
pub enum Frame {
    /// Receive buffer forwarded without copying.
    Page(RxFrag),
    /// Caller-owned bytes.
    Owned(Vec<u8>),
}

impl Frame {
    #[inline]
    pub fn data(&self) -> &[u8] {
        match self {
            Frame::Page(frag) => frag.data(),
            Frame::Owned(data) => data,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Mutable window over a received frame.
///
/// The filter may move both ends within the underlying buffer, which lets
/// it push or strip headers in place.
pub struct PacketView<'a> {
    buf: &'a mut [u8],
    start: usize,
    end: usize,
}

impl<'a> PacketView<'a> {
    pub fn new(buf: &'a mut [u8], start: usize, len: usize) -> Self {
        let end = (start + len).min(buf.len());
        Self {
            buf,
            start: start.min(end),
            end,
        }
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.start..self.end]
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.start
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Move the start by `delta` bytes (negative grows the frame).
    pub fn adjust_head(&mut self, delta: isize) -> bool {
        match self.start.checked_add_signed(delta) {
            Some(start) if start <= self.end => {
                self.start = start;
                true
            }
            _ => false,
        }
    }

    /// Move the end by `delta` bytes (negative shrinks the frame).
    pub fn adjust_tail(&mut self, delta: isize) -> bool {
        match self.end.checked_add_signed(delta) {
            Some(end) if end >= self.start && end <= self.buf.len() => {
                self.end = end;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_count_ignores_empty() {
        let pkt = OutboundPacket::with_frags(vec![], vec![vec![1; 10], vec![], vec![2; 5]]);
        assert_eq!(pkt.segment_count(), 2);
        assert_eq!(pkt.len(), 15);
    }

    #[test]
    fn test_linearize_keeps_order() {
        let mut pkt = OutboundPacket::with_frags(vec![1, 2], vec![vec![3], vec![4, 5]]);
        pkt.linearize().unwrap();
        assert_eq!(pkt.head(), &[1, 2, 3, 4, 5]);
        assert!(pkt.frags().is_empty());
        assert_eq!(pkt.segment_count(), 1);
    }

    #[test]
    fn test_copy_prefix_crosses_fragments() {
        let pkt = OutboundPacket::with_frags(vec![1, 2], vec![vec![3, 4, 5]]);
        let mut out = [0u8; 4];
        assert_eq!(pkt.copy_prefix(&mut out), 4);
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn test_view_adjust_bounds() {
        let mut buf = [0u8; 64];
        let mut view = PacketView::new(&mut buf, 16, 32);
        assert!(view.adjust_head(-16));
        assert_eq!(view.len(), 48);
        assert!(!view.adjust_head(-1));
        assert!(view.adjust_tail(16));
        assert!(!view.adjust_tail(1));
        assert!(view.adjust_head(64));
        assert!(view.is_empty());
        assert!(!view.adjust_tail(-1));
    }
}
