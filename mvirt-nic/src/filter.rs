//! Receive filter and redirect fast path
//!
//! An optional program sees every single-buffer receive before the host
//! stack does. It may edit the frame in place and decides what happens
//! next:
//!
//! - `Pass`: continue to the host, with the possibly adjusted boundaries
//! - `Drop`: recycle the buffer in place
//! - `Transmit`: send the buffer out of the redirect queue paired with
//!   the receiving queue
//! - `Redirect { queue }`: send it out of any redirect queue
//! - `Aborted`: like `Drop`, counted separately
//!
//! Forwarded buffers move to the redirect queue without a copy.

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use tracing::warn;

use crate::buffer::RxPage;
use crate::packet::{Frame, PacketView, RxFrag};
use crate::queue::QueuePair;
use crate::stats::{QueueCounter, QueueStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Drop,
    Transmit,
    Redirect { queue: u16 },
    Aborted,
}

type FilterFn = dyn Fn(&mut PacketView<'_>) -> Verdict + Send + Sync;

/// Opaque filter callable.
pub struct FilterProgram {
    name: String,
    run: Box<FilterFn>,
}

impl FilterProgram {
    pub fn new(
        name: impl Into<String>,
        run: impl Fn(&mut PacketView<'_>) -> Verdict + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            run: Box::new(run),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn run(&self, view: &mut PacketView<'_>) -> Verdict {
        (self.run)(view)
    }
}

impl fmt::Debug for FilterProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterProgram")
            .field("name", &self.name)
            .finish()
    }
}

/// Installed program, swapped atomically while queues keep polling.
#[derive(Default)]
pub struct FilterSlot {
    program: ArcSwapOption<FilterProgram>,
}

impl FilterSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the program, returning the previous one.
    pub fn install(&self, program: Option<FilterProgram>) -> Option<Arc<FilterProgram>> {
        self.program.swap(program.map(Arc::new))
    }

    pub fn current(&self) -> Option<Arc<FilterProgram>> {
        self.program.load_full()
    }

    pub fn is_installed(&self) -> bool {
        self.program.load().is_some()
    }
}

/// What the receive path does after the filter ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FastPath {
    /// Deliver `len` bytes starting at `offset` in the page.
    Pass { offset: usize, len: usize },
    /// Buffer was recycled or forwarded. Nothing to deliver.
    Consumed,
}

/// Run `program` over the frame in `page`.
///
/// `page` stays in place for recycling unless the frame is forwarded,
/// in which case it is taken and unmapped.
pub(crate) fn execute(
    program: &FilterProgram,
    qid: u16,
    page: &mut Option<RxPage>,
    offset: usize,
    len: usize,
    redirect: &[Arc<QueuePair>],
    stats: &QueueStats,
) -> FastPath {
    let Some(buf) = page.as_mut() else {
        stats.inc(QueueCounter::FilterAborted);
        return FastPath::Consumed;
    };

    let mut view = PacketView::new(buf.as_mut_slice(), offset, len);
    let verdict = program.run(&mut view);
    let (offset, len) = (view.offset(), view.len());

    match verdict {
        Verdict::Pass => {
            stats.inc(QueueCounter::FilterPass);
            FastPath::Pass { offset, len }
        }
        Verdict::Drop => {
            stats.inc(QueueCounter::FilterDrop);
            FastPath::Consumed
        }
        Verdict::Aborted => {
            stats.inc(QueueCounter::FilterAborted);
            FastPath::Consumed
        }
        Verdict::Transmit => {
            forward(qid, page, offset, len, redirect, stats, QueueCounter::FilterTx)
        }
        Verdict::Redirect { queue } => forward(
            queue,
            page,
            offset,
            len,
            redirect,
            stats,
            QueueCounter::FilterRedirect,
        ),
    }
}

fn forward(
    target: u16,
    page: &mut Option<RxPage>,
    offset: usize,
    len: usize,
    redirect: &[Arc<QueuePair>],
    stats: &QueueStats,
    counter: QueueCounter,
) -> FastPath {
    let Some(queue) = redirect.get(target as usize) else {
        warn!(target, queues = redirect.len(), "Filter redirect to missing queue");
        stats.inc(QueueCounter::FilterAborted);
        return FastPath::Consumed;
    };
    if len == 0 {
        stats.inc(QueueCounter::FilterAborted);
        return FastPath::Consumed;
    }
    let Some(mut buf) = page.take() else {
        stats.inc(QueueCounter::FilterAborted);
        return FastPath::Consumed;
    };

    buf.unmap();
    let frame = Frame::Page(RxFrag::new(buf, offset, len));
    if queue.tx().xmit_frames(std::iter::once(frame), true) == 1 {
        stats.inc(counter);
    } else {
        stats.inc(QueueCounter::FilterAborted);
    }
    FastPath::Consumed
}
