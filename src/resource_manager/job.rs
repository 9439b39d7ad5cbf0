//! The job payloads posted to the resource manager's [`crate::job_queue::JobQueue`]
//! (§4.2, §6) and dispatched by its worker threads.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::job_queue::QueueItem;
use crate::notification::AsyncNotification;

use super::data_buffer::DataBufferNode;
use super::data_stream::DataStreamNode;

/// Per-node FIFO ordering (§4.8, "serialized per-node ordering"): every job
/// touching a given node is stamped with `order = execution_counter++` at
/// post time; a worker popping a job whose `order` doesn't match the node's
/// `execution_pointer` reposts it to the back of the queue instead of running
/// it out of turn. `DataBufferNode` and `DataStreamNode` both carry the two
/// counters this relies on.
pub trait OrderedNode {
    fn next_order(&self) -> u64;
    fn execution_pointer(&self) -> u64;
    fn advance_execution_pointer(&self);
}

impl OrderedNode for DataBufferNode {
    fn next_order(&self) -> u64 {
        self.execution_counter.fetch_add(1, Ordering::AcqRel)
    }
    fn execution_pointer(&self) -> u64 {
        self.execution_pointer.load(Ordering::Acquire)
    }
    fn advance_execution_pointer(&self) {
        self.execution_pointer.fetch_add(1, Ordering::AcqRel);
    }
}

impl OrderedNode for DataStreamNode {
    fn next_order(&self) -> u64 {
        self.execution_counter.fetch_add(1, Ordering::AcqRel)
    }
    fn execution_pointer(&self) -> u64 {
        self.execution_pointer.load(Ordering::Acquire)
    }
    fn advance_execution_pointer(&self) {
        self.execution_pointer.fetch_add(1, Ordering::AcqRel);
    }
}

/// Which operation a [`Job`] carries. Kept distinct from `JobPayload` so a
/// worker can log/match on the code without destructuring the (non-`Copy`)
/// payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum JobCode {
    Quit,
    LoadDataBuffer,
    FreeDataBuffer,
    PageDataBuffer,
    LoadDataStream,
    FreeDataStream,
    PageDataStream,
    SeekDataStream,
    Custom,
}

pub type CustomJobFn = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone)]
pub enum JobPayload {
    Quit,
    LoadDataBuffer {
        node: Arc<DataBufferNode>,
        path: String,
        decode: bool,
        notify: Option<Arc<dyn AsyncNotification>>,
    },
    FreeDataBuffer {
        node: Arc<DataBufferNode>,
        notify: Option<Arc<dyn AsyncNotification>>,
    },
    PageDataBuffer {
        node: Arc<DataBufferNode>,
        page_index: usize,
    },
    LoadDataStream {
        node: Arc<DataStreamNode>,
        path: String,
        notify: Option<Arc<dyn AsyncNotification>>,
    },
    FreeDataStream {
        node: Arc<DataStreamNode>,
        notify: Option<Arc<dyn AsyncNotification>>,
    },
    PageDataStream {
        node: Arc<DataStreamNode>,
        page_index: usize,
    },
    SeekDataStream {
        node: Arc<DataStreamNode>,
        frame_index: u64,
    },
    /// Escape hatch for ad-hoc work that still wants to ride the resource
    /// manager's worker threads and execution-ordering guarantees (§6).
    Custom(CustomJobFn),
}

impl std::fmt::Debug for JobPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            JobPayload::Quit => "Quit",
            JobPayload::LoadDataBuffer { .. } => "LoadDataBuffer",
            JobPayload::FreeDataBuffer { .. } => "FreeDataBuffer",
            JobPayload::PageDataBuffer { .. } => "PageDataBuffer",
            JobPayload::LoadDataStream { .. } => "LoadDataStream",
            JobPayload::FreeDataStream { .. } => "FreeDataStream",
            JobPayload::PageDataStream { .. } => "PageDataStream",
            JobPayload::SeekDataStream { .. } => "SeekDataStream",
            JobPayload::Custom(_) => "Custom",
        })
    }
}

/// One unit of work posted to the resource manager's job queue. Implements
/// [`QueueItem`] so the generic [`crate::job_queue::JobQueue`] can carry it;
/// `Default` is the `Quit` sentinel, matching what an empty/just-allocated
/// slot should read as before a real job is written into it.
#[derive(Clone, Debug)]
pub struct Job {
    pub code: JobCode,
    pub payload: JobPayload,
    /// This job's position in its target node's FIFO, or `0` for jobs with no
    /// single owning node (`Quit`, `Custom`, the first `LoadDataBuffer` /
    /// `LoadDataStream` for a brand new node).
    pub order: u64,
}

impl Job {
    pub fn new(code: JobCode, payload: JobPayload) -> Self {
        Self {
            code,
            payload,
            order: 0,
        }
    }

    /// Stamp this job with the next order number from `node`, for jobs that
    /// must run in strict per-node FIFO order relative to sibling jobs on the
    /// same node (paging, seeking, freeing).
    pub fn new_ordered(code: JobCode, payload: JobPayload, node: &dyn OrderedNode) -> Self {
        Self {
            code,
            payload,
            order: node.next_order(),
        }
    }
}

impl Default for Job {
    fn default() -> Self {
        Self {
            code: JobCode::Quit,
            payload: JobPayload::Quit,
            order: 0,
        }
    }
}

impl QueueItem for Job {
    fn is_quit(&self) -> bool {
        self.code == JobCode::Quit
    }

    fn quit() -> Self {
        Self::default()
    }
}
