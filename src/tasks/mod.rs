//! Progress reporting for long-running work.
//!
//! Workers send [`TaskUpdate`]s over an `mpsc` channel; the CLI turns them
//! into a progress bar. A shared `AtomicBool` requests cancellation.

/// Progress information for a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskProgress {
    pub current: usize,
    pub total: usize,
    pub current_item: Option<String>,
    pub message: Option<String>,
}

impl TaskProgress {
    pub fn new(current: usize, total: usize) -> Self {
        Self {
            current,
            total,
            current_item: None,
            message: None,
        }
    }

    pub fn with_item(mut self, item: impl Into<String>) -> Self {
        self.current_item = Some(item.into());
        self
    }

    pub fn with_message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }
}

/// Update messages sent from workers via channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskUpdate {
    /// Work has started with total items to process.
    Started { total: usize },
    Progress(TaskProgress),
    Completed { message: String },
    Cancelled,
    Failed { error: String },
}
