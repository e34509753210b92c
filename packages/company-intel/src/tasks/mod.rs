//! Durable background tasks.
//!
//! - [`task`]: the record and its state machine
//! - [`store`]: one JSON file per task, with large results off-loaded
//! - [`manager`]: creation, dispatch, watchdog and the terminal-state guard
//! - [`handlers`]: what each task type does

pub mod handlers;
pub mod manager;
pub mod store;
pub mod task;

pub use handlers::{TaskHandler, TradeDataHandler};
pub use manager::{
    HandlerRegistry, ProgressReporter, TaskEvent, TaskManager, INTERRUPTED_MESSAGE,
    NO_RESULT_MESSAGE, TIMEOUT_MESSAGE,
};
pub use store::TaskStore;
pub use task::{ResultReference, StoredResult, Task, TaskStatus, TaskType};
