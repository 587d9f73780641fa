mod context;
mod result;
mod status;

pub use context::{Resources, TaskContext, TaskContextBuilder, TaskDescriptor, TaskId};
pub use result::{millis, TaskResult};
pub use status::TaskStatus;
