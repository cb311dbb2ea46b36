pub mod authority;
pub mod batch;
pub mod dispatch;
pub mod error;
pub mod pipeline;
pub mod pool;

pub use authority::AuthorityTracker;
pub use dispatch::Dispatcher;
pub use error::{PipelineError, Result};
pub use pipeline::Pipeline;
pub use pool::EventPool;
