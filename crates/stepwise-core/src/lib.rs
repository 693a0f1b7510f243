pub mod config;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{InvokerErrorKind, Result, StepwiseError};
pub use event::{EventBus, EventKind, ExecutionEvent};
pub use types::*;
