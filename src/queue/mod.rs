pub mod dispatcher;
pub mod handlers;
pub mod types;
pub mod worker;

pub use dispatcher::Dispatcher;
pub use types::{Lane, QueuedTask};
pub use worker::{TaskHandler, Worker};
