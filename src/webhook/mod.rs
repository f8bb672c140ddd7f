pub mod processor;
pub mod signature;

pub use processor::WebhookProcessor;
