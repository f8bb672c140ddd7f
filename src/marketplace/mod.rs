pub mod client;
pub mod payload;
pub mod types;

pub use client::MarketplaceClient;
