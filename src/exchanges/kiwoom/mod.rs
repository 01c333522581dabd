pub mod auth;
pub mod builder;
pub mod codec;
pub mod realtime;
pub mod rest;
pub mod session;
pub mod types;

// Re-export main types for easier importing
pub use builder::KiwoomSessionBuilder;
pub use codec::KiwoomCodec;
pub use realtime::{Level, OrderBook, Tick, ORDER_BOOK, TICK};
pub use rest::KiwoomRestClient;
pub use session::KiwoomSession;
pub use types::{ChartPeriod, ChartTarget, Market, StockInfo};
