pub mod client;
pub mod feed;
pub mod paper;
pub mod websocket;

pub use client::KiteClient;
pub use feed::{spawn_feed, FeedCommand, FeedHandle};
pub use paper::PaperBroker;
pub use websocket::{KiteTicker, TickerEvent};
