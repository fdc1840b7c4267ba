pub mod api;
pub mod authenticator;
pub mod challenger;
pub mod config;
pub mod context;
pub mod error;
pub mod freebie;
pub mod kvstore;
pub mod lightning;
pub mod limiter;
pub mod lsat;
pub mod mint;
pub mod router;
pub mod secretstore;
pub mod tls;
pub mod tor;
pub mod upstream;
