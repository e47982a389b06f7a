pub mod btc;
pub mod config;
pub mod error;
pub mod lightning;
pub mod liquid;
pub mod logging;
pub mod onchain;
pub mod peer;
pub mod policy;
pub mod poll;
pub mod proto;
pub mod retry;
pub mod rpc;
pub mod swap;
pub mod txwatcher;
