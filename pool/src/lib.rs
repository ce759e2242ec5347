pub mod blockchain;
pub mod config;
pub mod metrics;
pub mod policy;
pub mod shares;
pub mod stratum;
