pub mod config;
pub mod database;
pub mod error;
pub mod internaltypes;
pub mod jobdb;
pub mod pricing;
pub mod proto;
pub mod replay;
pub mod shutdown;
pub mod sync;
