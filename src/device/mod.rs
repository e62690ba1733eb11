pub mod btle;
pub mod codec;
pub mod constants;
pub mod filter;
pub mod machine;
pub mod session;
pub mod store;
pub mod transport;
pub mod types;
