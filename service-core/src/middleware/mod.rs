pub mod http;
pub mod signature;
