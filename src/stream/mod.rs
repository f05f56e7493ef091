pub mod client;
pub mod decode;

pub use client::StreamClient;
