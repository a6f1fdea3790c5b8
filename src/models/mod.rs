pub mod client;
pub mod message;
pub mod order;
pub mod security;

pub use client::*;
pub use message::*;
pub use order::*;
pub use security::*;
