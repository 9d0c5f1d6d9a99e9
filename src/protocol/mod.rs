pub mod codec;
pub mod commands;
pub mod packets;
pub mod types;
