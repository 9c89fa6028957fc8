pub mod commands;
pub mod server;
pub mod voice;
