// Discord layer - slash commands over the economy service.

#[path = "commands/command_catalog.rs"]
pub mod commands;

pub use commands::economy::{Data, Error};
