//! PLG gateway core library: conversational agent gateway (session registry, agent adapter,
//! event translation, confirmation gate) and the reconnecting chat client used by the CLI.

pub mod agent;
pub mod client;
pub mod config;
pub mod confirm;
pub mod gateway;
pub mod init;
pub mod persistence;
pub mod prompt;
pub mod session;
pub mod skills;
pub mod translate;
