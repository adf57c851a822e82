pub mod assist;
pub mod cli;
pub mod config;
pub mod delivery;
pub mod media;
pub mod negotiation;
pub mod room;
pub mod session;
pub mod signaling;
pub mod telemetry;
pub mod transport;

#[cfg(test)]
mod tests;
