//! IRC gateway for a cabal chat log.
//!
//! One IRC client at a time is bridged onto a [`cabal_store::LogStore`]:
//! its commands become log writes, and log events become IRC lines.

pub mod command;
pub mod config;
pub mod connection;
pub mod echo;
pub mod irc;
pub mod join;
pub mod peers;
pub mod recap;
pub mod server;
pub mod session;

#[cfg(test)]
mod testing;
