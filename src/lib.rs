#![cfg_attr(feature = "strict", deny(warnings))]

pub mod clock;
pub mod commands;
pub mod responses;
pub mod session;
pub mod transport;
pub mod tunnel;
pub mod upload;
pub mod wifi;

#[cfg(feature = "examples")]
pub mod example;

#[cfg(test)]
mod tests;
