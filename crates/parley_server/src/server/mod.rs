#![forbid(unsafe_code)]

pub mod bus;
pub mod chat;
pub mod connection;
pub mod error;
pub mod identity;
pub mod membership;
pub mod registry;
pub mod token;



#[cfg(test)]
mod identity_tests;

#[cfg(test)]
mod registry_tests;
