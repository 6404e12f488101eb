#![forbid(unsafe_code)]

pub mod bus;
pub mod command;
pub mod registry;
pub mod relay;


#[cfg(test)]
mod command_tests;

#[cfg(test)]
mod registry_tests;
