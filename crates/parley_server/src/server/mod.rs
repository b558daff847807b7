#![forbid(unsafe_code)]

pub mod auth;
pub mod health;
pub mod http;
pub mod listener;
pub mod password;
pub mod registry;
pub mod services;
pub mod session;
pub mod store;


#[cfg(test)]
mod session_tests;
