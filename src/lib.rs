pub mod accounts;
pub mod auth;
pub mod clients;
pub mod config;
pub mod database;
pub mod error;
pub mod handlers;
pub mod lifecycle;
pub mod models;
pub mod rate_limit;
pub mod registrations;
pub mod store;
pub mod uploads;

#[cfg(test)]
pub(crate) mod testing;
