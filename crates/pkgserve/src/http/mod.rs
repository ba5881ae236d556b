pub mod admin;
pub mod auth;
pub mod cors;
pub mod health;
pub mod packages;
