pub mod config;
pub mod entities;
pub mod error;
pub mod pagination;
pub mod routes;
pub mod services;
