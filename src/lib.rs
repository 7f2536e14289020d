pub mod auth_middleware;
pub mod book_repository;
pub mod books_source;
pub mod caches;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod repository;
pub mod reqwest_traced_client;
pub mod rest;
pub mod service;
pub mod tracing_config;

#[cfg(test)]
mod rest_tests;
