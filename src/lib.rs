pub mod config;
pub mod database;
pub mod exercise;
pub mod grading;
pub mod queue;
pub mod routes;
pub mod sandbox;
pub mod web_server;
pub mod worker;
