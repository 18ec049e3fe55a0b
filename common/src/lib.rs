// Quaero engine library: durable job model, scheduler, executor, crawler
// pool, file seeders, and the SQLite substrate they share.

pub mod bootstrap;
pub mod config;
pub mod crawler;
pub mod db;
pub mod errors;
pub mod executor;
pub mod models;
pub mod reaper;
pub mod resolver;
pub mod retry;
pub mod schedule;
pub mod scheduler;
pub mod seed;
pub mod telemetry;
