pub mod adapters;
pub mod config;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod queue;
pub mod web;
