//! Visun - explains concepts with an LLM and turns each answer into
//! step-by-step Manim animations.
//!
//! This crate provides:
//! - Chat query handling with session history
//! - Animation orchestration: code generation, rendering, similarity cache
//! - SQLite persistence for sessions, messages and cached animations
//! - HTTP API and command line front ends

pub mod animation;
pub mod chat;
pub mod chunker;
pub mod cli;
pub mod config;
pub mod llm;
pub mod paths;
pub mod server;
pub mod status;
pub mod store;

pub use config::Config;
