//! Delay-tolerant, energy-aware request broker for LLM inference on a
//! solar-powered node.
//!
//! Prompts are persisted instead of processed synchronously; the scheduler
//! estimates energy cost against a self-calibrating model, consults the power
//! monitor's 24-hour forecast for the earliest viable slot, and a single
//! background worker executes jobs when harvested power allows.

pub mod api;
pub mod config;
pub mod domain;
pub mod hardware;
pub mod inference;
pub mod repo;
pub mod scheduler;
pub mod telemetry;
