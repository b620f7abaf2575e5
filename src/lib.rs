//! Scheduler for running simulation windows on exclusive accelerator
//! devices.

pub mod commands;
pub mod config;
