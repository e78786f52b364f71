//! Listing Photo Preparation Pipeline
//!
//! This library provides the core functionality for the listing-prep
//! system, which analyzes property-listing photos with Cloudflare
//! Workers AI vision models, plans an enhancement strategy per photo,
//! and executes it against generative image models with checkpointed,
//! resumable job processing.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
