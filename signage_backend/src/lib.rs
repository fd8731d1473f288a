//! Ambient signage backend: context collection, prompt composition and the
//! image generation service that the controller and display client build on.

pub mod comfy_client;
pub mod comfy_workflow;
pub mod composer;
pub mod config;
pub mod context;
pub mod controller;
pub mod http_client;
pub mod inference;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod safety;
pub mod server;
