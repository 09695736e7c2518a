//! Gleaner Client - HTTP clients for external systems
//!
//! This crate provides the remote collaborators of the harvesting pipeline:
//!
//! - [`ckan`] - CKAN open data portals, as a seed [`Connector`](gleaner_core::traits::Connector)
//! - [`elastic`] - Elasticsearch/OpenSearch, as a [`SearchEngine`](gleaner_core::traits::SearchEngine)
//! - [`resource`] - the enrichment resource service, as a [`ResourceFetcher`](gleaner_core::traits::ResourceFetcher)
//!
//! # Overview
//!
//! The clients handle authentication, request building, response parsing,
//! and mapping failures onto [`AppError`](gleaner_core::error::AppError).

pub mod ckan;
pub mod elastic;
mod http;
pub mod resource;

// Re-export main client types
pub use ckan::CkanClient;
pub use elastic::ElasticClient;
pub use resource::ResourceServiceClient;
