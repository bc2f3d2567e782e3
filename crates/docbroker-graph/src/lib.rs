//! Microsoft Graph / SharePoint adapter for docbroker.
//!
//! Implements `RepositoryClient` on top of the Graph v1.0 API (sites, lists, drives, delta
//! queries) and the SharePoint REST API (list change queries, list webhooks), plus an
//! `AuthorNotifier` that sends plain-text mail through Graph.

mod client;
mod mail;
mod repository;
mod token_manager;

pub use client::{GraphClient, GraphConfig, GRAPH_SCOPE};
pub use mail::GraphMailNotifier;
pub use repository::GraphRepository;
pub use token_manager::TokenManager;
