pub mod analyzer;
pub mod config;
pub mod error;
pub mod handlers;
pub mod hll;
pub mod migrations;
pub mod miner;
pub mod models;
pub mod pdata;
pub mod query;
pub mod store;

use std::sync::Arc;

use analyzer::{Analyzer, IngestStats};
use query::QueryEngine;
use store::MetadataStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn MetadataStore>,
    pub analyzer: Arc<Analyzer>,
    pub query: Arc<QueryEngine>,
    pub stats: Arc<IngestStats>,
}
