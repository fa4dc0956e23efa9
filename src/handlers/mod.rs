pub mod admin;
pub mod analysis;
pub mod attributes;
pub mod health;
pub mod ingest;
pub mod logs;
pub mod metrics;
pub mod services;
pub mod spans;

use serde::Deserialize;

use crate::error::Result;
use crate::store::PageParams;

/// Common query parameters for the list endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub service: Option<String>,
}

impl ListParams {
    pub fn page(&self) -> Result<PageParams> {
        PageParams::new(self.limit, self.offset)
    }

    pub fn service(&self) -> Option<&str> {
        self.service.as_deref().filter(|s| !s.is_empty())
    }
}
