use axum::Json;
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use serde::Deserialize;

use crate::AppState;
use crate::error::Error;
use crate::models::attribute::{AttributeScope, SignalType};
use crate::store::{AttributeQuery, AttributeSort, MAX_PAGE_LIMIT, MetadataStore, PageParams};

/// The catalog endpoint paginates with `page`/`page_size` (1-based)
/// rather than `limit`/`offset`.
#[derive(Debug, Deserialize)]
pub struct AttributeParams {
    pub signal_type: Option<String>,
    pub scope: Option<String>,
    pub min_cardinality: Option<u64>,
    pub sort_by: Option<String>,
    pub sort_direction: Option<String>,
    pub page: Option<usize>,
    pub page_size: Option<usize>,
}

impl AttributeParams {
    fn into_query(self) -> Result<AttributeQuery, Error> {
        let signal_type = match self.signal_type.as_deref() {
            None | Some("") => None,
            Some(raw) => Some(
                SignalType::parse(raw)
                    .ok_or_else(|| Error::InvalidInput(format!("unknown signal_type {raw:?}")))?,
            ),
        };
        let scope = match self.scope.as_deref() {
            None | Some("") => None,
            Some(raw) => Some(
                AttributeScope::parse(raw)
                    .ok_or_else(|| Error::InvalidInput(format!("unknown scope {raw:?}")))?,
            ),
        };
        let sort_by = match self.sort_by.as_deref() {
            None | Some("") => AttributeSort::Key,
            Some(raw) => AttributeSort::parse(raw)?,
        };
        let descending = match self.sort_direction.as_deref() {
            None | Some("") | Some("asc") => false,
            Some("desc") => true,
            Some(other) => {
                return Err(Error::InvalidInput(format!(
                    "sort_direction must be asc or desc, got {other:?}"
                )));
            }
        };
        let page = self.page.unwrap_or(1);
        if page == 0 {
            return Err(Error::InvalidInput("page is 1-based".into()));
        }
        let page_size = self.page_size.unwrap_or(crate::store::DEFAULT_PAGE_LIMIT);
        if page_size == 0 || page_size > MAX_PAGE_LIMIT {
            return Err(Error::InvalidInput(format!(
                "page_size must be within [1, {MAX_PAGE_LIMIT}]"
            )));
        }
        Ok(AttributeQuery {
            signal_type,
            scope,
            min_cardinality: self.min_cardinality,
            sort_by,
            descending,
            page: PageParams {
                limit: page_size,
                offset: (page - 1) * page_size,
            },
        })
    }
}

pub async fn list_attributes(
    State(state): State<AppState>,
    Query(params): Query<AttributeParams>,
) -> Result<impl IntoResponse, Error> {
    let page = state.store.query_attributes(params.into_query()?).await?;
    Ok(Json(page))
}

pub async fn get_attribute(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, Error> {
    let entry = state.store.get_attribute(&key).await?;
    Ok(Json(entry))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> AttributeParams {
        AttributeParams {
            signal_type: None,
            scope: None,
            min_cardinality: None,
            sort_by: None,
            sort_direction: None,
            page: None,
            page_size: None,
        }
    }

    #[test]
    fn defaults_map_to_first_page_key_order() {
        let q = params().into_query().unwrap();
        assert_eq!(q.page.limit, 100);
        assert_eq!(q.page.offset, 0);
        assert_eq!(q.sort_by, AttributeSort::Key);
        assert!(!q.descending);
    }

    #[test]
    fn page_math_is_one_based() {
        let q = AttributeParams {
            page: Some(3),
            page_size: Some(50),
            ..params()
        }
        .into_query()
        .unwrap();
        assert_eq!(q.page.limit, 50);
        assert_eq!(q.page.offset, 100);
    }

    #[test]
    fn bad_filters_are_rejected() {
        assert!(
            AttributeParams { signal_type: Some("trace".into()), ..params() }
                .into_query()
                .is_err()
        );
        assert!(
            AttributeParams { scope: Some("everywhere".into()), ..params() }
                .into_query()
                .is_err()
        );
        assert!(
            AttributeParams { sort_direction: Some("sideways".into()), ..params() }
                .into_query()
                .is_err()
        );
        assert!(AttributeParams { page: Some(0), ..params() }.into_query().is_err());
        assert!(
            AttributeParams { page_size: Some(5000), ..params() }
                .into_query()
                .is_err()
        );
    }

    #[test]
    fn filters_parse_into_typed_query() {
        let q = AttributeParams {
            signal_type: Some("span".into()),
            scope: Some("resource".into()),
            min_cardinality: Some(50),
            sort_by: Some("cardinality".into()),
            sort_direction: Some("desc".into()),
            ..params()
        }
        .into_query()
        .unwrap();
        assert_eq!(q.signal_type, Some(SignalType::Span));
        assert_eq!(q.scope, Some(AttributeScope::Resource));
        assert_eq!(q.min_cardinality, Some(50));
        assert_eq!(q.sort_by, AttributeSort::Cardinality);
        assert!(q.descending);
    }
}
