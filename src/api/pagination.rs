use serde::{Deserialize, Serialize};

use crate::services::listing::Page;

#[derive(Debug, Default, Deserialize)]
pub(crate) struct PageParams {
    #[serde(default)]
    pub(crate) search: Option<String>,
    #[serde(default)]
    pub(crate) page: Option<i64>,
    #[serde(default)]
    pub(crate) per_page: Option<i64>,
}

#[derive(Debug, Serialize)]
pub(crate) struct PaginatedResponse<T> {
    pub(crate) items: Vec<T>,
    pub(crate) total: i64,
    pub(crate) page: i64,
    pub(crate) per_page: i64,
    pub(crate) last_page: i64,
    pub(crate) from: Option<i64>,
    pub(crate) to: Option<i64>,
}

impl<T> From<Page<T>> for PaginatedResponse<T> {
    fn from(page: Page<T>) -> Self {
        let (last_page, from, to) = (page.last_page(), page.from(), page.to());
        Self {
            items: page.items,
            total: page.total,
            page: page.page,
            per_page: page.per_page,
            last_page,
            from,
            to,
        }
    }
}
