use sqlx::PgPool;

use crate::db::models::StudentRecord;
use crate::repositories::students::{self, ListParams};

pub(crate) const DEFAULT_PER_PAGE: i64 = 10;
pub(crate) const MAX_PER_PAGE: i64 = 100;

#[derive(Debug, Clone, Default)]
pub(crate) struct ListQuery {
    pub(crate) search: Option<String>,
    /// Course filter; `0` means all courses.
    pub(crate) course_id: Option<i64>,
    pub(crate) page: Option<i64>,
    pub(crate) per_page: Option<i64>,
    pub(crate) include_unissued: bool,
}

#[derive(Debug)]
pub(crate) struct Page<T> {
    pub(crate) items: Vec<T>,
    pub(crate) total: i64,
    pub(crate) page: i64,
    pub(crate) per_page: i64,
}

impl<T> Page<T> {
    pub(crate) fn last_page(&self) -> i64 {
        ((self.total + self.per_page - 1) / self.per_page).max(1)
    }

    /// 1-based position of the first item, `None` on an empty page.
    pub(crate) fn from(&self) -> Option<i64> {
        (!self.items.is_empty()).then(|| page_offset(self.page, self.per_page).saturating_add(1))
    }

    pub(crate) fn to(&self) -> Option<i64> {
        self.from().map(|from| from.saturating_add(self.items.len() as i64 - 1))
    }

    pub(crate) fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
            page: self.page,
            per_page: self.per_page,
        }
    }
}

/// Rows to skip before `page`. Saturates, so absurd page numbers give an empty page.
pub(crate) fn page_offset(page: i64, per_page: i64) -> i64 {
    (page - 1).saturating_mul(per_page)
}

pub(crate) fn normalize_page(page: Option<i64>, per_page: Option<i64>) -> (i64, i64) {
    let page = page.unwrap_or(1).max(1);
    let per_page = per_page.unwrap_or(DEFAULT_PER_PAGE).clamp(1, MAX_PER_PAGE);
    (page, per_page)
}

fn normalize_search(search: Option<String>) -> Option<String> {
    search.map(|value| value.trim().to_string()).filter(|value| !value.is_empty())
}

/// One page of students ordered newest first. Without `include_unissued`
/// only rows with issued artifacts are visible.
pub(crate) async fn list_students(
    pool: &PgPool,
    query: ListQuery,
) -> Result<Page<StudentRecord>, sqlx::Error> {
    let (page, per_page) = normalize_page(query.page, query.per_page);
    let params = ListParams {
        search: normalize_search(query.search),
        course_id: query.course_id.filter(|id| *id != 0),
        issued_only: !query.include_unissued,
        offset: page_offset(page, per_page),
        limit: per_page,
    };

    let total = students::count(pool, &params).await?;
    let items = students::list(pool, &params).await?;
    Ok(Page { items, total, page, per_page })
}
