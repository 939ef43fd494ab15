use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::core::time::format_primitive;
use crate::db::models::Course;
use crate::services::storage::BlobStore;

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct CourseCreate {
    #[validate(length(min = 1, max = 255, message = "The name field is required."))]
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) description: Option<String>,
    #[serde(default)]
    #[validate(length(max = 255, message = "The teacher may not be greater than 255 characters."))]
    pub(crate) teacher: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct CourseUpdate {
    #[serde(default)]
    #[validate(length(min = 1, max = 255, message = "The name field is required."))]
    pub(crate) name: Option<String>,
    #[serde(default)]
    pub(crate) description: Option<String>,
    #[serde(default)]
    #[validate(length(max = 255, message = "The teacher may not be greater than 255 characters."))]
    pub(crate) teacher: Option<String>,
    /// New image order; keys left out are deleted.
    #[serde(default)]
    pub(crate) images: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub(crate) struct CourseImage {
    pub(crate) key: String,
    pub(crate) url: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct CourseResponse {
    pub(crate) id: i64,
    pub(crate) name: String,
    pub(crate) description: String,
    pub(crate) teacher: String,
    pub(crate) images: Vec<CourseImage>,
    pub(crate) created_at: String,
    pub(crate) updated_at: String,
}

impl CourseResponse {
    pub(crate) fn from_db(course: Course, storage: &dyn BlobStore) -> Self {
        let images = course
            .images
            .0
            .into_iter()
            .map(|key| CourseImage { url: storage.public_url(&key), key })
            .collect();
        Self {
            id: course.id,
            name: course.name,
            description: course.description,
            teacher: course.teacher,
            images,
            created_at: format_primitive(course.created_at),
            updated_at: format_primitive(course.updated_at),
        }
    }
}

/// Entry of the public category list.
#[derive(Debug, Serialize)]
pub(crate) struct CourseOption {
    pub(crate) id: i64,
    pub(crate) name: String,
}
