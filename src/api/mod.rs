pub(crate) mod auth;
pub(crate) mod certificates;
pub(crate) mod courses;
pub(crate) mod documents;
pub(crate) mod errors;
pub(crate) mod guards;
pub(crate) mod handlers;
pub(crate) mod pagination;
pub(crate) mod roles;
pub(crate) mod router;
pub(crate) mod students;
pub(crate) mod users;
pub(crate) mod validation;
