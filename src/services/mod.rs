pub(crate) mod access_control;
pub(crate) mod allocator;
pub(crate) mod artifacts;
pub(crate) mod documents;
pub(crate) mod lifecycle;
pub(crate) mod listing;
pub(crate) mod qr;
pub(crate) mod storage;
