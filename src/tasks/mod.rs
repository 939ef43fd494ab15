pub(crate) mod housekeeping;
pub(crate) mod scheduler;
