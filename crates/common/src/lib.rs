// eventsync-common: wire and domain types shared by every eventsync crate

pub mod error;
pub mod protocol;
pub mod types;
