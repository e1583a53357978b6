mod kv_entry;

pub(crate) use kv_entry::datetime_to_millis;
pub use kv_entry::KvEntryRow;
