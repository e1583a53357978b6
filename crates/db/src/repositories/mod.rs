mod kv_repository;

pub use kv_repository::KvRepository;
