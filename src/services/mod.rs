pub mod cleanup;
pub mod hub;
pub mod ingest;
pub mod repository;
pub mod storage;
pub mod worker;
