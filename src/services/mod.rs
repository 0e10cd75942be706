pub mod local_storage;
pub mod s3_storage;
pub mod storage_service;
