pub mod archive;
pub mod config;
pub mod domain;
pub mod error;
pub mod extract;
pub mod fetcher;
pub mod keys;
pub mod object_store;
pub mod output;
pub mod pipeline;
pub mod retry;
pub mod staging;
pub mod uploader;
