//! Acquisition and preparation pipeline for sparse gene-expression count
//! matrices: providers discover and fetch candidate matrices from a backing
//! source, the preparer unpacks, repairs, downsamples, and partitions them
//! by protocol label before downstream summarization.

pub mod config;
pub mod domain;
pub mod error;
pub mod fs_util;
pub mod mtx;
pub mod object_store;
pub mod pipeline;
pub mod preparer;
pub mod provider;
pub mod providers;
pub mod service;
pub mod tsv;
