//! Durable background publication of locally authored journal entries.
//!
//! Drafts are committed into a SQLite staging store; the [`registrar`] walks
//! that store on a fixed interval, uploads route media and thumbnails to blob
//! storage, and creates or updates the entry through the remote API.

pub mod config;
pub mod db;
pub mod gateway;
pub mod media;
pub mod model;
pub mod registrar;
pub mod storage;

use anyhow::{Context, Result};
use std::sync::Arc;

/// Build the production collaborators from configuration.
pub fn services_from_config(cfg: &config::Config) -> Result<registrar::Services> {
    let timeout = cfg.app.request_timeout();
    let endpoint = reqwest::Url::parse(&cfg.api.endpoint).context("invalid api.endpoint")?;
    let base_url = reqwest::Url::parse(&cfg.storage.base_url).context("invalid storage.base_url")?;

    let gateway = gateway::GraphqlGateway::new(endpoint, cfg.api.token.clone(), timeout)?;
    let blobs = storage::HttpBlobStore::new(base_url, cfg.storage.token.clone(), timeout)?;
    let media = media::DirectoryMediaLibrary::new(cfg.media.resolved_library_dir());

    Ok(registrar::Services {
        gateway: Arc::new(gateway),
        blobs: Arc::new(blobs),
        media: Arc::new(media),
        request_timeout: timeout,
    })
}
