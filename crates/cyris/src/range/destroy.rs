//! Range teardown and removal
//!
//! Destroy consumes the resource inventory (never the description), so it
//! works after a mid-create crash, and every step tolerates resources that
//! are already gone: `destroy; destroy` is equivalent to `destroy`.
//! Removal deletes the range directory and metadata, and garbage-collects
//! built base images once nothing references them.

use clap::Parser;
use color_eyre::{eyre::Context as _, Result};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::Config;
use crate::elevate::PrivilegedExecutor;
use crate::errors::CyrisError;
use crate::ledger::{Ledger, OpContext};
use crate::libvirt::{Connection, ConnectionPool};
use crate::range::{MetadataStore, RangeStatus};
use crate::resources::{RangeResources, ResourceTracker};
use crate::topology;

/// How long a guest gets to shut down before the plug is pulled.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Options for the destroy command
#[derive(Debug, Parser)]
pub struct DestroyOpts {
    /// Range to tear down
    pub range_id: String,

    /// Proceed even when metadata is missing or the state is unexpected
    #[clap(long, short = 'f')]
    pub force: bool,

    /// Also remove metadata and the range directory afterwards
    #[clap(long)]
    pub rm: bool,
}

/// Options for the rm command
#[derive(Debug, Parser)]
pub struct RmOpts {
    /// Range whose metadata to remove
    pub range_id: String,

    /// Remove even when the range is not DESTROYED
    #[clap(long, short = 'f')]
    pub force: bool,
}

/// Execute the destroy command.
pub fn run(config: &Config, opts: DestroyOpts) -> Result<()> {
    let ledger = Ledger::global();
    ledger.set_base_dir(&config.cyber_range_dir);
    let metadata_store = MetadataStore::new(&config.metadata_path());
    let tracker = ResourceTracker::new(&config.resources_path());
    let connection = ConnectionPool::global().connect(&config.libvirt_uri);

    let metadata = metadata_store.get(&opts.range_id)?;
    match metadata {
        None if !opts.force => {
            return Err(CyrisError::Config(format!(
                "unknown range {:?} (use --force to tear down by scan)",
                opts.range_id
            ))
            .into());
        }
        Some(ref m) if m.status == RangeStatus::Destroyed => {
            debug!(range = %opts.range_id, "already destroyed");
            if opts.rm {
                return remove_range(config, &opts.range_id, true);
            }
            return Ok(());
        }
        _ => {}
    }

    if metadata.is_some() {
        metadata_store.update_status(&opts.range_id, RangeStatus::Destroying)?;
    }

    let resources = match tracker.get(&opts.range_id)? {
        Some(resources) => resources,
        None => {
            debug!(range = %opts.range_id, "no inventory; falling back to scan");
            tracker.scan_fallback(&connection, &opts.range_id)
        }
    };

    teardown(&connection, &opts.range_id, &resources)?;

    if metadata.is_some() {
        metadata_store.update_status(&opts.range_id, RangeStatus::Destroyed)?;
    }
    ledger.log_line(Some(&opts.range_id), "Range destroyed");
    ledger.close_range(&opts.range_id);

    if opts.rm {
        remove_range(config, &opts.range_id, true)?;
    }
    Ok(())
}

/// Tear down every recorded resource, newest class first: guests, then
/// policy, then networks, then files.
fn teardown(
    connection: &Connection,
    range_id: &str,
    resources: &RangeResources,
) -> Result<()> {
    let ledger = Ledger::global();
    let elevate = PrivilegedExecutor::new();
    let ctx = OpContext::for_range("destroy", range_id).ignoring_errors();

    for domain in &resources.domains {
        if !connection.domain_exists(domain) {
            continue;
        }
        stop_domain_gracefully(connection, &ctx, domain);
        let _ = connection.undefine_domain(ledger, &ctx, domain);
    }

    if let Some(ref chain) = resources.firewall_chain {
        topology::revert_firewall(ledger, &elevate, &ctx, chain);
    }

    for network in &resources.networks {
        let _ = connection.destroy_network(ledger, &ctx, network);
    }

    for path in resources.overlays.iter().chain(resources.isos.iter()) {
        match std::fs::remove_file(path.as_std_path()) {
            Ok(()) => debug!(%path, "removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                ledger.log_line(Some(range_id), &format!("could not remove {}: {}", path, e));
            }
        }
    }

    Ok(())
}

fn stop_domain_gracefully(connection: &Connection, ctx: &OpContext, domain: &str) {
    let ledger = Ledger::global();
    match connection.domain_state(domain) {
        Ok(state) if state == "running" => {
            let _ = connection.shutdown_domain(ledger, ctx, domain);
            let waited = Instant::now();
            while waited.elapsed() < SHUTDOWN_GRACE {
                match connection.domain_state(domain) {
                    Ok(state) if state != "running" => return,
                    Ok(_) => std::thread::sleep(Duration::from_secs(2)),
                    Err(_) => return, // transient domain vanished on shutdown
                }
            }
            debug!(domain, "graceful shutdown timed out, destroying");
            let _ = connection.destroy_domain(ledger, ctx, domain);
        }
        Ok(_) => {}
        Err(_) => {}
    }
}

/// Execute the rm command.
pub fn run_rm(config: &Config, opts: RmOpts) -> Result<()> {
    let metadata_store = MetadataStore::new(&config.metadata_path());
    match metadata_store.get(&opts.range_id)? {
        Some(metadata) if metadata.status != RangeStatus::Destroyed && !opts.force => {
            Err(CyrisError::Config(format!(
                "range {} is {}, not destroyed (use --force to remove anyway)",
                opts.range_id, metadata.status
            ))
            .into())
        }
        None if !opts.force => Err(CyrisError::Config(format!(
            "unknown range {:?}",
            opts.range_id
        ))
        .into()),
        _ => remove_range(config, &opts.range_id, opts.force),
    }
}

/// Delete metadata, inventory and the range directory; garbage-collect
/// base images nothing references anymore.
fn remove_range(config: &Config, range_id: &str, _force: bool) -> Result<()> {
    let metadata_store = MetadataStore::new(&config.metadata_path());
    let tracker = ResourceTracker::new(&config.resources_path());

    if let Some(resources) = tracker.get(range_id)? {
        for image in &resources.base_images {
            if tracker.image_still_referenced(image, range_id)? {
                debug!(%image, "kept: still referenced by another range");
                continue;
            }
            match std::fs::remove_file(image.as_std_path()) {
                Ok(()) => debug!(%image, "garbage-collected base image"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => debug!(%image, "could not remove base image: {e}"),
            }
        }
    }

    let range_dir = config.range_dir(range_id);
    if range_dir.exists() {
        std::fs::remove_dir_all(range_dir.as_std_path())
            .with_context(|| format!("Failed to remove range directory {}", range_dir))?;
    }
    tracker.remove_range(range_id)?;
    // REMOVED deletes the entry rather than storing a terminal state
    metadata_store.remove(range_id)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::RangeMetadata;
    use camino::Utf8Path;

    fn test_config(dir: &tempfile::TempDir) -> Config {
        let mut config = Config::default();
        config.cyber_range_dir = Utf8Path::from_path(dir.path()).unwrap().join("cyber_range");
        config
    }

    #[test]
    fn test_rm_requires_destroyed_state() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let store = MetadataStore::new(&config.metadata_path());

        let mut metadata = RangeMetadata::new("r1", "one");
        metadata.status = RangeStatus::Active;
        store.upsert(metadata).unwrap();

        let err = run_rm(
            &config,
            RmOpts {
                range_id: "r1".to_string(),
                force: false,
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("not destroyed"), "{err}");

        // Force overrides the guard
        run_rm(
            &config,
            RmOpts {
                range_id: "r1".to_string(),
                force: true,
            },
        )
        .unwrap();
        assert!(store.get("r1").unwrap().is_none());
    }

    #[test]
    fn test_rm_of_destroyed_range_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let store = MetadataStore::new(&config.metadata_path());
        let tracker = ResourceTracker::new(&config.resources_path());

        let mut metadata = RangeMetadata::new("r2", "two");
        metadata.status = RangeStatus::Destroyed;
        store.upsert(metadata).unwrap();

        let range_dir = config.range_dir("r2");
        std::fs::create_dir_all(range_dir.as_std_path()).unwrap();
        std::fs::write(range_dir.join("status").as_std_path(), "SUCCESS\n").unwrap();
        tracker
            .record("r2", |r| r.domains.push("cyris-x-000000000000".into()))
            .unwrap();

        run_rm(
            &config,
            RmOpts {
                range_id: "r2".to_string(),
                force: false,
            },
        )
        .unwrap();

        assert!(store.get("r2").unwrap().is_none());
        assert!(tracker.get("r2").unwrap().is_none());
        assert!(!range_dir.exists());
    }

    #[test]
    fn test_rm_unknown_range() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let err = run_rm(
            &config,
            RmOpts {
                range_id: "ghost".to_string(),
                force: false,
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown range"), "{err}");
    }

    #[test]
    fn test_base_image_gc_respects_references() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let tracker = ResourceTracker::new(&config.resources_path());
        let store = MetadataStore::new(&config.metadata_path());

        let image_dir = config.image_cache_dir();
        std::fs::create_dir_all(image_dir.as_std_path()).unwrap();
        let image = image_dir.join("ubuntu-20.04-abc.qcow2");
        std::fs::write(image.as_std_path(), b"img").unwrap();

        for range in ["r1", "r2"] {
            let mut m = RangeMetadata::new(range, range);
            m.status = RangeStatus::Destroyed;
            store.upsert(m).unwrap();
            tracker
                .record(range, |r| r.base_images.push(image.clone()))
                .unwrap();
        }

        // r1 removed: image survives because r2 still references it
        remove_range(&config, "r1", false).unwrap();
        assert!(image.exists());

        // r2 removed: last reference gone, image collected
        remove_range(&config, "r2", false).unwrap();
        assert!(!image.exists());
    }
}
