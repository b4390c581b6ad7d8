//! Per-range resource inventory for robust teardown
//!
//! Every non-trivial resource acquired during creation (domain, overlay,
//! network, ISO, IP reservation, firewall chain) is recorded in
//! `ranges_resources.json` the moment it exists. Destroy reads this
//! inventory instead of re-parsing the description, which keeps teardown
//! working after a mid-create crash. When the inventory is missing a
//! best-effort scan recovers domains and bridges by naming convention.

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::{eyre::Context as _, Result};
use rustix::fs::FlockOperation;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read as _, Seek as _, SeekFrom, Write as _};
use tracing::debug;

use crate::libvirt::Connection;

/// Everything one range acquired.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RangeResources {
    /// Defined domain names
    #[serde(default)]
    pub domains: Vec<String>,
    /// Overlay disk paths
    #[serde(default)]
    pub overlays: Vec<Utf8PathBuf>,
    /// libvirt network (= bridge) names
    #[serde(default)]
    pub networks: Vec<String>,
    /// Seed ISO paths
    #[serde(default)]
    pub isos: Vec<Utf8PathBuf>,
    /// `<vm>.<iface>` to reserved address
    #[serde(default)]
    pub ip_reservations: BTreeMap<String, String>,
    /// Applied per-range iptables chain
    #[serde(default)]
    pub firewall_chain: Option<String>,
    /// Built base images this range's overlays reference
    #[serde(default)]
    pub base_images: Vec<Utf8PathBuf>,
}

type InventoryDocument = BTreeMap<String, RangeResources>;

/// File-backed inventory with advisory locking around mutations.
#[derive(Debug)]
pub struct ResourceTracker {
    path: Utf8PathBuf,
}

impl ResourceTracker {
    /// Tracker over the given inventory document.
    pub fn new(path: &Utf8Path) -> Self {
        Self {
            path: path.to_owned(),
        }
    }

    /// Read the whole document. Readers tolerate a missing file.
    pub fn load(&self) -> Result<InventoryDocument> {
        match std::fs::read_to_string(self.path.as_std_path()) {
            Ok(content) if !content.trim().is_empty() => serde_json::from_str(&content)
                .with_context(|| format!("Corrupt resource inventory at {}", self.path)),
            Ok(_) => Ok(InventoryDocument::new()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(InventoryDocument::new()),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", self.path)),
        }
    }

    /// One range's inventory, if recorded.
    pub fn get(&self, range_id: &str) -> Result<Option<RangeResources>> {
        Ok(self.load()?.remove(range_id))
    }

    /// Mutate one range's entry under an exclusive file lock.
    pub fn record<F>(&self, range_id: &str, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut RangeResources),
    {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent.as_std_path())
                .with_context(|| format!("Failed to create {}", parent))?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.path.as_std_path())
            .with_context(|| format!("Failed to open {}", self.path))?;
        lock_exclusive(&file)?;

        let mut content = String::new();
        file.read_to_string(&mut content)
            .with_context(|| format!("Failed to read {}", self.path))?;
        let mut document: InventoryDocument = if content.trim().is_empty() {
            InventoryDocument::new()
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("Corrupt resource inventory at {}", self.path))?
        };

        mutate(document.entry(range_id.to_string()).or_default());
        write_back(&mut file, &document)?;
        Ok(())
    }

    /// Drop a range's inventory entry entirely.
    pub fn remove_range(&self, range_id: &str) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.path.as_std_path())
            .with_context(|| format!("Failed to open {}", self.path))?;
        lock_exclusive(&file)?;

        let mut content = String::new();
        file.read_to_string(&mut content)?;
        let mut document: InventoryDocument = if content.trim().is_empty() {
            InventoryDocument::new()
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("Corrupt resource inventory at {}", self.path))?
        };
        document.remove(range_id);
        write_back(&mut file, &document)?;
        Ok(())
    }

    /// Whether any other range still references a base image. Backing
    /// images are garbage-collected only when the last referent is gone.
    pub fn image_still_referenced(&self, image: &Utf8Path, excluding_range: &str) -> Result<bool> {
        let document = self.load()?;
        Ok(document
            .iter()
            .filter(|(range_id, _)| range_id.as_str() != excluding_range)
            .any(|(_, resources)| resources.base_images.iter().any(|i| i == image)))
    }

    /// Best-effort discovery when the inventory file is gone: domains
    /// whose metadata names the range, bridges named after it.
    pub fn scan_fallback(&self, connection: &Connection, range_id: &str) -> RangeResources {
        let mut resources = RangeResources::default();

        if let Ok(domains) = connection.list_domains() {
            for domain in domains.iter().filter(|d| d.starts_with("cyris-")) {
                match connection.domain_xml(domain) {
                    Ok(dom) => {
                        let owner = dom
                            .find_metadata("range-id")
                            .map(|n| n.text_content().to_string());
                        if owner.as_deref() == Some(range_id) {
                            resources.domains.push(domain.clone());
                        }
                    }
                    Err(e) => debug!(%domain, "scan could not read domain XML: {e}"),
                }
            }
        }

        let bridge_prefix = format!("cr-br-{}-", range_id);
        if let Ok(networks) = connection.list_networks() {
            resources.networks = networks
                .into_iter()
                .filter(|n| n.starts_with(&bridge_prefix))
                .collect();
        }

        resources
    }
}

fn lock_exclusive(file: &File) -> Result<()> {
    rustix::fs::flock(file, FlockOperation::LockExclusive)
        .context("Failed to lock resource inventory")?;
    Ok(())
}

fn write_back(file: &mut File, document: &InventoryDocument) -> Result<()> {
    let serialized = serde_json::to_string_pretty(document).context("Serialize inventory")?;
    file.seek(SeekFrom::Start(0)).context("Seek inventory")?;
    file.set_len(0).context("Truncate inventory")?;
    file.write_all(serialized.as_bytes())
        .context("Write inventory")?;
    file.flush().context("Flush inventory")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(dir: &tempfile::TempDir) -> ResourceTracker {
        let path = Utf8Path::from_path(dir.path())
            .unwrap()
            .join("ranges_resources.json");
        ResourceTracker::new(&path)
    }

    #[test]
    fn test_record_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(&dir);

        tracker
            .record("r1", |resources| {
                resources.domains.push("cyris-desktop-aaa".to_string());
                resources.networks.push("cr-br-r1-office".to_string());
                resources
                    .ip_reservations
                    .insert("cyris-desktop-aaa.eth0".to_string(), "192.168.10.2".to_string());
            })
            .unwrap();
        tracker
            .record("r1", |resources| {
                resources
                    .overlays
                    .push(Utf8PathBuf::from("/srv/r1/disks/a.qcow2"));
            })
            .unwrap();

        let resources = tracker.get("r1").unwrap().unwrap();
        assert_eq!(resources.domains, vec!["cyris-desktop-aaa"]);
        assert_eq!(resources.networks, vec!["cr-br-r1-office"]);
        assert_eq!(resources.overlays.len(), 1);
        assert_eq!(
            resources.ip_reservations.get("cyris-desktop-aaa.eth0").unwrap(),
            "192.168.10.2"
        );

        assert!(tracker.get("r2").unwrap().is_none());
    }

    #[test]
    fn test_remove_range() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(&dir);
        tracker
            .record("r1", |r| r.domains.push("d1".to_string()))
            .unwrap();
        tracker
            .record("r2", |r| r.domains.push("d2".to_string()))
            .unwrap();

        tracker.remove_range("r1").unwrap();
        assert!(tracker.get("r1").unwrap().is_none());
        assert!(tracker.get("r2").unwrap().is_some());

        // Removing a missing range (or with a missing file) is fine
        tracker.remove_range("r1").unwrap();
        ResourceTracker::new(&Utf8PathBuf::from("/nonexistent/resources.json"))
            .remove_range("rX")
            .unwrap();
    }

    #[test]
    fn test_image_reference_counting() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(&dir);
        let image = Utf8PathBuf::from("/srv/images/ubuntu-20.04-abc.qcow2");

        tracker
            .record("r1", |r| r.base_images.push(image.clone()))
            .unwrap();
        tracker
            .record("r2", |r| r.base_images.push(image.clone()))
            .unwrap();

        assert!(tracker.image_still_referenced(&image, "r1").unwrap());
        tracker.remove_range("r2").unwrap();
        assert!(!tracker.image_still_referenced(&image, "r1").unwrap());
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(&dir);
        assert!(tracker.load().unwrap().is_empty());
    }
}
