//! libvirt integration for cyber range guests
//!
//! Domains and networks are driven through `virsh` against a pooled
//! connection handle. One handle exists per connection URI; handles are
//! reference counted so concurrent workflow phases share them. Every
//! mutation goes through the operation ledger.

use camino::Utf8Path;
use color_eyre::{eyre::Context as _, Result};
use std::collections::HashMap;
use std::io::Write as _;
use std::process::Command;
use std::sync::{Arc, Mutex, OnceLock};

use crate::ledger::{Ledger, OpContext, OpKind};
use crate::xml_utils::{self, XmlNode};

pub mod domain;
pub mod network;
pub mod virt_install;

/// Default hypervisor connection URI.
pub const DEFAULT_URI: &str = "qemu:///system";

/// A pooled connection to one hypervisor URI. Cheap to clone via `Arc`;
/// the pool keeps one instance per URI.
#[derive(Debug)]
pub struct Connection {
    uri: String,
}

impl Connection {
    /// Build a `virsh` command against this connection.
    pub fn virsh(&self) -> Command {
        let mut cmd = Command::new("virsh");
        cmd.arg("-c").arg(&self.uri);
        cmd
    }

    /// The connection URI this handle talks to.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Define a persistent domain from XML.
    pub fn define_domain(&self, ledger: &Ledger, ctx: &OpContext, xml: &str) -> Result<()> {
        let file = write_xml_tempfile(xml)?;
        let mut cmd = self.virsh();
        cmd.arg("define").arg(file.path());
        ledger.run_logged(&mut cmd, OpKind::Hypervisor, ctx)?;
        Ok(())
    }

    /// Start a defined domain.
    pub fn start_domain(&self, ledger: &Ledger, ctx: &OpContext, name: &str) -> Result<()> {
        let mut cmd = self.virsh();
        cmd.args(["start", name]);
        ledger.run_logged(&mut cmd, OpKind::Hypervisor, ctx)?;
        Ok(())
    }

    /// Ask the guest OS to shut down.
    pub fn shutdown_domain(&self, ledger: &Ledger, ctx: &OpContext, name: &str) -> Result<()> {
        let mut cmd = self.virsh();
        cmd.args(["shutdown", name]);
        ledger.run_logged(&mut cmd, OpKind::Hypervisor, ctx)?;
        Ok(())
    }

    /// Pull the plug on a running domain.
    pub fn destroy_domain(&self, ledger: &Ledger, ctx: &OpContext, name: &str) -> Result<()> {
        let mut cmd = self.virsh();
        cmd.args(["destroy", name]);
        ledger.run_logged(&mut cmd, OpKind::Hypervisor, ctx)?;
        Ok(())
    }

    /// Remove a domain definition together with its NVRAM.
    pub fn undefine_domain(&self, ledger: &Ledger, ctx: &OpContext, name: &str) -> Result<()> {
        let mut cmd = self.virsh();
        cmd.args(["undefine", name, "--nvram"]);
        ledger.run_logged(&mut cmd, OpKind::Hypervisor, ctx)?;
        Ok(())
    }

    /// Attach an ISO as a read-only CD-ROM, persisted in the config.
    pub fn attach_iso(
        &self,
        ledger: &Ledger,
        ctx: &OpContext,
        name: &str,
        iso: &Utf8Path,
    ) -> Result<()> {
        let mut cmd = self.virsh();
        cmd.args([
            "attach-disk",
            name,
            iso.as_str(),
            "sdz",
            "--type",
            "cdrom",
            "--mode",
            "readonly",
            "--config",
        ]);
        ledger.run_logged(&mut cmd, OpKind::Hypervisor, ctx)?;
        Ok(())
    }

    /// Current state string of a domain (`running`, `shut off`, ...).
    pub fn domain_state(&self, name: &str) -> Result<String> {
        let output = self
            .virsh()
            .args(["domstate", name])
            .output()
            .with_context(|| format!("Failed to get state for domain '{}'", name))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(color_eyre::eyre::eyre!(
                "Failed to get domain state for '{}': {}",
                name,
                stderr
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Whether a domain with this name is defined at all.
    pub fn domain_exists(&self, name: &str) -> bool {
        self.domain_state(name).is_ok()
    }

    /// All domain names, running and inactive.
    pub fn list_domains(&self) -> Result<Vec<String>> {
        let output = self
            .virsh()
            .args(["list", "--all", "--name"])
            .output()
            .with_context(|| "Failed to run virsh list")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(color_eyre::eyre::eyre!("Failed to list domains: {}", stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect())
    }

    /// All network names known to the hypervisor.
    pub fn list_networks(&self) -> Result<Vec<String>> {
        let output = self
            .virsh()
            .args(["net-list", "--all", "--name"])
            .output()
            .with_context(|| "Failed to run virsh net-list")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(color_eyre::eyre::eyre!("Failed to list networks: {}", stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect())
    }

    /// Parsed `dumpxml` of a domain.
    pub fn domain_xml(&self, name: &str) -> Result<XmlNode> {
        let output = self
            .virsh()
            .args(["dumpxml", name])
            .output()
            .with_context(|| format!("Failed to dump XML for domain '{}'", name))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(color_eyre::eyre::eyre!(
                "Failed to dump XML for '{}': {}",
                name,
                stderr
            ));
        }
        xml_utils::parse_xml_dom(&String::from_utf8_lossy(&output.stdout))
    }

    /// `virsh domifaddr` with a chosen address source.
    pub fn domain_if_addr(&self, name: &str, source: &str) -> Result<String> {
        let output = self
            .virsh()
            .args(["domifaddr", name, "--source", source])
            .output()
            .with_context(|| format!("Failed to query addresses for '{}'", name))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(color_eyre::eyre::eyre!(
                "domifaddr failed for '{}': {}",
                name,
                stderr
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Define and start a network from XML.
    pub fn create_network(&self, ledger: &Ledger, ctx: &OpContext, xml: &str) -> Result<()> {
        let file = write_xml_tempfile(xml)?;
        let mut cmd = self.virsh();
        cmd.arg("net-define").arg(file.path());
        ledger.run_logged(&mut cmd, OpKind::Hypervisor, ctx)?;
        Ok(())
    }

    /// Start a defined network.
    pub fn start_network(&self, ledger: &Ledger, ctx: &OpContext, name: &str) -> Result<()> {
        let mut cmd = self.virsh();
        cmd.args(["net-start", name]);
        ledger.run_logged(&mut cmd, OpKind::Hypervisor, ctx)?;
        Ok(())
    }

    /// Stop and undefine a network. Tolerates a network that is already
    /// gone so teardown stays idempotent.
    pub fn destroy_network(&self, ledger: &Ledger, ctx: &OpContext, name: &str) -> Result<()> {
        let ctx = ctx.clone().ignoring_errors();
        let mut cmd = self.virsh();
        cmd.args(["net-destroy", name]);
        ledger.run_logged(&mut cmd, OpKind::Hypervisor, &ctx)?;
        let mut cmd = self.virsh();
        cmd.args(["net-undefine", name]);
        ledger.run_logged(&mut cmd, OpKind::Hypervisor, &ctx)?;
        Ok(())
    }
}

/// Process-wide connection pool, one handle per URI.
#[derive(Debug)]
pub struct ConnectionPool {
    connections: Mutex<HashMap<String, Arc<Connection>>>,
}

static POOL: OnceLock<ConnectionPool> = OnceLock::new();

impl ConnectionPool {
    /// An empty pool.
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// The process-wide pool, created on first use.
    pub fn global() -> &'static ConnectionPool {
        POOL.get_or_init(ConnectionPool::new)
    }

    /// Get (or create) the shared handle for a URI.
    pub fn connect(&self, uri: &str) -> Arc<Connection> {
        let mut connections = self.connections.lock().expect("pool poisoned");
        connections
            .entry(uri.to_string())
            .or_insert_with(|| {
                Arc::new(Connection {
                    uri: uri.to_string(),
                })
            })
            .clone()
    }

    /// Number of handles currently held for a URI (including the pool's).
    pub fn handle_count(&self, uri: &str) -> usize {
        let connections = self.connections.lock().expect("pool poisoned");
        connections
            .get(uri)
            .map(|c| Arc::strong_count(c))
            .unwrap_or(0)
    }

    /// Drop pool entries no caller references anymore.
    pub fn prune(&self) {
        let mut connections = self.connections.lock().expect("pool poisoned");
        connections.retain(|_, c| Arc::strong_count(c) > 1);
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}

fn write_xml_tempfile(xml: &str) -> Result<tempfile::NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .suffix(".xml")
        .tempfile()
        .context("Failed to create XML temp file")?;
    file.write_all(xml.as_bytes())
        .context("Failed to write XML temp file")?;
    file.flush().context("Failed to flush XML temp file")?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_shares_handles() {
        let pool = ConnectionPool::new();
        let a = pool.connect("qemu:///system");
        let b = pool.connect("qemu:///system");
        assert!(Arc::ptr_eq(&a, &b));
        // two callers + the pool's own entry
        assert_eq!(pool.handle_count("qemu:///system"), 3);

        let c = pool.connect("qemu+ssh://other/system");
        assert!(!Arc::ptr_eq(&a, &c));

        drop(a);
        drop(b);
        pool.prune();
        assert_eq!(pool.handle_count("qemu:///system"), 0);
        assert_eq!(pool.handle_count("qemu+ssh://other/system"), 2);
    }

    #[test]
    fn test_virsh_carries_uri() {
        let pool = ConnectionPool::new();
        let conn = pool.connect("qemu:///session");
        let cmd = conn.virsh();
        let args: Vec<_> = cmd.get_args().map(|a| a.to_str().unwrap()).collect();
        assert_eq!(args, vec!["-c", "qemu:///session"]);
    }
}
