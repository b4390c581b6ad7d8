//! Cloud-init NoCloud seed image generation
//!
//! kvm-auto guests are imported from prebuilt images; their first-boot
//! configuration (hostname, default credentials, SSH key) arrives on a
//! small NoCloud seed ISO attached as a CD-ROM. The ISO is built by
//! staging `meta-data` and `user-data` into a temporary directory and
//! running `genisoimage` with the volume label cloud-init expects.

use camino::Utf8Path;
use color_eyre::{eyre::Context as _, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::process::Command;
use tracing::debug;

use crate::ledger::{Ledger, OpContext, OpKind};

/// Volume label for the NoCloud datasource.
const SEED_LABEL: &str = "cidata";

/// First-boot configuration rendered into the seed ISO.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloudInitSeed {
    /// Hostname to set in the guest
    pub hostname: String,
    /// Instance id; changing it re-triggers cloud-init
    pub instance_id: String,
    /// Default account to create
    pub account: Option<String>,
    /// Plaintext password for the default account
    pub password: Option<String>,
    /// Authorized SSH public key content
    pub ssh_public_key: Option<String>,
}

impl CloudInitSeed {
    /// Seed for one cloned guest.
    pub fn new(hostname: &str, instance_id: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            instance_id: instance_id.to_string(),
            ..Default::default()
        }
    }

    /// Render the NoCloud `meta-data` document.
    pub fn meta_data(&self) -> String {
        format!(
            "instance-id: {}\nlocal-hostname: {}\n",
            self.instance_id, self.hostname
        )
    }

    /// Render the NoCloud `user-data` document.
    pub fn user_data(&self) -> String {
        let mut doc = String::from("#cloud-config\n");
        doc.push_str(&format!("hostname: {}\n", self.hostname));
        doc.push_str("ssh_pwauth: true\n");
        if let Some(ref account) = self.account {
            doc.push_str("users:\n");
            doc.push_str(&format!("  - name: {}\n", account));
            doc.push_str("    shell: /bin/bash\n");
            doc.push_str("    lock_passwd: false\n");
            doc.push_str("    sudo: ALL=(ALL) NOPASSWD:ALL\n");
            if let Some(ref key) = self.ssh_public_key {
                doc.push_str("    ssh_authorized_keys:\n");
                doc.push_str(&format!("      - {}\n", key.trim()));
            }
            if let Some(ref password) = self.password {
                doc.push_str("chpasswd:\n");
                doc.push_str("  expire: false\n");
                doc.push_str("  list: |\n");
                doc.push_str(&format!("    {}:{}\n", account, password));
            }
        }
        doc
    }

    /// Build the seed ISO at `output`. Returns the output path.
    pub fn write_iso(&self, ledger: &Ledger, ctx: &OpContext, output: &Utf8Path) -> Result<()> {
        let staging = tempfile::tempdir().context("Failed to create seed staging directory")?;
        let staging_path = staging.path();

        fs::write(staging_path.join("meta-data"), self.meta_data())
            .context("Failed to write meta-data")?;
        fs::write(staging_path.join("user-data"), self.user_data())
            .context("Failed to write user-data")?;

        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent))?;
        }

        let mut cmd = Command::new("genisoimage");
        cmd.args(["-output", output.as_str()])
            .args(["-volid", SEED_LABEL])
            .args(["-joliet", "-rock"])
            .arg(staging_path.join("meta-data"))
            .arg(staging_path.join("user-data"));
        ledger.run_logged(&mut cmd, OpKind::Shell, ctx)?;

        debug!(%output, "seed ISO written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_data_layout() {
        let seed = CloudInitSeed::new("cyris-desktop-0011aabbccdd", "r1-desktop-1");
        let meta = seed.meta_data();
        assert_eq!(
            meta,
            "instance-id: r1-desktop-1\nlocal-hostname: cyris-desktop-0011aabbccdd\n"
        );
    }

    #[test]
    fn test_user_data_with_account() {
        let mut seed = CloudInitSeed::new("host", "id-1");
        seed.account = Some("trainee".to_string());
        seed.password = Some("t123".to_string());
        seed.ssh_public_key = Some("ssh-ed25519 AAAA test@cyris\n".to_string());

        let doc = seed.user_data();
        assert!(doc.starts_with("#cloud-config\n"));
        assert!(doc.contains("- name: trainee"));
        assert!(doc.contains("ssh-ed25519 AAAA test@cyris"));
        assert!(doc.contains("trainee:t123"));
        assert!(doc.contains("ssh_pwauth: true"));
    }

    #[test]
    fn test_user_data_without_account() {
        let seed = CloudInitSeed::new("host", "id-1");
        let doc = seed.user_data();
        assert!(!doc.contains("users:"));
        assert!(!doc.contains("chpasswd:"));
    }
}
