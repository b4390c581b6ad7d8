//! ssh-info command - ready-to-use SSH snippets for entry points

use clap::Parser;
use color_eyre::Result;

use crate::config::Config;
use crate::errors::CyrisError;
use crate::range::{MetadataStore, RangeMetadata};

/// Options for the ssh-info command
#[derive(Debug, Parser)]
pub struct SshInfoOpts {
    /// Range to print access information for
    pub range_id: String,
}

/// Execute the ssh-info command.
pub fn run(config: &Config, opts: SshInfoOpts) -> Result<()> {
    let store = MetadataStore::new(&config.metadata_path());
    let metadata = store
        .get(&opts.range_id)?
        .ok_or_else(|| CyrisError::Config(format!("unknown range {:?}", opts.range_id)))?;

    let snippets = snippets_for(config, &metadata);
    if snippets.is_empty() {
        println!(
            "Range {} has no entry point guests with assigned addresses",
            opts.range_id
        );
        return Ok(());
    }

    println!("# SSH access for range {}", opts.range_id);
    for snippet in snippets {
        println!("{}", snippet);
    }
    Ok(())
}

/// Build one snippet per entry-point guest with a known address. When
/// gateway mode is on, access goes through the gateway as a jump host.
pub fn snippets_for(config: &Config, metadata: &RangeMetadata) -> Vec<String> {
    let assignments = metadata.ip_assignments();
    let entry_points: Vec<String> = metadata
        .tags
        .get("entry_points")
        .and_then(|v| v.as_array())
        .map(|list| {
            list.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    let ssh_users = metadata.tags.get("ssh_users").and_then(|v| v.as_object());

    let jump = if config.gw_mode {
        match (&config.gw_account, &config.gw_mgmt_addr) {
            (Some(account), Some(addr)) => Some(format!("{}@{}", account, addr)),
            _ => None,
        }
    } else {
        None
    };

    let mut snippets = Vec::new();
    for vm_name in &entry_points {
        let Some(ip) = assignments
            .iter()
            .find(|(key, _)| key.starts_with(&format!("{}.", vm_name)))
            .map(|(_, ip)| ip.clone())
        else {
            continue;
        };
        let user = ssh_users
            .and_then(|users| users.get(vm_name))
            .and_then(|v| v.as_str())
            .unwrap_or("root");
        let snippet = match jump {
            Some(ref jump) => format!("ssh -J {} {}@{}    # {}", jump, user, ip, vm_name),
            None => format!("ssh {}@{}    # {}", user, ip, vm_name),
        };
        snippets.push(snippet);
    }
    snippets
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata_with_entry_point() -> RangeMetadata {
        let mut metadata = RangeMetadata::new("r1", "one");
        metadata.tags.insert(
            "ip_assignments".to_string(),
            serde_json::json!({ "cyris-desktop-aaa.eth0": "192.168.10.2" }),
        );
        metadata.tags.insert(
            "entry_points".to_string(),
            serde_json::json!(["cyris-desktop-aaa"]),
        );
        metadata.tags.insert(
            "ssh_users".to_string(),
            serde_json::json!({ "cyris-desktop-aaa": "trainee" }),
        );
        metadata
    }

    #[test]
    fn test_plain_snippet() {
        let config = Config::default();
        let snippets = snippets_for(&config, &metadata_with_entry_point());
        assert_eq!(snippets.len(), 1);
        assert!(snippets[0].starts_with("ssh trainee@192.168.10.2"), "{}", snippets[0]);
        assert!(snippets[0].contains("cyris-desktop-aaa"));
    }

    #[test]
    fn test_gateway_mode_adds_jump_host() {
        let mut config = Config::default();
        config.gw_mode = true;
        config.gw_account = Some("gateway".to_string());
        config.gw_mgmt_addr = Some("172.16.1.7".to_string());

        let snippets = snippets_for(&config, &metadata_with_entry_point());
        assert!(snippets[0].contains("-J gateway@172.16.1.7"), "{}", snippets[0]);
    }

    #[test]
    fn test_no_entry_points() {
        let config = Config::default();
        let metadata = RangeMetadata::new("r1", "one");
        assert!(snippets_for(&config, &metadata).is_empty());
    }
}
