//! list command - enumerate ranges with status and addresses

use clap::Parser;
use color_eyre::{eyre::Context as _, Result};
use comfy_table::{presets::UTF8_FULL, Table};

use crate::config::Config;
use crate::range::{MetadataStore, RangeStatus};

/// Options for listing ranges
#[derive(Debug, Parser)]
pub struct ListOpts {
    /// Include destroyed ranges
    #[clap(long, short = 'a')]
    pub all: bool,

    /// Show per-guest IP assignments
    #[clap(long, short = 'v')]
    pub verbose: bool,

    /// Output format (table or json)
    #[clap(long, default_value = "table")]
    pub format: String,
}

/// Execute the list command.
pub fn run(config: &Config, opts: ListOpts) -> Result<()> {
    let store = MetadataStore::new(&config.metadata_path());
    let document = store.load()?;

    let mut ranges: Vec<_> = document
        .into_values()
        .filter(|m| opts.all || m.status != RangeStatus::Destroyed)
        .collect();
    ranges.sort_by(|a, b| a.range_id.cmp(&b.range_id));

    if opts.format == "json" {
        println!(
            "{}",
            serde_json::to_string_pretty(&ranges).context("Serialize ranges as JSON")?
        );
        return Ok(());
    }

    if ranges.is_empty() {
        if opts.all {
            println!("No ranges found");
            println!("Tip: Create one with 'cyris create <description.yml>'");
        } else {
            println!("No active ranges found");
            println!("Use --all to include destroyed ranges");
        }
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    if opts.verbose {
        table.set_header(vec!["RANGE", "STATUS", "CREATED", "GUESTS", "ADDRESSES"]);
    } else {
        table.set_header(vec!["RANGE", "STATUS", "CREATED", "GUESTS"]);
    }

    for metadata in &ranges {
        let assignments = metadata.ip_assignments();
        let guest_count = assignments
            .keys()
            .filter_map(|key| key.rsplit_once('.').map(|(vm, _)| vm))
            .collect::<std::collections::BTreeSet<_>>()
            .len();
        let created = metadata.created_at.format("%Y-%m-%d %H:%M").to_string();
        let status = metadata.status.to_string();
        if opts.verbose {
            let addresses = assignments
                .iter()
                .map(|(key, ip)| format!("{}={}", key, ip))
                .collect::<Vec<_>>()
                .join("\n");
            table.add_row(vec![
                metadata.range_id.clone(),
                status,
                created,
                guest_count.to_string(),
                addresses,
            ]);
        } else {
            table.add_row(vec![
                metadata.range_id.clone(),
                status,
                created,
                guest_count.to_string(),
            ]);
        }
    }

    println!("{table}");
    println!(
        "\nFound {} range{}",
        ranges.len(),
        if ranges.len() == 1 { "" } else { "s" }
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::RangeMetadata;
    use camino::Utf8Path;

    #[test]
    fn test_list_filters_destroyed() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.cyber_range_dir = Utf8Path::from_path(dir.path()).unwrap().to_owned();
        let store = MetadataStore::new(&config.metadata_path());

        let mut active = RangeMetadata::new("r-active", "a");
        active.status = RangeStatus::Active;
        store.upsert(active).unwrap();
        let mut gone = RangeMetadata::new("r-gone", "g");
        gone.status = RangeStatus::Destroyed;
        store.upsert(gone).unwrap();

        // Both variants run without error; filtering is exercised through
        // the store here, rendering is covered by the table library.
        run(
            &config,
            ListOpts {
                all: false,
                verbose: false,
                format: "table".to_string(),
            },
        )
        .unwrap();
        run(
            &config,
            ListOpts {
                all: true,
                verbose: true,
                format: "json".to_string(),
            },
        )
        .unwrap();

        let document = store.load().unwrap();
        let visible: Vec<_> = document
            .values()
            .filter(|m| m.status != RangeStatus::Destroyed)
            .collect();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].range_id, "r-active");
    }
}
