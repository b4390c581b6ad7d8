//! config-show and config-init commands

use camino::Utf8PathBuf;
use clap::Parser;
use color_eyre::{eyre::Context as _, Result};
use indoc::indoc;

use crate::config::Config;
use crate::errors::CyrisError;

/// Options for config-show
#[derive(Debug, Parser)]
pub struct ConfigShowOpts {
    /// Output format (yaml or json)
    #[clap(long, default_value = "yaml")]
    pub format: String,
}

/// Options for config-init
#[derive(Debug, Parser)]
pub struct ConfigInitOpts {
    /// Where to write the seed file
    #[clap(long, default_value = "config.yml")]
    pub output: Utf8PathBuf,

    /// Overwrite an existing file
    #[clap(long, short = 'f')]
    pub force: bool,
}

/// Commented seed configuration.
const SEED_CONFIG: &str = indoc! {r#"
    # cyris configuration
    # Every key can also be set through the environment as CYRIS_<KEY>.

    # Install root and range state directory
    cyris_path: .
    cyber_range_dir: cyber_range

    # Hypervisor connection
    libvirt_uri: qemu:///system

    # Gateway/tunnel mode for entry point access
    gw_mode: false
    # gw_account: gateway
    # gw_mgmt_addr: 172.16.1.7
    # gw_inside_addr: 10.10.0.1

    # Optional creation notifications
    # user_email: trainer@example.com

    # SSH behavior
    ssh_timeout: 30
    ssh_retry_count: 3
    ssh_retry_delay: 5

    # IP discovery
    ip_discovery_timeout: 180
    ip_cache_ttl: 60

    # Concurrency caps
    parallel_ssh_concurrency: 50
    image_distribution_concurrency: 4
"#};

/// Execute config-show: print the effective merged configuration.
pub fn run_show(config: &Config, opts: ConfigShowOpts) -> Result<()> {
    match opts.format.as_str() {
        "yaml" => println!(
            "{}",
            serde_yaml::to_string(config).context("Serialize config as YAML")?
        ),
        "json" => println!(
            "{}",
            serde_json::to_string_pretty(config).context("Serialize config as JSON")?
        ),
        other => {
            return Err(CyrisError::Config(format!("unsupported format {:?}", other)).into())
        }
    }
    Ok(())
}

/// Execute config-init: seed a commented configuration file.
pub fn run_init(opts: ConfigInitOpts) -> Result<()> {
    if opts.output.exists() && !opts.force {
        return Err(CyrisError::Config(format!(
            "{} already exists (use --force to overwrite)",
            opts.output
        ))
        .into());
    }
    std::fs::write(opts.output.as_std_path(), SEED_CONFIG)
        .with_context(|| format!("Failed to write {}", opts.output))?;
    println!("Wrote {}", opts.output);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8Path;

    #[test]
    fn test_seed_config_parses_back() {
        let config = Config::parse_legacy_ini(""); // defaults
        assert!(config.is_ok());
        let parsed: Config = serde_yaml::from_str(SEED_CONFIG).unwrap();
        assert_eq!(parsed.libvirt_uri, "qemu:///system");
        assert_eq!(parsed.ssh_retry_count, 3);
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn test_init_respects_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let output = Utf8Path::from_path(dir.path()).unwrap().join("config.yml");
        std::fs::write(output.as_std_path(), "cyber_range_dir: /elsewhere\n").unwrap();

        let err = run_init(ConfigInitOpts {
            output: output.clone(),
            force: false,
        })
        .unwrap_err();
        assert!(err.to_string().contains("already exists"), "{err}");

        run_init(ConfigInitOpts {
            output: output.clone(),
            force: true,
        })
        .unwrap();
        let written = std::fs::read_to_string(output.as_std_path()).unwrap();
        assert!(written.contains("cyber_range_dir: cyber_range"));
    }
}
