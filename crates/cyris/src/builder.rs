//! Base image building and customization
//!
//! The kvm-auto path builds one base qcow2 per unique (image name, disk
//! size, build-time tasks) combination. Account tasks are applied with the
//! customize tool inside the image, which is both faster than a boot-and-
//! configure cycle and immune to boot races. Built images are cached by a
//! content hash of all build inputs; a second range with the same inputs
//! reuses the image without invoking the builder again. Builds for
//! distinct keys are serialized to keep the cache directory and the
//! privileged tool uncontended; distribution to remote hosts is parallel.

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::{eyre::Context as _, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::{Mutex, OnceLock};
use tracing::debug;

use crate::elevate::PrivilegedExecutor;
use crate::errors::CyrisError;
use crate::ledger::{Ledger, OpContext, OpKind};
use crate::parallel;
use crate::ssh_exec::{SshExecutor, SshTarget};
use crate::tasks::{AddAccountSpec, ModifyAccountSpec, Task};

/// Build inputs hashed into the cache key.
#[derive(Debug, Serialize)]
struct BuildInputs<'a> {
    image_name: &'a str,
    disk_size: &'a str,
    build_tasks: &'a [BuildTimeTask],
    version: u32,
}

/// Build-time task subset: only account tasks run inside the image.
#[derive(Debug, Clone, Serialize)]
pub enum BuildTimeTask {
    /// Create an account inside the image
    AddAccount(AddAccountSpec),
    /// Change an account inside the image
    ModifyAccount(ModifyAccountSpec),
}

/// Extract the build-time subset of a guest's task list.
pub fn build_time_tasks(tasks: &[Task]) -> Vec<BuildTimeTask> {
    tasks
        .iter()
        .filter_map(|task| match task {
            Task::AddAccount(spec) => Some(BuildTimeTask::AddAccount(spec.clone())),
            Task::ModifyAccount(spec) => Some(BuildTimeTask::ModifyAccount(spec.clone())),
            _ => None,
        })
        .collect()
}

/// Content hash (12 hex chars) over all build inputs.
pub fn cache_key(image_name: &str, disk_size: &str, build_tasks: &[BuildTimeTask]) -> String {
    let inputs = BuildInputs {
        image_name,
        disk_size,
        build_tasks,
        version: 1,
    };
    let json = serde_json::to_string(&inputs).expect("build inputs serialize");
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..12].to_string()
}

/// Cached image path for a build key.
pub fn image_path(cache_dir: &Utf8Path, image_name: &str, key: &str) -> Utf8PathBuf {
    cache_dir.join(format!("{}-{}.qcow2", image_name, key))
}

/// virt-customize arguments for the build-time tasks.
pub fn customize_args(image: &Utf8Path, build_tasks: &[BuildTimeTask]) -> Vec<String> {
    let mut args = vec!["-a".to_string(), image.to_string()];
    for task in build_tasks {
        match task {
            BuildTimeTask::AddAccount(spec) => {
                args.push("--run-command".to_string());
                args.push(format!(
                    "id {account} >/dev/null 2>&1 || useradd -m -s /bin/bash {account}",
                    account = spec.account
                ));
                args.push("--password".to_string());
                args.push(format!("{}:password:{}", spec.account, spec.passwd));
                if !spec.groups.is_empty() {
                    args.push("--run-command".to_string());
                    args.push(format!(
                        "usermod -aG {} {}",
                        spec.groups.join(","),
                        spec.account
                    ));
                }
                if spec.sudo {
                    args.push("--run-command".to_string());
                    args.push(format!(
                        "usermod -aG sudo {account} 2>/dev/null || usermod -aG wheel {account}",
                        account = spec.account
                    ));
                }
            }
            BuildTimeTask::ModifyAccount(spec) => {
                if let Some(ref new_account) = spec.new_account {
                    args.push("--run-command".to_string());
                    args.push(format!(
                        "usermod -l {} -d /home/{} -m {}",
                        new_account, new_account, spec.account
                    ));
                }
                if let Some(ref new_passwd) = spec.new_passwd {
                    let account = spec.new_account.as_deref().unwrap_or(&spec.account);
                    args.push("--password".to_string());
                    args.push(format!("{}:password:{}", account, new_passwd));
                }
            }
        }
    }
    args
}

/// Builder pipeline: build, customize, distribute.
#[derive(Debug)]
pub struct ImageBuilder<'a> {
    cache_dir: Utf8PathBuf,
    elevate: &'a PrivilegedExecutor,
    ledger: &'static Ledger,
    /// Serializes builder invocations across keys.
    build_lock: Mutex<()>,
}

/// Image names known to the builder tool, fetched once per process.
static BUILDER_IMAGE_LIST: OnceLock<Vec<String>> = OnceLock::new();

impl<'a> ImageBuilder<'a> {
    /// Builder rooted at the given image cache directory.
    pub fn new(cache_dir: &Utf8Path, elevate: &'a PrivilegedExecutor) -> Self {
        Self {
            cache_dir: cache_dir.to_owned(),
            elevate,
            ledger: Ledger::global(),
            build_lock: Mutex::new(()),
        }
    }

    /// The builder tool's image list is the source of truth for valid
    /// image names; consulted before any long-running step.
    pub fn validate_image_name(&self, image_name: &str) -> Result<()> {
        let list = BUILDER_IMAGE_LIST.get_or_init(|| {
            let output = std::process::Command::new("virt-builder")
                .args(["--list", "--list-format", "short"])
                .output();
            match output {
                Ok(output) if output.status.success() => {
                    String::from_utf8_lossy(&output.stdout)
                        .lines()
                        .map(|l| l.trim().to_string())
                        .filter(|l| !l.is_empty())
                        .collect()
                }
                _ => Vec::new(),
            }
        });
        if list.is_empty() {
            return Err(CyrisError::Environment(
                "virt-builder is not available or lists no images".into(),
            )
            .into());
        }
        if !list.iter().any(|known| known == image_name) {
            return Err(CyrisError::Config(format!(
                "image_name {:?} is not known to the builder (see virt-builder --list)",
                image_name
            ))
            .into());
        }
        Ok(())
    }

    /// Build (or reuse) the base image for one key. Returns the image
    /// path. Exactly one builder invocation happens per unique key per
    /// cache lifetime.
    pub fn build(
        &self,
        ctx: &OpContext,
        image_name: &str,
        disk_size: &str,
        build_tasks: &[BuildTimeTask],
    ) -> Result<Utf8PathBuf> {
        let key = cache_key(image_name, disk_size, build_tasks);
        let path = image_path(&self.cache_dir, image_name, &key);

        if path.exists() {
            debug!(%path, "image cache hit");
            self.ledger
                .log_line(ctx.range_id.as_deref(), &format!("Using cached image {}", path));
            return Ok(path);
        }

        // One build at a time: the qcow2 cache and the privileged tool do
        // not tolerate concurrent builders.
        let _serial = self.build_lock.lock().expect("build lock poisoned");
        if path.exists() {
            return Ok(path);
        }

        std::fs::create_dir_all(self.cache_dir.as_std_path())
            .with_context(|| format!("Failed to create image cache {}", self.cache_dir))?;

        // Build to a temp name and rename, so a crashed build never looks
        // like a cache hit.
        let partial = self.cache_dir.join(format!("{}-{}.partial", image_name, key));
        let mut cmd = self.elevate.wrap(
            "virt-builder",
            &[
                image_name,
                "--size",
                disk_size,
                "--format",
                "qcow2",
                "-o",
                partial.as_str(),
            ],
        );
        self.ledger.run_logged(&mut cmd, OpKind::Builder, ctx)?;

        if !build_tasks.is_empty() {
            let args = customize_args(&partial, build_tasks);
            let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
            let mut cmd = self.elevate.wrap("virt-customize", &arg_refs);
            self.ledger.run_logged(&mut cmd, OpKind::Builder, ctx)?;
        }

        std::fs::rename(partial.as_std_path(), path.as_std_path())
            .with_context(|| format!("Failed to move built image into place at {}", path))?;
        self.ledger
            .log_line(ctx.range_id.as_deref(), &format!("Built image {}", path));
        Ok(path)
    }

    /// Copy a built image to remote hosts, bounded by the distribution
    /// concurrency cap. The image lands at the same path on every host.
    pub fn distribute(
        &self,
        ctx: &OpContext,
        ssh: &SshExecutor,
        hosts: &[SshTarget],
        image: &Utf8Path,
        concurrency: usize,
    ) -> Result<()> {
        if hosts.is_empty() {
            return Ok(());
        }
        let results = parallel::run_bounded(hosts.to_vec(), concurrency.max(1), |host| {
            let destination = host.destination();
            let result = ssh
                .execute(
                    ctx,
                    &host,
                    &format!("mkdir -p {}", image.parent().unwrap_or(Utf8Path::new("/tmp"))),
                    None,
                    false,
                )
                .and_then(|_| ssh.put(ctx, &host, image, image));
            (destination, result)
        });

        let failures: Vec<String> = results
            .into_iter()
            .filter_map(|(destination, result)| result.err().map(|e| format!("{}: {}", destination, e)))
            .collect();
        if !failures.is_empty() {
            return Err(CyrisError::Ssh(format!(
                "image distribution failed on {} host(s): {}",
                failures.len(),
                failures.join("; ")
            ))
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(account: &str, passwd: &str) -> BuildTimeTask {
        BuildTimeTask::AddAccount(AddAccountSpec {
            account: account.to_string(),
            passwd: passwd.to_string(),
            groups: vec![],
            sudo: false,
            also_runtime: false,
            fatal: false,
        })
    }

    #[test]
    fn test_cache_key_stability() {
        let tasks = vec![account("trainee", "t123")];
        let a = cache_key("ubuntu-20.04", "20G", &tasks);
        let b = cache_key("ubuntu-20.04", "20G", &tasks);
        assert_eq!(a, b);
        assert_eq!(a.len(), 12);
        assert!(a.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn test_cache_key_varies_with_inputs() {
        let tasks = vec![account("trainee", "t123")];
        let base = cache_key("ubuntu-20.04", "20G", &tasks);
        assert_ne!(base, cache_key("ubuntu-22.04", "20G", &tasks));
        assert_ne!(base, cache_key("ubuntu-20.04", "30G", &tasks));
        assert_ne!(
            base,
            cache_key("ubuntu-20.04", "20G", &[account("trainee", "other")])
        );
        assert_ne!(base, cache_key("ubuntu-20.04", "20G", &[]));
    }

    #[test]
    fn test_image_path_shape() {
        let path = image_path(Utf8Path::new("/srv/cyber_range/images"), "ubuntu-20.04", "0a1b2c3d4e5f");
        assert_eq!(
            path,
            Utf8PathBuf::from("/srv/cyber_range/images/ubuntu-20.04-0a1b2c3d4e5f.qcow2")
        );
    }

    #[test]
    fn test_build_time_task_extraction() {
        let tasks = vec![
            Task::AddAccount(AddAccountSpec {
                account: "a".to_string(),
                passwd: "p".to_string(),
                groups: vec![],
                sudo: false,
                also_runtime: false,
                fatal: false,
            }),
            Task::InstallPackage(crate::tasks::InstallPackageSpec {
                name: "curl".to_string(),
                package_manager: None,
                version: None,
                fatal: false,
            }),
        ];
        let build_time = build_time_tasks(&tasks);
        assert_eq!(build_time.len(), 1);
        assert!(matches!(build_time[0], BuildTimeTask::AddAccount(_)));
    }

    #[test]
    fn test_customize_args() {
        let tasks = vec![
            BuildTimeTask::AddAccount(AddAccountSpec {
                account: "trainee".to_string(),
                passwd: "t123".to_string(),
                groups: vec!["developers".to_string()],
                sudo: true,
                also_runtime: false,
                fatal: false,
            }),
            BuildTimeTask::ModifyAccount(ModifyAccountSpec {
                account: "ubuntu".to_string(),
                new_passwd: Some("changed".to_string()),
                new_account: None,
                also_runtime: false,
                fatal: false,
            }),
        ];
        let args = customize_args(Utf8Path::new("/cache/img.qcow2"), &tasks);
        assert_eq!(args[0], "-a");
        assert_eq!(args[1], "/cache/img.qcow2");
        let joined = args.join(" ");
        assert!(joined.contains("useradd -m -s /bin/bash trainee"));
        assert!(joined.contains("trainee:password:t123"));
        assert!(joined.contains("usermod -aG developers trainee"));
        assert!(joined.contains("usermod -aG sudo trainee"));
        assert!(joined.contains("ubuntu:password:changed"));
    }

    #[test]
    fn test_cached_image_skips_builder() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Utf8Path::from_path(dir.path()).unwrap();
        let elevate = PrivilegedExecutor::new();
        let builder = ImageBuilder::new(cache, &elevate);

        // Seed the cache with a file for the exact key
        let key = cache_key("ubuntu-20.04", "20G", &[]);
        let seeded = image_path(cache, "ubuntu-20.04", &key);
        std::fs::write(seeded.as_std_path(), b"qcow2-bytes").unwrap();

        let ctx = OpContext::for_range("base images", "r1");
        let path = builder.build(&ctx, "ubuntu-20.04", "20G", &[]).unwrap();
        assert_eq!(path, seeded);
    }
}
