use std::sync::Arc;

use tokio::select;

use blob_fs::fs::BlobFs;
use blob_fs::remote::Backend;
use blob_fs::remote::local::LocalDirStore;
use blob_fs::remote::memory::MemoryStore;

use crate::app_config::{self, RemoteKind};
use tracing::{debug, error, info};

mod managed_fuse {
    //! fuser only performs a regular unmount when the `BackgroundSession` is dropped. We want to
    //! be aggressive and detach the mount if it is still busy.
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    use nix::errno::Errno;

    use super::{BlobFs, app_config, debug, error};
    use blob_fs::fs::fuser::FuserAdapter;
    use blob_fs::remote::Backend;
    use fuser::BackgroundSession;

    pub struct FuseCoreScope {
        _session: BackgroundSession,
    }

    impl FuseCoreScope {
        fn spawn(
            config: &app_config::Config,
            fs: Arc<BlobFs<Backend>>,
            handle: tokio::runtime::Handle,
        ) -> Result<Self, std::io::Error> {
            let fuse_adapter = FuserAdapter::new(fs, handle);
            let mut mount_opts = vec![
                fuser::MountOption::FSName("blob-fs".to_owned()),
                fuser::MountOption::NoDev,
                fuser::MountOption::Exec,
                fuser::MountOption::AutoUnmount,
                fuser::MountOption::DefaultPermissions,
            ];
            if config.allow_other {
                mount_opts.push(fuser::MountOption::AllowOther);
            }

            Ok(Self {
                _session: fuser::spawn_mount2(fuse_adapter, &config.mount_point, &mount_opts)?,
            })
        }
    }

    pub struct ManagedFuse {
        mount_point: PathBuf,
    }

    impl ManagedFuse {
        pub fn new(config: &app_config::Config) -> Self {
            Self {
                mount_point: config.mount_point.clone(),
            }
        }

        pub fn spawn(
            &self,
            config: &app_config::Config,
            fs: Arc<BlobFs<Backend>>,
            handle: tokio::runtime::Handle,
        ) -> Result<FuseCoreScope, std::io::Error> {
            _ = self; // self used for calling convention.
            FuseCoreScope::spawn(config, fs, handle)
        }
    }

    impl Drop for ManagedFuse {
        fn drop(&mut self) {
            const UMOUNT_ATTEMPT_COUNT: usize = 10;
            const UMOUNT_ATTEMPT_DELAY: Duration = Duration::from_millis(10);

            debug!(mount_point = ?self.mount_point, "Confirming unmount of FUSE filesystem...");

            for i in 0..UMOUNT_ATTEMPT_COUNT {
                let result = {
                    #[cfg(target_os = "macos")]
                    {
                        nix::mount::unmount(&self.mount_point, nix::mount::MntFlags::MNT_FORCE)
                    }

                    #[cfg(target_os = "linux")]
                    {
                        nix::mount::umount2(&self.mount_point, nix::mount::MntFlags::MNT_DETACH)
                    }
                };

                match result {
                    Ok(()) => {
                        debug!(attempt = i + 1, "Unmounted FUSE filesystem.");
                        break;
                    }
                    Err(Errno::EBUSY) => {
                        debug!(attempt = i + 1, "FUSE filesystem still busy. Retrying...");
                        std::thread::sleep(UMOUNT_ATTEMPT_DELAY);
                    }
                    Err(Errno::EINVAL | Errno::ENOENT) => {
                        debug!(attempt = i + 1, "FUSE filesystem already unmounted.");
                        break;
                    }
                    Err(e) => {
                        error!(attempt = i + 1, error = %e, "Failed to unmount FUSE filesystem.");
                        break;
                    }
                }
            }
        }
    }
}

/// Prepares the mount point directory.
///
/// - If the directory exists and is non-empty, returns an error.
/// - If the directory does not exist, creates it (including parents) and logs an info message.
/// - If the directory exists and is empty, does nothing.
async fn prepare_mount_point(mount_point: &std::path::Path) -> Result<(), std::io::Error> {
    match tokio::fs::read_dir(mount_point).await {
        Ok(mut entries) => {
            if entries.next_entry().await?.is_some() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!(
                        "Mount point '{}' already exists and is not empty.",
                        mount_point.display()
                    ),
                ));
            }
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tokio::fs::create_dir_all(mount_point).await?;
            info!(path = %mount_point.display(), "Created mount point directory.");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Build the remote store the configuration names.
async fn open_backend(remote: &app_config::RemoteConfig) -> Result<Backend, std::io::Error> {
    match remote.kind {
        RemoteKind::Memory if remote.hierarchical => {
            Ok(Backend::Memory(MemoryStore::hierarchical()))
        }
        RemoteKind::Memory => Ok(Backend::Memory(MemoryStore::flat())),
        RemoteKind::Local => {
            let root = remote.path.clone().ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "A local remote needs remote.path to be set.",
                )
            })?;
            info!(root = %root.display(), "Opening local directory store.");
            Ok(Backend::Local(LocalDirStore::open(root).await?))
        }
    }
}

async fn wait_for_exit() -> Result<(), std::io::Error> {
    use tokio::signal;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut sighup = signal::unix::signal(signal::unix::SignalKind::hangup())?;
    select! {
        _ = signal::ctrl_c() => {
            debug!("Received Ctrl+C signal, shutting down...");
        },
        _ = sigterm.recv() => {
            debug!("Received termination signal, shutting down...");
        },
        _ = sighup.recv() => {
            debug!("Received hangup signal, shutting down...");
        },
    }
    Ok(())
}

/// Main entry point for the daemon.
pub async fn run(
    config: app_config::Config,
    handle: tokio::runtime::Handle,
) -> Result<(), std::io::Error> {
    let backend = open_backend(&config.remote).await?;
    let fs = BlobFs::new(backend, config.engine())
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let fs = Arc::new(fs);

    prepare_mount_point(&config.mount_point).await?;

    let evictor = fs.evictor().spawn();

    info!("Mounting filesystem at {}.", config.mount_point.display());

    let fuse = managed_fuse::ManagedFuse::new(&config);
    {
        let _session = fuse.spawn(&config, Arc::clone(&fs), handle.clone())?;
        info!("blob-fs is running. Press Ctrl+C to stop.");

        wait_for_exit().await?;
    }

    evictor.stop().await;
    Ok(())
}

pub fn spawn(config: app_config::Config) -> Result<(), std::io::Error> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(config, runtime.handle().clone()))
}
