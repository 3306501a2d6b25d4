//! FUSE transport
//!
//! Owns the kernel session for one mountpoint. Mounting and serving are
//! separate steps so the controller can record the mount before the session
//! loop starts on its own blocking thread.

use std::io;
use std::path::{Path, PathBuf};

use fuser::{MountOption, SessionUnmounter};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::Config;
use crate::fs::BucketFs;

/// Name the mount shows up under in the mount table
const FS_NAME: &str = "bucketfs";

/// Mount options derived from the configuration
pub fn mount_options(config: &Config) -> Vec<MountOption> {
    let mut options = vec![
        MountOption::FSName(FS_NAME.to_string()),
        MountOption::Subtype(FS_NAME.to_string()),
        MountOption::DefaultPermissions,
        MountOption::NoAtime,
    ];
    if config.allow_other {
        options.push(MountOption::AllowOther);
    }
    options
}

/// Ends a served session from outside its loop
pub trait Unmount {
    fn unmount(&mut self) -> io::Result<()>;
}

impl Unmount for SessionUnmounter {
    fn unmount(&mut self) -> io::Result<()> {
        SessionUnmounter::unmount(self)
    }
}

/// A mounted but not yet serving FUSE session
pub struct FuseTransport {
    session: fuser::Session<BucketFs>,
    mountpoint: PathBuf,
}

impl FuseTransport {
    /// Mount `filesystem` at the configured mountpoint
    pub fn mount(filesystem: BucketFs, config: &Config) -> io::Result<Self> {
        let mountpoint = config.mountpoint.clone();
        if !mountpoint.exists() {
            std::fs::create_dir_all(&mountpoint)?;
        }

        let options = mount_options(config);
        let session = fuser::Session::new(filesystem, &mountpoint, &options)?;
        info!(mountpoint = %mountpoint.display(), "Mounted");

        Ok(Self {
            session,
            mountpoint,
        })
    }

    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// Start the session loop on a blocking thread.
    ///
    /// Returns the unmounter that ends the loop and the task running it.
    pub fn serve(mut self, runtime: &Handle) -> (SessionUnmounter, JoinHandle<io::Result<()>>) {
        let unmounter = self.session.unmount_callable();
        let mountpoint = self.mountpoint;
        let mut session = self.session;

        let task = runtime.spawn_blocking(move || {
            info!(mountpoint = %mountpoint.display(), "Serving filesystem requests");
            let result = session.run();
            match &result {
                Ok(()) => info!(mountpoint = %mountpoint.display(), "FUSE session ended"),
                Err(e) => error!(mountpoint = %mountpoint.display(), error = %e, "FUSE session failed"),
            }
            result
        });

        (unmounter, task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigOptions;

    fn config(allow_other: bool) -> Config {
        ConfigOptions {
            target: Some("https://s3.example.com/bucket".to_string()),
            mountpoint: Some(PathBuf::from("/mnt/bucket")),
            cache_dir: Some(PathBuf::from("/tmp/bucketfs-cache")),
            access_key: Some("a".to_string()),
            secret_key: Some("s".to_string()),
            allow_other,
            ..Default::default()
        }
        .build()
        .unwrap()
    }

    #[test]
    fn test_mount_options() {
        let options = mount_options(&config(false));
        assert!(options.contains(&MountOption::FSName("bucketfs".to_string())));
        assert!(options.contains(&MountOption::DefaultPermissions));
        assert!(!options.contains(&MountOption::AllowOther));

        assert!(mount_options(&config(true)).contains(&MountOption::AllowOther));
    }
}
