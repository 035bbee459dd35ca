//! First-port management for the ZTP stage.
//!
//! During ZTP the first port carries the provisioning address 192.168.1.1 so
//! an installer can reach the device; adoption clears it back to manual mode
//! for service use.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use edgelink_activity::handlers::file::update_file_pair;
use edgelink_activity::handlers::tags;
use edgelink_activity::{ActivityService, Shell, Transaction};

use crate::error::Result;

const FIRST_PORT: &str = "port1";
const FILE_MODE: u32 = 0o755;

const STATIC_CONFIG: &str = "allow-hotplug port1
iface port1 inet static
\taddress 192.168.1.1
\tnetmask 255.255.255.0
";

const MANUAL_CONFIG: &str = "auto port1
allow-hotplug port1
iface port1 inet manual
";

/// Installs and clears the provisioning address on the first port.
pub struct FirstPortService {
    shell: Arc<dyn Shell>,
    activity: Arc<ActivityService>,
    interfaces_dir: PathBuf,
}

impl FirstPortService {
    /// Create the service over the interfaces.d directory.
    #[must_use]
    pub fn new(
        shell: Arc<dyn Shell>,
        activity: Arc<ActivityService>,
        interfaces_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            shell,
            activity,
            interfaces_dir: interfaces_dir.into(),
        }
    }

    fn config_path(&self) -> PathBuf {
        self.interfaces_dir.join(FIRST_PORT)
    }

    /// Install the static provisioning config; rollback restores the
    /// previous file contents.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read or written.
    pub async fn setup_static_with_tx(&self, tx: &Transaction) -> Result<()> {
        let path = self.config_path();
        let backup = read_existing(&path)?;

        let (forward, undo) = update_file_pair(
            &path.display().to_string(),
            STATIC_CONFIG,
            &backup,
            FILE_MODE,
        );
        self.activity
            .execute_activity(tx, tags::UPDATE_FILE, "set first port static", forward, undo)
            .await?;
        Ok(())
    }

    /// Clear the provisioning config and flush the interface, outside any
    /// transaction. Used on the fire-and-forget adoption path.
    ///
    /// # Errors
    ///
    /// Returns an error when the file write or the flush command fails.
    pub async fn clear_static(&self) -> Result<()> {
        let path = self.config_path();
        std::fs::write(&path, MANUAL_CONFIG).map_err(edgelink_activity::ActivityError::from)?;

        self.shell
            .exec(&format!("ip addr flush dev {FIRST_PORT}"))
            .await?;
        Ok(())
    }
}

fn read_existing(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| edgelink_activity::ActivityError::from(e).into())
}
