//! Well-known identifiers and file names.

use txnrep_common::StateProviderId;

/// Id under which the state manager's own operations are replicated
pub const STATE_MANAGER_ID: StateProviderId = StateProviderId::new(i64::MIN);

/// Parent id of a root state provider
pub const EMPTY_STATE_PROVIDER_ID: StateProviderId = StateProviderId::new(0);

/// Reserved name of the state manager
pub const STATE_MANAGER_NAME: &str = "fabric:/StateManager";

/// Name of the state manager checkpoint file inside the replica folder
pub const CHECKPOINT_FILE_NAME: &str = "StateManager.cpt";

/// Suffix of the checkpoint being written
pub const TEMP_CHECKPOINT_SUFFIX: &str = "tmp";

/// Suffix of the checkpoint kept aside during a safe replace
pub const BACKUP_CHECKPOINT_SUFFIX: &str = "bak";

/// Name of the state manager checkpoint inside a backup folder
pub const BACKUP_FILE_NAME: &str = "backup.chkpt";
