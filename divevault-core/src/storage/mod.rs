/*!
Filesystem storage for backup artifacts.

Layout under the storage root:

```text
<root>/artifacts/<filename>   one compressed artifact per backup record
<root>/staging/<dir>/         per-restore decompression area
<root>/tmp/                   raw exports while a backup is in flight
<root>/registry.json          metadata registry (see crate::registry)
<root>/restore.lock           file-backed restore lock, when configured
```

This module holds no business rules. Status transitions and checksums live in
the engines that call it.
*/

pub mod local;

pub use local::LocalArtifactStore;

pub const ARTIFACTS_DIR: &str = "artifacts";
pub const STAGING_DIR: &str = "staging";
pub const TMP_DIR: &str = "tmp";
pub const REGISTRY_FILE: &str = "registry.json";
pub const LOCK_FILE: &str = "restore.lock";

/// Prefix of in-flight artifact files inside `artifacts/`
pub const PARTIAL_PREFIX: &str = ".partial-";
