mod clock;
pub mod list;
pub mod read;
pub mod registry;
pub mod security;

use std::path::Path;

pub use clock::CurrentTime;
pub use list::FsList;
pub use read::FsRead;
pub use registry::{RegistryError, ToolRegistry, TypedTool};

/// Built-in catalog: clock plus read-only access to the project tree.
pub fn default_registry(project_root: &Path) -> Result<ToolRegistry, RegistryError> {
    let mut registry = ToolRegistry::new();
    registry.register_typed(CurrentTime)?;
    registry.register_typed(FsList {
        root: project_root.to_path_buf(),
    })?;
    registry.register_typed(FsRead {
        root: project_root.to_path_buf(),
    })?;
    Ok(registry)
}
