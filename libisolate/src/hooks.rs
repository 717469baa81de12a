use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use log::debug;
use tempfile::TempDir;

use crate::error::IsolateError;

pub const ENTER_HOOK: &str = "dhclient-enter-hooks";
pub const EXIT_HOOK: &str = "dhclient-exit-hooks";

const BUILTIN_ENTER_HOOK: &str = include_str!("../resources/dhclient-enter-hooks");
const BUILTIN_EXIT_HOOK: &str = include_str!("../resources/dhclient-exit-hooks");

/// A temporary stand-in for `/etc/dhcp`, removed when dropped.
#[derive(Debug)]
pub struct HooksDir {
    dir: TempDir,
}

impl HooksDir {
    /// Creates an empty hooks directory under `parent`.
    pub fn empty(parent: &Path, prefix: &str) -> Result<Self, IsolateError> {
        let dir = tempfile::Builder::new().prefix(prefix).tempdir_in(parent)?;
        debug!("created hooks directory {}", dir.path().display());
        Ok(Self { dir })
    }

    /// Creates a hooks directory holding the enter and exit scripts.
    ///
    /// Scripts are copied from `source` when given, otherwise the built-in
    /// ones are written.
    pub fn with_scripts(
        parent: &Path,
        prefix: &str,
        source: Option<&Path>,
    ) -> Result<Self, IsolateError> {
        let hooks = Self::empty(parent, prefix)?;
        for (name, builtin) in [(ENTER_HOOK, BUILTIN_ENTER_HOOK), (EXIT_HOOK, BUILTIN_EXIT_HOOK)] {
            hooks.install(name, source, builtin)?;
        }
        Ok(hooks)
    }

    fn install(&self, name: &str, source: Option<&Path>, builtin: &str) -> Result<(), IsolateError> {
        let dest = self.dir.path().join(name);
        let hook_err = |source| IsolateError::Hook {
            path: dest.clone(),
            source,
        };
        match source {
            Some(dir) => fs::copy(dir.join(name), &dest).map(|_| ()).map_err(hook_err)?,
            None => fs::write(&dest, builtin).map_err(hook_err)?,
        }
        fs::set_permissions(&dest, fs::Permissions::from_mode(0o755)).map_err(hook_err)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Removes the directory, reporting failures instead of ignoring them.
    pub fn close(self) -> Result<(), IsolateError> {
        self.dir.close()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_scripts_are_executable() {
        let parent = tempfile::tempdir().unwrap();
        let hooks = HooksDir::with_scripts(parent.path(), "etc-dhcp", None).unwrap();

        for name in [ENTER_HOOK, EXIT_HOOK] {
            let meta = fs::metadata(hooks.path().join(name)).unwrap();
            assert_eq!(meta.permissions().mode() & 0o777, 0o755);
        }
        let enter = fs::read_to_string(hooks.path().join(ENTER_HOOK)).unwrap();
        assert!(enter.contains("make_resolv_conf"));
    }

    #[test]
    fn test_scripts_copied_from_source() {
        let parent = tempfile::tempdir().unwrap();
        let source = tempfile::tempdir().unwrap();
        fs::write(source.path().join(ENTER_HOOK), "echo enter\n").unwrap();
        fs::write(source.path().join(EXIT_HOOK), "echo exit\n").unwrap();

        let hooks = HooksDir::with_scripts(parent.path(), "etc-dhcp", Some(source.path())).unwrap();
        assert_eq!(
            fs::read_to_string(hooks.path().join(EXIT_HOOK)).unwrap(),
            "echo exit\n"
        );
    }

    #[test]
    fn test_missing_source_script_fails_and_cleans_up() {
        let parent = tempfile::tempdir().unwrap();
        let source = tempfile::tempdir().unwrap();

        let err = HooksDir::with_scripts(parent.path(), "etc-dhcp", Some(source.path())).unwrap_err();
        assert!(matches!(err, IsolateError::Hook { .. }));
        assert_eq!(fs::read_dir(parent.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_directory_removed_on_drop() {
        let parent = tempfile::tempdir().unwrap();
        let hooks = HooksDir::empty(parent.path(), "etc-dhcp-release").unwrap();
        let path = hooks.path().to_path_buf();
        assert!(path.is_dir());
        drop(hooks);
        assert!(!path.exists());
    }
}
