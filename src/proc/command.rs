use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::path::PathBuf;

/// Resolves a command name to an executable path.
///
/// Absolute names are taken as-is; anything else probes the
/// colon-separated entries of `PATH` and accepts the first candidate
/// that is readable and executable, resolved to its real path.
pub(crate) fn find_command(command: &str) -> Option<PathBuf> {
  if command.is_empty() {
    return None;
  }

  if command.starts_with('/') {
    return Some(PathBuf::from(command));
  }

  let path: std::ffi::OsString = std::env::var_os("PATH")?;

  for dir in std::env::split_paths(&path) {
    let candidate: PathBuf = if dir.as_os_str().is_empty() {
      PathBuf::from(command)
    } else {
      dir.join(command)
    };

    if is_executable(&candidate) {
      return Some(std::fs::canonicalize(&candidate).unwrap_or(candidate));
    }
  }

  None
}

fn is_executable(path: &Path) -> bool {
  let Ok(path) = CString::new(path.as_os_str().as_bytes()) else {
    return false;
  };

  unsafe { libc::access(path.as_ptr(), libc::R_OK | libc::X_OK) == 0 }
}

/// Snapshots the parent environment as `KEY=VALUE` entries.
pub(crate) fn environment() -> Vec<String> {
  std::env::vars_os()
    .map(|(key, value)| {
      format!(
        "{}={}",
        key.to_string_lossy(),
        value.to_string_lossy()
      )
    })
    .collect()
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
  use std::path::PathBuf;

  use crate::proc::command::environment;
  use crate::proc::command::find_command;

  #[test]
  fn test_absolute_command_is_taken_as_is() {
    assert_eq!(
      find_command("/bin/sh"),
      Some(PathBuf::from("/bin/sh")),
    );
  }

  #[test]
  fn test_path_probe_finds_sh() {
    let resolved: PathBuf = find_command("sh").unwrap();

    assert!(resolved.is_absolute());
    assert!(resolved.ends_with("sh"));
  }

  #[test]
  fn test_unknown_command_fails() {
    assert_eq!(find_command("alioth-test-no-such-command"), None);
    assert_eq!(find_command(""), None);
  }

  #[test]
  fn test_environment_snapshot_contains_path() {
    let env: Vec<String> = environment();

    assert!(env.iter().any(|entry| entry.starts_with("PATH=")));
  }
}
