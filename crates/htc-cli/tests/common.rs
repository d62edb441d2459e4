#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::Command;

/// Shell stub standing in for the conda-style solver: it creates a small
/// deterministic environment at the `-p` target.
pub const FAKE_SOLVER: &str = r#"#!/bin/sh
target=""
while [ $# -gt 0 ]; do
  if [ "$1" = "-p" ]; then target="$2"; fi
  shift
done
mkdir -p "$target/bin"
printf '#!/bin/sh\necho tool\n' > "$target/bin/tool"
chmod 755 "$target/bin/tool"
printf 'payload\n' > "$target/data.txt"
exit 0
"#;

pub fn write_fake_solver(dir: &Path) -> PathBuf {
    let path = dir.join("fake-solver.sh");
    fs::write(&path, FAKE_SOLVER).expect("solver script");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod solver");
    }
    path
}

pub fn write_descriptor(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).expect("descriptor");
    path
}

/// `htc` with its cache home pinned inside the test sandbox.
pub fn htc(home: &Path) -> Command {
    let mut cmd = Command::cargo_bin("htc").expect("htc binary");
    cmd.env("HTC_HOME", home);
    cmd
}
