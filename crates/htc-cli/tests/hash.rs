mod common;

use common::{htc, write_descriptor};
use predicates::prelude::*;

#[test]
fn hash_is_stable_under_key_order_and_comments() {
    let temp = tempfile::tempdir().expect("tempdir");
    let home = temp.path().join("home");
    let one = write_descriptor(
        temp.path(),
        "one.yaml",
        "channels: [conda-forge]\ndependencies: [python=3.10]\nname: demo\n",
    );
    let two = write_descriptor(
        temp.path(),
        "two.yaml",
        "# reordered\nname: demo\ndependencies: [python=3.10]\nchannels: [conda-forge]\n",
    );

    let first = htc(&home).args(["env", "hash"]).arg(&one).output().expect("run one");
    let second = htc(&home).args(["env", "hash"]).arg(&two).output().expect("run two");
    assert!(first.status.success());
    assert_eq!(first.stdout, second.stdout);

    let digest = String::from_utf8(first.stdout).expect("utf8");
    let digest = digest.trim();
    assert_eq!(digest.len(), 16);
    assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
}

#[test]
fn merged_hash_differs_from_single_file_hash() {
    let temp = tempfile::tempdir().expect("tempdir");
    let home = temp.path().join("home");
    let base = write_descriptor(temp.path(), "base.yaml", "dependencies: [python=3.10]\n");
    let extra = write_descriptor(
        temp.path(),
        "extra.yaml",
        "dependencies:\n- pip:\n  - requests==2.31.0\n",
    );

    let single = htc(&home).args(["env", "hash"]).arg(&base).output().expect("single");
    let merged = htc(&home)
        .args(["env", "hash"])
        .arg(&base)
        .arg(&extra)
        .output()
        .expect("merged");
    assert!(single.status.success());
    assert!(merged.status.success());
    assert_ne!(single.stdout, merged.stdout);
}

#[test]
fn conflicting_pins_fail_citing_the_package() {
    let temp = tempfile::tempdir().expect("tempdir");
    let home = temp.path().join("home");
    let left = write_descriptor(temp.path(), "left.yaml", "dependencies: [numpy=1.24]\n");
    let right = write_descriptor(temp.path(), "right.yaml", "dependencies: [numpy=1.25]\n");

    htc(&home)
        .args(["env", "hash"])
        .arg(&left)
        .arg(&right)
        .assert()
        .failure()
        .stderr(predicate::str::contains("numpy"));
}
