use std::fmt;
use std::hash::Hasher;
use std::path::Path;

use siphasher::sip::SipHasher24;

use crate::descriptor::Descriptor;
use crate::error::DescriptorError;

// Fingerprints are identifiers, not security material; SipHash keeps them
// short, fast, and stable across builds.
const FINGERPRINT_KEY0: u64 = 9_007_199_254_740_993;
const FINGERPRINT_KEY1: u64 = 2_147_483_647;
const IDENTITY_KEY0: u64 = 9_007_799_254_740_993;
const IDENTITY_KEY1: u64 = 2_147_487_647;

/// 16-hex-digit fingerprint of a canonicalized environment descriptor; the
/// cache's primary key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Blueprint(String);

impl Blueprint {
    /// Derive the fingerprint from canonical descriptor bytes. Pure
    /// function: equal bytes always yield an equal blueprint.
    #[must_use]
    pub fn fingerprint(canonical: &[u8]) -> Self {
        Self(format!(
            "{:016x}",
            siphash(FINGERPRINT_KEY0, FINGERPRINT_KEY1, canonical)
        ))
    }

    #[must_use]
    pub fn of(descriptor: &Descriptor) -> Self {
        Self::fingerprint(descriptor.canonical_yaml().as_bytes())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Blueprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn siphash(key0: u64, key1: u64, bytes: &[u8]) -> u64 {
    let mut hasher = SipHasher24::new_with_keys(key0, key1);
    hasher.write(bytes);
    hasher.finish()
}

/// Short stable identifier for arbitrary text, used where a cheap
/// collision-tolerant tag is enough.
#[must_use]
pub fn short_identity(text: &str, length: usize) -> String {
    let digest = format!("{:016x}", siphash(IDENTITY_KEY0, IDENTITY_KEY1, text.as_bytes()));
    digest[..length.min(digest.len())].to_string()
}

/// 7-hex identity of the OS user's home directory, so different users on
/// one machine never collide on space names.
#[must_use]
pub fn user_home_identity() -> String {
    match dirs_next::home_dir() {
        Some(home) => short_identity(&home.display().to_string(), 7),
        None => "badcafe".to_string(),
    }
}

/// Parse each descriptor file in order, fold-left merge, and fingerprint
/// the canonical union.
///
/// # Errors
///
/// Returns the first read, parse, or merge failure, carrying the name of
/// the offending file.
pub fn compose_final_blueprint(
    files: &[impl AsRef<Path>],
) -> Result<(Descriptor, Blueprint), DescriptorError> {
    let mut merged: Option<Descriptor> = None;
    for file in files {
        let file = file.as_ref();
        let next = Descriptor::parse_file(file)?;
        merged = Some(match merged {
            Some(held) => held.merge(&next).map_err(|err| err.with_file(file))?,
            None => next,
        });
    }
    let descriptor = merged.unwrap_or_default();
    let blueprint = Blueprint::of(&descriptor);
    Ok((descriptor, blueprint))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn fingerprint_is_deterministic_and_sixteen_hex() {
        let one = Blueprint::fingerprint(b"channels: []\n");
        let two = Blueprint::fingerprint(b"channels: []\n");
        assert_eq!(one, two);
        assert_eq!(one.as_str().len(), 16);
        assert!(one.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn fingerprint_ignores_key_order_and_comments() {
        let one = Descriptor::parse(b"channels: [main]\ndependencies: [python=3.10]\n")
            .expect("parse one");
        let two =
            Descriptor::parse(b"# note\ndependencies: [python=3.10]\nchannels: [main]\n")
                .expect("parse two");
        assert_eq!(Blueprint::of(&one), Blueprint::of(&two));
    }

    #[test]
    fn fingerprint_is_idempotent_over_canonicalization() {
        let descriptor =
            Descriptor::parse(b"dependencies:\n- python\n- pip:\n  - requests==2.31.0\n")
                .expect("parse");
        let once = Blueprint::of(&descriptor);
        let canonical = Descriptor::parse(descriptor.canonical_yaml().as_bytes()).expect("reparse");
        assert_eq!(once, Blueprint::of(&canonical));
    }

    #[test]
    fn home_identity_is_seven_hex() {
        let identity = user_home_identity();
        assert_eq!(identity.len(), 7);
        assert!(identity.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn compose_merges_in_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let first = temp.path().join("base.yaml");
        let second = temp.path().join("extra.yaml");
        fs::write(&first, "channels: [conda-forge]\ndependencies: [python=3.10]\n")
            .expect("write first");
        fs::write(&second, "dependencies:\n- pip:\n  - requests==2.31.0\n").expect("write second");

        let (descriptor, blueprint) =
            compose_final_blueprint(&[&first, &second]).expect("compose");
        assert!(descriptor.has_pip());
        assert_eq!(blueprint, Blueprint::of(&descriptor));
    }

    #[test]
    fn compose_surfaces_conflict_with_file_name() {
        let temp = tempfile::tempdir().expect("tempdir");
        let first = temp.path().join("a.yaml");
        let second = temp.path().join("b.yaml");
        fs::write(&first, "dependencies: [numpy=1.24]\n").expect("write first");
        fs::write(&second, "dependencies: [numpy=1.25]\n").expect("write second");

        let err = compose_final_blueprint(&[&first, &second]).unwrap_err();
        assert!(err.to_string().contains("b.yaml"));
        assert!(err.to_string().contains("numpy"));
    }
}
