use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde_yaml::{Mapping, Value};

use crate::error::{DescriptorError, UNKNOWN_FILE};

const KEY_NAME: &str = "name";
const KEY_CHANNELS: &str = "channels";
const KEY_DEPENDENCIES: &str = "dependencies";
const KEY_PIP: &str = "pip";
const KEY_POST_INSTALL: &str = "post-install";

/// One requirement line from a descriptor, either a conda match spec or a
/// pip requirement. The verbatim text is kept so canonicalization emits
/// exactly what the author wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    name: String,
    spec: Option<String>,
    original: String,
}

impl Requirement {
    pub fn parse(text: &str) -> Self {
        let trimmed = text.trim();
        let split = trimmed
            .find(|c: char| matches!(c, '=' | '<' | '>' | '!' | '~' | ';' | '[' | ' ' | '@'))
            .unwrap_or(trimmed.len());
        let name = trimmed[..split].to_string();
        let rest = trimmed[split..].trim();
        Self {
            name,
            spec: (!rest.is_empty()).then(|| rest.to_string()),
            original: trimmed.to_string(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True when the author wrote an explicit version constraint.
    #[must_use]
    pub fn is_versioned(&self) -> bool {
        self.spec.is_some()
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.original
    }

    fn key(&self) -> String {
        self.name.to_lowercase()
    }

    /// Merge policy for two mentions of the same package: equal specs keep
    /// one, a versioned side beats an unversioned one, two different
    /// explicit versions conflict. Two unversioned mentions keep the
    /// right-hand spelling.
    fn choose(&self, right: &Requirement) -> Result<Requirement, DescriptorError> {
        if self.original == right.original || !self.is_versioned() {
            return Ok(right.clone());
        }
        if !right.is_versioned() {
            return Ok(self.clone());
        }
        Err(DescriptorError::Conflict {
            file: UNKNOWN_FILE.to_string(),
            package: self.name.clone(),
            left: self.original.clone(),
            right: right.original.clone(),
        })
    }
}

/// Parsed representation of one declarative environment manifest.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Descriptor {
    pub name: Option<String>,
    pub channels: Vec<String>,
    pub conda: Vec<Requirement>,
    pub pip: Vec<Requirement>,
    pub post_install: Vec<String>,
    /// Unrecognized top-level keys, preserved through merge and
    /// canonicalization.
    pub extras: BTreeMap<String, Value>,
}

impl Descriptor {
    /// Parse one declarative manifest document.
    ///
    /// # Errors
    ///
    /// Returns `DescriptorError::Parse` when the document is not a mapping
    /// or a recognized key has the wrong shape.
    pub fn parse(bytes: &[u8]) -> Result<Self, DescriptorError> {
        let value: Value = serde_yaml::from_slice(bytes)
            .map_err(|err| DescriptorError::parse(err.to_string()))?;
        let Value::Mapping(mapping) = value else {
            return Err(DescriptorError::parse("top level must be a mapping"));
        };

        let mut descriptor = Self::default();
        for (key, value) in mapping {
            let Value::String(key) = key else {
                return Err(DescriptorError::parse("top-level keys must be strings"));
            };
            match key.as_str() {
                KEY_NAME => {
                    descriptor.name = Some(
                        value
                            .as_str()
                            .ok_or_else(|| DescriptorError::parse("name must be a string"))?
                            .to_string(),
                    );
                }
                KEY_CHANNELS => {
                    descriptor.channels = string_list(&value, KEY_CHANNELS)?;
                }
                KEY_DEPENDENCIES => {
                    parse_dependencies(&value, &mut descriptor)?;
                }
                KEY_POST_INSTALL => {
                    descriptor.post_install = string_list(&value, KEY_POST_INSTALL)?;
                }
                _ => {
                    descriptor.extras.insert(key, value);
                }
            }
        }
        Ok(descriptor)
    }

    /// Read and parse a manifest file.
    ///
    /// # Errors
    ///
    /// Returns an error naming the file when it cannot be read or parsed.
    pub fn parse_file(path: &Path) -> Result<Self, DescriptorError> {
        let bytes = fs::read(path).map_err(|err| DescriptorError::Read {
            file: path.display().to_string(),
            reason: err.to_string(),
        })?;
        Self::parse(&bytes).map_err(|err| err.with_file(path))
    }

    /// Merge per the descriptor union rules: right-hand name wins,
    /// channels union left-first, requirements dedup by package name,
    /// post-install concatenates left then right.
    ///
    /// # Errors
    ///
    /// Returns `DescriptorError::Conflict` when both sides pin the same
    /// package to different explicit versions.
    pub fn merge(&self, right: &Descriptor) -> Result<Descriptor, DescriptorError> {
        let mut channels = self.channels.clone();
        for channel in &right.channels {
            if !channels.contains(channel) {
                channels.push(channel.clone());
            }
        }

        let mut post_install = self.post_install.clone();
        post_install.extend(right.post_install.iter().cloned());

        let mut extras = self.extras.clone();
        for (key, value) in &right.extras {
            extras.insert(key.clone(), value.clone());
        }

        Ok(Descriptor {
            name: right.name.clone().or_else(|| self.name.clone()),
            channels,
            conda: merge_requirements(&self.conda, &right.conda)?,
            pip: merge_requirements(&self.pip, &right.pip)?,
            post_install,
            extras,
        })
    }

    /// Render back to a manifest document in fixed key order with stable
    /// list contents; the result is the input to blueprint fingerprinting.
    #[must_use]
    pub fn canonical_yaml(&self) -> String {
        let mut root = Mapping::new();
        if let Some(name) = &self.name {
            root.insert(Value::from(KEY_NAME), Value::from(name.clone()));
        }

        let mut channels: Vec<String> = Vec::new();
        for channel in &self.channels {
            if !channels.contains(channel) {
                channels.push(channel.clone());
            }
        }
        root.insert(
            Value::from(KEY_CHANNELS),
            Value::Sequence(channels.into_iter().map(Value::from).collect()),
        );

        let mut dependencies: Vec<Value> = self
            .conda
            .iter()
            .map(|req| Value::from(req.as_str()))
            .collect();
        let pip = self.sorted_pip();
        if !pip.is_empty() {
            let mut block = Mapping::new();
            block.insert(
                Value::from(KEY_PIP),
                Value::Sequence(pip.into_iter().map(Value::from).collect()),
            );
            dependencies.push(Value::Mapping(block));
        }
        root.insert(Value::from(KEY_DEPENDENCIES), Value::Sequence(dependencies));

        if !self.post_install.is_empty() {
            root.insert(
                Value::from(KEY_POST_INSTALL),
                Value::Sequence(self.post_install.iter().cloned().map(Value::from).collect()),
            );
        }
        for (key, value) in &self.extras {
            root.insert(Value::from(key.clone()), value.clone());
        }

        // Mapping serialization preserves insertion order, so the emitted
        // document is stable for equal descriptors.
        serde_yaml::to_string(&Value::Mapping(root)).unwrap_or_default()
    }

    /// Projection for the conda-style solver: the same document with the
    /// pip block stripped.
    #[must_use]
    pub fn as_pure_conda(&self) -> Descriptor {
        let mut pure = self.clone();
        pure.pip.clear();
        pure
    }

    /// Projection for the pip-style installer: one requirement per line.
    #[must_use]
    pub fn as_pip_requirements(&self) -> String {
        let pip = self.sorted_pip();
        if pip.is_empty() {
            return String::new();
        }
        let mut text = pip.join("\n");
        text.push('\n');
        text
    }

    #[must_use]
    pub fn has_pip(&self) -> bool {
        !self.pip.is_empty()
    }

    fn sorted_pip(&self) -> Vec<String> {
        let mut pip: Vec<String> = self.pip.iter().map(|req| req.as_str().to_string()).collect();
        pip.sort_by_key(|line| line.to_lowercase());
        pip.dedup();
        pip
    }
}

fn string_list(value: &Value, key: &str) -> Result<Vec<String>, DescriptorError> {
    let sequence = value
        .as_sequence()
        .ok_or_else(|| DescriptorError::parse(format!("{key} must be a list")))?;
    sequence
        .iter()
        .map(|item| {
            item.as_str()
                .map(str::to_string)
                .ok_or_else(|| DescriptorError::parse(format!("{key} entries must be strings")))
        })
        .collect()
}

fn parse_dependencies(value: &Value, descriptor: &mut Descriptor) -> Result<(), DescriptorError> {
    let sequence = value
        .as_sequence()
        .ok_or_else(|| DescriptorError::parse("dependencies must be a list"))?;
    for item in sequence {
        match item {
            Value::String(text) => descriptor.conda.push(Requirement::parse(text)),
            Value::Mapping(mapping) => {
                let pip = mapping
                    .get(&Value::from(KEY_PIP))
                    .ok_or_else(|| DescriptorError::parse("unsupported dependency mapping"))?;
                for line in string_list(pip, KEY_PIP)? {
                    descriptor.pip.push(Requirement::parse(&line));
                }
            }
            other => {
                return Err(DescriptorError::parse(format!(
                    "unsupported dependency entry: {other:?}"
                )));
            }
        }
    }
    Ok(())
}

fn merge_requirements(
    left: &[Requirement],
    right: &[Requirement],
) -> Result<Vec<Requirement>, DescriptorError> {
    let mut merged: Vec<Requirement> = left.to_vec();
    for requirement in right {
        match merged.iter_mut().find(|held| held.key() == requirement.key()) {
            Some(held) => *held = held.choose(requirement)?,
            None => merged.push(requirement.clone()),
        }
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Descriptor {
        Descriptor::parse(text.as_bytes()).expect("descriptor parses")
    }

    #[test]
    fn parses_mixed_dependencies() {
        let descriptor = parse(
            "name: demo\nchannels:\n- conda-forge\ndependencies:\n- python=3.10\n- pip:\n  - requests==2.31.0\npost-install:\n- python -m demo check\n",
        );
        assert_eq!(descriptor.name.as_deref(), Some("demo"));
        assert_eq!(descriptor.channels, vec!["conda-forge"]);
        assert_eq!(descriptor.conda.len(), 1);
        assert_eq!(descriptor.conda[0].name(), "python");
        assert!(descriptor.conda[0].is_versioned());
        assert_eq!(descriptor.pip[0].as_str(), "requests==2.31.0");
        assert_eq!(descriptor.post_install, vec!["python -m demo check"]);
    }

    #[test]
    fn preserves_unknown_keys() {
        let descriptor = parse("channels: [main]\ndependencies: [python]\nschemaVersion: 11\n");
        assert!(descriptor.extras.contains_key("schemaVersion"));
        assert!(descriptor.canonical_yaml().contains("schemaVersion: 11"));
        let reparsed = parse(&descriptor.canonical_yaml());
        assert_eq!(reparsed.extras, descriptor.extras);
    }

    #[test]
    fn rejects_non_mapping_document() {
        let err = Descriptor::parse(b"- just\n- a list\n").unwrap_err();
        assert!(matches!(err, DescriptorError::Parse { .. }));
    }

    #[test]
    fn merge_unions_channels_left_first() {
        let left = parse("channels: [conda-forge, main]\ndependencies: [python]\n");
        let right = parse("channels: [main, bioconda]\ndependencies: [python]\n");
        let merged = left.merge(&right).expect("merge");
        assert_eq!(merged.channels, vec!["conda-forge", "main", "bioconda"]);
    }

    #[test]
    fn merge_conflict_cites_package() {
        let left = parse("dependencies: [numpy=1.24]\n");
        let right = parse("dependencies: [numpy=1.25]\n");
        let err = left.merge(&right).unwrap_err();
        match err {
            DescriptorError::Conflict { package, left, right, .. } => {
                assert_eq!(package, "numpy");
                assert_eq!(left, "numpy=1.24");
                assert_eq!(right, "numpy=1.25");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn merge_versioned_side_wins() {
        let left = parse("dependencies: [numpy]\n");
        let right = parse("dependencies: [numpy=1.25]\n");
        let merged = left.merge(&right).expect("merge");
        assert_eq!(merged.conda[0].as_str(), "numpy=1.25");

        let merged = right.merge(&left).expect("merge");
        assert_eq!(merged.conda[0].as_str(), "numpy=1.25");
    }

    #[test]
    fn merge_unversioned_takes_right() {
        let left = parse("dependencies: [Numpy]\n");
        let right = parse("dependencies: [numpy]\n");
        let merged = left.merge(&right).expect("merge");
        assert_eq!(merged.conda.len(), 1);
        assert_eq!(merged.conda[0].as_str(), "numpy");
    }

    #[test]
    fn merge_keeps_right_name_and_concatenates_post_install() {
        let left = parse("name: left\ndependencies: [python]\npost-install: [echo one]\n");
        let right = parse("name: right\ndependencies: [python]\npost-install: [echo two]\n");
        let merged = left.merge(&right).expect("merge");
        assert_eq!(merged.name.as_deref(), Some("right"));
        assert_eq!(merged.post_install, vec!["echo one", "echo two"]);
    }

    #[test]
    fn canonical_is_stable_under_key_order_and_comments() {
        let one = parse("channels: [main]\ndependencies: [python=3.10]\nname: demo\n");
        let two = parse("# a comment\nname: demo\ndependencies: [python=3.10]\nchannels: [main]\n");
        assert_eq!(one.canonical_yaml(), two.canonical_yaml());
    }

    #[test]
    fn canonical_sorts_and_dedups_pip() {
        let descriptor = parse(
            "dependencies:\n- python\n- pip:\n  - zeal==1.0\n  - apple==2.0\n  - zeal==1.0\n",
        );
        let canonical = descriptor.canonical_yaml();
        let apple = canonical.find("apple==2.0").expect("apple present");
        let zeal = canonical.find("zeal==1.0").expect("zeal present");
        assert!(apple < zeal);
        assert_eq!(canonical.matches("zeal==1.0").count(), 1);
    }

    #[test]
    fn canonical_round_trips() {
        let descriptor = parse(
            "name: demo\nchannels: [conda-forge]\ndependencies:\n- python=3.10\n- pip:\n  - requests==2.31.0\npost-install: [echo hi]\n",
        );
        let reparsed = parse(&descriptor.canonical_yaml());
        assert_eq!(reparsed.canonical_yaml(), descriptor.canonical_yaml());
        assert_eq!(reparsed, descriptor);
    }

    #[test]
    fn merge_is_associative_under_canonical_form() {
        let a = parse("channels: [conda-forge]\ndependencies: [python=3.10, numpy]\n");
        let b = parse("channels: [main]\ndependencies: [numpy=1.25, pandas]\n");
        let c = parse("dependencies:\n- pandas\n- pip:\n  - requests==2.31.0\n");
        let left = a.merge(&b.merge(&c).expect("bc")).expect("a(bc)");
        let right = a.merge(&b).expect("ab").merge(&c).expect("(ab)c");
        assert_eq!(left.canonical_yaml(), right.canonical_yaml());
    }

    #[test]
    fn pure_conda_strips_pip_and_requirements_lists_it() {
        let descriptor = parse("dependencies:\n- python\n- pip:\n  - requests==2.31.0\n");
        assert!(!descriptor.as_pure_conda().has_pip());
        assert!(!descriptor.as_pure_conda().canonical_yaml().contains("pip"));
        assert_eq!(descriptor.as_pip_requirements(), "requests==2.31.0\n");
        assert_eq!(descriptor.as_pure_conda().as_pip_requirements(), "");
    }
}
