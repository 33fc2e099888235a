// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{MaxFail, Workers};
use crate::{
    errors::{ConfigParseError, ConfigParseErrorKind, ProfileNotFound},
    tree::TreeDefaults,
};
use camino::{Utf8Path, Utf8PathBuf};
use config::{Config, ConfigBuilder, ConfigError, File, FileFormat, builder::DefaultState};
use serde::Deserialize;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::LazyLock,
    time::Duration,
};
use tracing::warn;

/// Gets the number of available CPUs and caches the value.
#[inline]
pub fn get_num_cpus() -> usize {
    static NUM_CPUS: LazyLock<usize> =
        LazyLock::new(|| match std::thread::available_parallelism() {
            Ok(count) => count.into(),
            Err(err) => {
                warn!("unable to determine num-cpus ({err}), assuming 1 logical CPU");
                1
            }
        });

    *NUM_CPUS
}

/// Overall configuration for testrelay.
///
/// Most runner-specific configuration is managed through profiles, obtained through the
/// [`profile`](Self::profile) method.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    workspace_root: Utf8PathBuf,
    worker: WorkerConfigImpl,
    default_profile: DefaultProfileImpl,
    other_profiles: HashMap<String, CustomProfileImpl>,
}

impl RelayConfig {
    /// The default location of the config within the workspace: `.config/testrelay.toml`.
    pub const CONFIG_PATH: &'static str = ".config/testrelay.toml";

    /// Contains the default config as a TOML file.
    ///
    /// Repository-specific configuration is layered on top of the default config.
    pub const DEFAULT_CONFIG: &'static str = include_str!("../../default-config.toml");

    /// The name of the default profile.
    pub const DEFAULT_PROFILE: &'static str = "default";

    /// Reads the config from the given file, or if not specified from `.config/testrelay.toml` in
    /// the workspace root.
    ///
    /// If no config file is specified and the workspace doesn't have `.config/testrelay.toml`,
    /// uses the default config options.
    pub fn from_sources(
        workspace_root: impl Into<Utf8PathBuf>,
        config_file: Option<&Utf8Path>,
    ) -> Result<Self, ConfigParseError> {
        Self::from_sources_impl(workspace_root, config_file, |config_file, unknown| {
            warn_unknown_keys(config_file, unknown)
        })
    }

    // A custom unknown_callback can be passed in while testing.
    fn from_sources_impl(
        workspace_root: impl Into<Utf8PathBuf>,
        config_file: Option<&Utf8Path>,
        mut unknown_callback: impl FnMut(&Utf8Path, &BTreeSet<String>),
    ) -> Result<Self, ConfigParseError> {
        let workspace_root = workspace_root.into();
        let (config_file, source) = match config_file {
            Some(file) => (file.to_owned(), File::new(file.as_str(), FileFormat::Toml)),
            None => {
                let config_file = workspace_root.join(Self::CONFIG_PATH);
                let source = File::new(config_file.as_str(), FileFormat::Toml).required(false);
                (config_file, source)
            }
        };

        let builder = Self::make_default_config().add_source(source);
        let (config, unknown) = Self::build_and_deserialize_config(&builder)
            .map_err(|kind| ConfigParseError::new(&config_file, kind))?;
        if !unknown.is_empty() {
            unknown_callback(&config_file, &unknown);
        }

        for profile in config.profiles.values() {
            for (project, settings) in &profile.projects {
                if settings.workers == Some(0) {
                    return Err(ConfigParseError::new(
                        &config_file,
                        ConfigParseErrorKind::ZeroProjectWorkers {
                            project: project.clone(),
                        },
                    ));
                }
            }
        }

        Ok(config.into_config(workspace_root))
    }

    /// Returns the default config.
    #[cfg(test)]
    pub(crate) fn default_config(workspace_root: impl Into<Utf8PathBuf>) -> Self {
        let (config, unknown) = Self::build_and_deserialize_config(&Self::make_default_config())
            .expect("default config is always valid");
        assert!(
            unknown.is_empty(),
            "found unknown keys in default config: {unknown:?}"
        );
        config.into_config(workspace_root.into())
    }

    /// Returns the workspace root.
    pub fn workspace_root(&self) -> &Utf8Path {
        &self.workspace_root
    }

    /// Returns the profile with the given name, or an error if a profile was specified but not
    /// found.
    pub fn profile(&self, name: impl AsRef<str>) -> Result<RelayProfile<'_>, ProfileNotFound> {
        let name = name.as_ref();
        let custom_profile = match name {
            Self::DEFAULT_PROFILE => None,
            other => Some(self.other_profiles.get(other).ok_or_else(|| {
                ProfileNotFound::new(
                    name,
                    self.other_profiles
                        .keys()
                        .map(String::as_str)
                        .chain(std::iter::once(Self::DEFAULT_PROFILE)),
                )
            })?),
        };
        Ok(RelayProfile {
            name: name.to_owned(),
            workspace_root: &self.workspace_root,
            worker: &self.worker,
            default_profile: &self.default_profile,
            custom_profile,
        })
    }

    fn make_default_config() -> ConfigBuilder<DefaultState> {
        Config::builder().add_source(File::from_str(Self::DEFAULT_CONFIG, FileFormat::Toml))
    }

    /// This returns a tuple of (config, ignored paths).
    fn build_and_deserialize_config(
        builder: &ConfigBuilder<DefaultState>,
    ) -> Result<(RelayConfigDeserialize, BTreeSet<String>), ConfigParseErrorKind> {
        let config = builder
            .build_cloned()
            .map_err(|error| ConfigParseErrorKind::BuildError(Box::new(error)))?;

        let mut ignored = BTreeSet::new();
        let mut cb = |path: serde_ignored::Path| {
            ignored.insert(path.to_string());
        };
        let ignored_de = serde_ignored::Deserializer::new(config, &mut cb);
        let config: RelayConfigDeserialize = serde_path_to_error::deserialize(ignored_de)
            .map_err(|error| {
                // Both serde_path_to_error and the config crate report the key. Drop the key from
                // the config error.
                let path = error.path().clone();
                let error = match error.into_inner() {
                    ConfigError::At { error, .. } => *error,
                    other => other,
                };
                ConfigParseErrorKind::DeserializeError(Box::new(serde_path_to_error::Error::new(
                    path, error,
                )))
            })?;

        Ok((config, ignored))
    }
}

fn warn_unknown_keys(config_file: &Utf8Path, unknown: &BTreeSet<String>) {
    let mut unknown_str = String::new();
    if let [key] = unknown.iter().collect::<Vec<_>>().as_slice() {
        unknown_str.push_str("key: ");
        unknown_str.push_str(key);
    } else {
        unknown_str.push_str("keys:\n");
        for ignored_key in unknown {
            unknown_str.push('\n');
            unknown_str.push_str("  - ");
            unknown_str.push_str(ignored_key);
        }
    }
    warn!("in config file {config_file}, ignoring unknown configuration {unknown_str}");
}

/// A testrelay profile. Returned by [`RelayConfig::profile`].
///
/// Values set in a custom profile take priority over the default profile.
#[derive(Clone, Debug)]
pub struct RelayProfile<'cfg> {
    name: String,
    workspace_root: &'cfg Utf8Path,
    worker: &'cfg WorkerConfigImpl,
    default_profile: &'cfg DefaultProfileImpl,
    custom_profile: Option<&'cfg CustomProfileImpl>,
}

impl RelayProfile<'_> {
    /// Returns the name of the profile.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the worker program.
    pub fn worker_program(&self) -> &str {
        &self.worker.program
    }

    /// Returns the extra arguments passed to the worker program.
    pub fn worker_args(&self) -> &[String] {
        &self.worker.args
    }

    /// Returns the number of worker slots.
    pub fn workers(&self) -> Workers {
        self.custom_profile
            .and_then(|profile| profile.workers)
            .unwrap_or(self.default_profile.workers)
    }

    /// Returns the maximum number of failures before scheduling stops.
    pub fn max_failures(&self) -> MaxFail {
        self.custom_profile
            .and_then(|profile| profile.max_failures)
            .unwrap_or(self.default_profile.max_failures)
    }

    /// Returns the default retry budget.
    pub fn retries(&self) -> usize {
        self.custom_profile
            .and_then(|profile| profile.retries)
            .unwrap_or(self.default_profile.retries)
    }

    /// Returns the default per-test timeout.
    pub fn test_timeout(&self) -> Duration {
        self.custom_profile
            .and_then(|profile| profile.test_timeout)
            .unwrap_or(self.default_profile.test_timeout)
    }

    /// Returns how long a worker may take to exit after being asked to stop.
    pub fn stop_grace_period(&self) -> Duration {
        self.custom_profile
            .and_then(|profile| profile.stop_grace_period)
            .unwrap_or(self.default_profile.stop_grace_period)
    }

    /// Returns the absolute artifacts directory for this profile.
    pub fn artifacts_dir(&self) -> Utf8PathBuf {
        let dir = self
            .custom_profile
            .and_then(|profile| profile.artifacts_dir.as_deref())
            .unwrap_or(&self.default_profile.artifacts_dir);
        self.workspace_root.join(dir)
    }

    /// Returns the worker ceiling for a project, if one is configured.
    pub fn project_workers(&self, project_id: &str) -> Option<usize> {
        self.custom_profile
            .and_then(|profile| profile.projects.get(project_id))
            .and_then(|settings| settings.workers)
            .or_else(|| {
                self.default_profile
                    .projects
                    .get(project_id)
                    .and_then(|settings| settings.workers)
            })
    }

    /// Returns every configured per-project worker ceiling.
    pub fn project_worker_limits(&self) -> BTreeMap<String, usize> {
        let mut limits = BTreeMap::new();
        let profiles = std::iter::once(&self.default_profile.projects)
            .chain(self.custom_profile.map(|profile| &profile.projects));
        for projects in profiles {
            for (id, settings) in projects {
                if let Some(workers) = settings.workers {
                    limits.insert(id.clone(), workers);
                }
            }
        }
        limits
    }

    /// Returns the defaults used for tests that don't set their own retries or timeout.
    pub fn tree_defaults(&self) -> TreeDefaults {
        TreeDefaults {
            retries: self.retries(),
            timeout: self.test_timeout(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RelayConfigDeserialize {
    worker: WorkerConfigImpl,
    #[serde(rename = "profile")]
    profiles: HashMap<String, CustomProfileImpl>,
}

impl RelayConfigDeserialize {
    fn into_config(mut self, workspace_root: Utf8PathBuf) -> RelayConfig {
        let default_profile = DefaultProfileImpl::new(
            self.profiles
                .remove(RelayConfig::DEFAULT_PROFILE)
                .expect("default profile should exist"),
        );
        RelayConfig {
            workspace_root,
            worker: self.worker,
            default_profile,
            other_profiles: self.profiles,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct WorkerConfigImpl {
    program: String,
    #[serde(default)]
    args: Vec<String>,
}

#[derive(Clone, Debug)]
struct DefaultProfileImpl {
    workers: Workers,
    max_failures: MaxFail,
    retries: usize,
    test_timeout: Duration,
    stop_grace_period: Duration,
    artifacts_dir: Utf8PathBuf,
    projects: BTreeMap<String, ProjectSettingsImpl>,
}

impl DefaultProfileImpl {
    fn new(p: CustomProfileImpl) -> Self {
        Self {
            workers: p.workers.expect("workers present in default profile"),
            max_failures: p
                .max_failures
                .expect("max-failures present in default profile"),
            retries: p.retries.expect("retries present in default profile"),
            test_timeout: p
                .test_timeout
                .expect("test-timeout present in default profile"),
            stop_grace_period: p
                .stop_grace_period
                .expect("stop-grace-period present in default profile"),
            artifacts_dir: p
                .artifacts_dir
                .expect("artifacts-dir present in default profile"),
            projects: p.projects,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct CustomProfileImpl {
    #[serde(default)]
    workers: Option<Workers>,
    #[serde(default)]
    max_failures: Option<MaxFail>,
    #[serde(default)]
    retries: Option<usize>,
    #[serde(default, with = "humantime_serde::option")]
    test_timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde::option")]
    stop_grace_period: Option<Duration>,
    #[serde(default)]
    artifacts_dir: Option<Utf8PathBuf>,
    #[serde(default)]
    projects: BTreeMap<String, ProjectSettingsImpl>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ProjectSettingsImpl {
    #[serde(default)]
    workers: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::{Utf8TempDir, tempdir};
    use indoc::indoc;
    use maplit::btreemap;
    use pretty_assertions::assert_eq;

    fn workspace_with_config(contents: &str) -> Utf8TempDir {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join(RelayConfig::CONFIG_PATH);
        std::fs::create_dir_all(config_path.parent().unwrap()).unwrap();
        std::fs::write(&config_path, contents).unwrap();
        dir
    }

    #[test]
    fn default_config_is_valid() {
        let config = RelayConfig::default_config("/workspace");
        let profile = config.profile(RelayConfig::DEFAULT_PROFILE).unwrap();
        assert_eq!(profile.worker_program(), "testrelay-worker");
        assert_eq!(profile.workers(), Workers::NumCpus);
        assert_eq!(profile.max_failures(), MaxFail::All);
        assert_eq!(profile.retries(), 0);
        assert_eq!(profile.test_timeout(), Duration::from_secs(30));
        assert_eq!(profile.stop_grace_period(), Duration::from_secs(30));
        assert_eq!(profile.artifacts_dir(), "/workspace/test-results");
        assert_eq!(profile.project_workers("chromium"), None);
    }

    #[test]
    fn custom_profile_overrides_default() {
        let dir = workspace_with_config(indoc! {r#"
            [worker]
            program = "node"
            args = ["worker.js"]

            [profile.default]
            retries = 1

            [profile.default.projects.setup]
            workers = 1

            [profile.ci]
            workers = 4
            max-failures = 10
            stop-grace-period = "500ms"

            [profile.ci.projects.chromium]
            workers = 2
        "#});
        let config = RelayConfig::from_sources(dir.path(), None).unwrap();

        let default = config.profile("default").unwrap();
        assert_eq!(default.worker_args(), ["worker.js".to_owned()]);
        assert_eq!(default.retries(), 1);
        assert_eq!(default.project_workers("chromium"), None);

        let ci = config.profile("ci").unwrap();
        assert_eq!(ci.worker_program(), "node");
        assert_eq!(ci.workers(), Workers::Count(4));
        assert_eq!(ci.max_failures(), MaxFail::Count(10));
        assert_eq!(ci.retries(), 1, "inherited from the default profile");
        assert_eq!(ci.stop_grace_period(), Duration::from_millis(500));
        assert_eq!(
            ci.project_worker_limits(),
            btreemap! {
                "chromium".to_owned() => 2,
                "setup".to_owned() => 1,
            }
        );
        assert_eq!(ci.tree_defaults().retries, 1);

        let err = config.profile("missing").unwrap_err();
        assert_eq!(
            err.to_string(),
            "profile `missing` not found (known profiles: ci, default)"
        );
    }

    #[test]
    fn unknown_keys_are_reported() {
        let dir = workspace_with_config(indoc! {r#"
            [profile.default]
            retries = 2
            bogus = true
        "#});
        let mut reported = Vec::new();
        RelayConfig::from_sources_impl(dir.path(), None, |_, unknown| {
            reported.extend(unknown.iter().cloned());
        })
        .unwrap();
        assert_eq!(reported, vec!["profile.default.bogus".to_owned()]);
    }

    #[test]
    fn invalid_configs() {
        let dir = workspace_with_config(indoc! {r#"
            [profile.default.projects.chromium]
            workers = 0
        "#});
        let err = RelayConfig::from_sources(dir.path(), None).unwrap_err();
        assert!(matches!(
            err.kind(),
            ConfigParseErrorKind::ZeroProjectWorkers { project } if project == "chromium"
        ));

        let dir = workspace_with_config(indoc! {r#"
            [profile.default]
            test-timeout = "soon"
        "#});
        let err = RelayConfig::from_sources(dir.path(), None).unwrap_err();
        match err.kind() {
            ConfigParseErrorKind::DeserializeError(error) => {
                assert_eq!(error.path().to_string(), "profile.default.test-timeout");
            }
            other => panic!("unexpected error kind: {other:?}"),
        }
    }
}
