use std::{
    env,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use crate::{language::Language, Error, Result};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_GRAPH_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_OUTPUT_LIMIT: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Python interpreter, run as `<python> -X utf8 <file>`.
    pub python: PathBuf,
    /// JavaScript interpreter, run as `<node> <file>`.
    pub node: PathBuf,
    /// Wall-clock ceiling for one execution.
    pub timeout: Duration,
    /// Wall-clock ceiling for rendering a chart from data.
    pub graph_timeout: Duration,
    /// Combined stdout + stderr bytes kept before the child is killed.
    pub output_limit: usize,
    /// Where scratch files go. A private temporary directory when unset.
    pub scratch_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            python: PathBuf::from("python3"),
            node: PathBuf::from("node"),
            timeout: DEFAULT_TIMEOUT,
            graph_timeout: DEFAULT_GRAPH_TIMEOUT,
            output_limit: DEFAULT_OUTPUT_LIMIT,
            scratch_dir: None,
        }
    }
}

impl Config {
    /// Defaults overlaid with `CODE_RUNNER_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(python) = lookup("CODE_RUNNER_PYTHON") {
            config.python = PathBuf::from(python);
        }
        if let Some(node) = lookup("CODE_RUNNER_NODE") {
            config.node = PathBuf::from(node);
        }
        if let Some(secs) = parse(&lookup, "CODE_RUNNER_TIMEOUT_SECS")? {
            config.timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse(&lookup, "CODE_RUNNER_GRAPH_TIMEOUT_SECS")? {
            config.graph_timeout = Duration::from_secs(secs);
        }
        if let Some(limit) = parse(&lookup, "CODE_RUNNER_OUTPUT_LIMIT")? {
            config.output_limit = limit;
        }
        if let Some(dir) = lookup("CODE_RUNNER_SCRATCH_DIR") {
            config.scratch_dir = Some(PathBuf::from(dir));
        }

        Ok(config)
    }

    pub fn interpreter(&self, language: Language) -> &Path {
        match language {
            Language::Python => &self.python,
            Language::JavaScript => &self.node,
        }
    }
}

fn parse<F, T>(lookup: &F, key: &'static str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::InvalidConfig { key, value }),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_the_documented_limits() {
        let config = Config::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.output_limit, 10 * 1024 * 1024);
        assert_eq!(config.interpreter(Language::JavaScript), Path::new("node"));
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = Config::from_lookup(lookup_from(&[
            ("CODE_RUNNER_PYTHON", "/opt/py/bin/python"),
            ("CODE_RUNNER_TIMEOUT_SECS", "5"),
            ("CODE_RUNNER_OUTPUT_LIMIT", " 4096 "),
            ("CODE_RUNNER_SCRATCH_DIR", "/var/tmp/runner"),
        ]))
        .unwrap();

        assert_eq!(config.interpreter(Language::Python), Path::new("/opt/py/bin/python"));
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.output_limit, 4096);
        assert_eq!(config.scratch_dir, Some(PathBuf::from("/var/tmp/runner")));
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        let err = Config::from_lookup(lookup_from(&[("CODE_RUNNER_TIMEOUT_SECS", "soon")]))
            .unwrap_err();

        match err {
            Error::InvalidConfig { key, value } => {
                assert_eq!(key, "CODE_RUNNER_TIMEOUT_SECS");
                assert_eq!(value, "soon");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}
