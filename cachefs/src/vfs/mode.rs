//! Per-path operating modes.

use crate::config::PathModeRule;
use crate::meta::path::FsPath;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which store is authoritative for a path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FsMode {
    /// Metadata tree and block store only.
    Primary,
    /// Everything is forwarded to the secondary filesystem.
    Proxy,
    /// Primary serves handles, secondary receives write-through and serves misses.
    Dual,
}

impl FsMode {
    pub fn uses_secondary(self) -> bool {
        !matches!(self, FsMode::Primary)
    }
}

impl fmt::Display for FsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FsMode::Primary => "PRIMARY",
            FsMode::Proxy => "PROXY",
            FsMode::Dual => "DUAL",
        })
    }
}

/// Longest-prefix lookup over the configured path rules.
#[derive(Clone, Debug)]
pub struct ModeResolver {
    default: FsMode,
    rules: Vec<(FsPath, FsMode)>,
}

impl ModeResolver {
    /// Rules with an unparsable prefix are skipped.
    pub fn new(default: FsMode, rules: &[PathModeRule]) -> Self {
        let mut rules = rules
            .iter()
            .filter_map(|rule| match FsPath::parse(&rule.prefix) {
                Ok(prefix) => Some((prefix, rule.mode)),
                Err(e) => {
                    tracing::warn!(prefix = %rule.prefix, error = %e, "ignoring path mode rule");
                    None
                }
            })
            .collect::<Vec<_>>();
        // 深度大的规则优先匹配
        rules.sort_by(|a, b| b.0.depth().cmp(&a.0.depth()));
        Self { default, rules }
    }

    pub fn resolve(&self, path: &FsPath) -> FsMode {
        self.rules
            .iter()
            .find(|(prefix, _)| path.starts_with(prefix))
            .map(|(_, mode)| *mode)
            .unwrap_or(self.default)
    }

    pub fn any_secondary(&self) -> bool {
        self.default.uses_secondary() || self.rules.iter().any(|(_, m)| m.uses_secondary())
    }
}
