//! Security policy - command allow-list and execution restrictions
//!
//! Read-only input to the validator. Loaded from `cmdgate.json` under the
//! `policy` key; every field has a serde default so partial files work.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default per-command timeout (5 minutes)
pub const DEFAULT_TIMEOUT_MS: u64 = 5 * 60 * 1000;

/// Upper bound a submitter may request (4 hours)
pub const MAX_TIMEOUT_MS: u64 = 4 * 60 * 60 * 1000;

/// Where a command may execute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DirectoryRestriction {
    /// Anywhere
    None,
    /// Under one of the policy's project roots
    #[default]
    ProjectOnly,
    /// Under one of the command entry's own allowed directories
    Specific,
}

impl DirectoryRestriction {
    pub fn as_str(&self) -> &'static str {
        match self {
            DirectoryRestriction::None => "none",
            DirectoryRestriction::ProjectOnly => "project-only",
            DirectoryRestriction::Specific => "specific",
        }
    }
}

/// One allow-listed command
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandPolicy {
    /// Executable name, matched exactly
    pub command: String,

    /// Human description shown to approvers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Arguments accepted verbatim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_args: Option<Vec<String>>,

    /// Regex patterns an argument may match instead
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arg_patterns: Option<Vec<String>>,

    /// Working directory restriction mode
    #[serde(default)]
    pub working_directory: DirectoryRestriction,

    /// Directories used by `DirectoryRestriction::Specific`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_directories: Vec<PathBuf>,

    /// Reject absolute working directory inputs
    #[serde(default)]
    pub require_relative_directory: bool,

    /// Timeout override in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Whether a human must approve each run
    #[serde(default = "default_true")]
    pub requires_confirmation: bool,
}

fn default_true() -> bool {
    true
}

impl CommandPolicy {
    /// Allow a command with no argument restrictions
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            description: None,
            allowed_args: None,
            arg_patterns: None,
            working_directory: DirectoryRestriction::default(),
            allowed_directories: Vec::new(),
            require_relative_directory: false,
            timeout_ms: None,
            requires_confirmation: true,
        }
    }

    pub fn with_allowed_args(mut self, args: Vec<&str>) -> Self {
        self.allowed_args = Some(args.into_iter().map(String::from).collect());
        self
    }

    pub fn with_arg_patterns(mut self, patterns: Vec<&str>) -> Self {
        self.arg_patterns = Some(patterns.into_iter().map(String::from).collect());
        self
    }

    pub fn with_restriction(mut self, restriction: DirectoryRestriction) -> Self {
        self.working_directory = restriction;
        self
    }

    pub fn with_allowed_directories(mut self, dirs: Vec<PathBuf>) -> Self {
        self.allowed_directories = dirs;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_confirmation(mut self, required: bool) -> Self {
        self.requires_confirmation = required;
        self
    }

    pub fn require_relative(mut self) -> Self {
        self.require_relative_directory = true;
        self
    }

    /// Whether the entry restricts arguments at all
    pub fn restricts_args(&self) -> bool {
        self.allowed_args.is_some() || self.arg_patterns.is_some()
    }
}

/// Complete security policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityPolicy {
    /// Allow-listed commands
    #[serde(default)]
    pub commands: Vec<CommandPolicy>,

    /// Roots for `project-only` restriction; the first one is the default cwd
    #[serde(default)]
    pub project_roots: Vec<PathBuf>,

    /// Environment variable names never passed to children (`*` wildcards)
    #[serde(default = "default_blocked_env")]
    pub blocked_env_vars: Vec<String>,

    /// When set, the only variables passed to children
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_env_vars: Option<Vec<String>>,

    /// Timeout used when neither request nor entry sets one
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Ceiling for requested timeouts
    #[serde(default = "max_timeout_ms")]
    pub max_timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn max_timeout_ms() -> u64 {
    MAX_TIMEOUT_MS
}

fn default_blocked_env() -> Vec<String> {
    [
        // Cloud credentials
        "AWS_*",
        "AZURE_*",
        "GCP_*",
        "GOOGLE_APPLICATION_CREDENTIALS",
        // Generic secrets
        "*_SECRET",
        "*_TOKEN",
        "*_API_KEY",
        "*_PASSWORD",
        "*_CREDENTIALS",
        // Services
        "ANTHROPIC_API_KEY",
        "OPENAI_API_KEY",
        "GITHUB_TOKEN",
        "NPM_TOKEN",
        "DATABASE_URL",
        // SSH/GPG
        "SSH_AUTH_SOCK",
        "GPG_*",
        // Loader injection
        "LD_PRELOAD",
        "LD_LIBRARY_PATH",
        "DYLD_*",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            commands: Vec::new(),
            project_roots: Vec::new(),
            blocked_env_vars: default_blocked_env(),
            allowed_env_vars: None,
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            max_timeout_ms: MAX_TIMEOUT_MS,
        }
    }
}

impl SecurityPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Typical development tool set rooted at `project_root`
    pub fn development(project_root: impl Into<PathBuf>) -> Self {
        let commands = ["npm", "npx", "yarn", "pnpm", "node", "git", "tsc", "cargo", "docker"]
            .into_iter()
            .map(CommandPolicy::new)
            .chain(
                ["ls", "pwd", "echo", "cat"]
                    .into_iter()
                    .map(|c| CommandPolicy::new(c).with_confirmation(false)),
            )
            .collect();

        Self {
            commands,
            project_roots: vec![project_root.into()],
            ..Self::default()
        }
    }

    pub fn allow(mut self, command: CommandPolicy) -> Self {
        self.commands.push(command);
        self
    }

    pub fn with_project_roots(mut self, roots: Vec<PathBuf>) -> Self {
        self.project_roots = roots;
        self
    }

    pub fn with_blocked_env(mut self, names: Vec<&str>) -> Self {
        self.blocked_env_vars = names.into_iter().map(String::from).collect();
        self
    }

    pub fn with_allowed_env(mut self, names: Vec<&str>) -> Self {
        self.allowed_env_vars = Some(names.into_iter().map(String::from).collect());
        self
    }

    /// Exact-match lookup
    pub fn find(&self, command: &str) -> Option<&CommandPolicy> {
        self.commands.iter().find(|p| p.command == command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_policy_uses_defaults() {
        let json = r#"{
            "commands": [
                { "command": "npm", "allowedArgs": ["install", "test"], "workingDirectory": "specific" }
            ]
        }"#;
        let policy: SecurityPolicy = serde_json::from_str(json).unwrap();

        assert_eq!(policy.default_timeout_ms, DEFAULT_TIMEOUT_MS);
        assert!(policy.blocked_env_vars.iter().any(|v| v == "AWS_*"));

        let npm = policy.find("npm").unwrap();
        assert_eq!(npm.working_directory, DirectoryRestriction::Specific);
        assert!(npm.requires_confirmation);
        assert!(npm.restricts_args());
    }

    #[test]
    fn test_find_is_exact() {
        let policy = SecurityPolicy::new().allow(CommandPolicy::new("git"));
        assert!(policy.find("git").is_some());
        assert!(policy.find("gi").is_none());
        assert!(policy.find("git ").is_none());
    }

    #[test]
    fn test_restriction_serde() {
        let json = serde_json::to_string(&DirectoryRestriction::ProjectOnly).unwrap();
        assert_eq!(json, "\"project-only\"");
    }
}
