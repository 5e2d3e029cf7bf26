//! Security Validator - 명령어 허용 목록 검증
//!
//! 제출된 명령어를 `SecurityPolicy`에 대해 검증합니다.
//!
//! ## 검증 순서
//! 1. 명령어 허용 목록 (정확히 일치)
//! 2. 인젝션 패턴 (모든 인자, 무조건 차단)
//! 3. 인자 허용 목록 / 패턴 (모든 인자가 각각 통과해야 함)
//! 4. 작업 디렉토리 제한 (canonicalize 후 비교)
//!
//! Workflow control for a trusted environment, not a sandbox.
//!
//! ```rust,ignore
//! let validator = SecurityValidator::new(SecurityPolicy::development("/work/app"))?;
//! let result = validator.validate_command("npm", &["install".into()], None);
//! assert!(result.allowed);
//! ```

use cmdgate_foundation::{
    AuditAction, AuditEntry, AuditSink, CommandPolicy, DirectoryRestriction, Error, Result,
    SecurityPolicy,
};
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// 검증 결과
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub allowed: bool,
    pub reason: Option<String>,
    pub matched_policy: Option<CommandPolicy>,
    pub sanitized_args: Option<Vec<String>>,
    /// Canonical working directory
    pub working_directory: Option<PathBuf>,
}

impl ValidationResult {
    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            ..Self::default()
        }
    }

    fn deny_with(policy: &CommandPolicy, reason: impl Into<String>) -> Self {
        Self {
            matched_policy: Some(policy.clone()),
            ..Self::deny(reason)
        }
    }

    /// Convert a rejection into `Error::Validation`
    pub fn into_result(self) -> Result<Self> {
        if self.allowed {
            Ok(self)
        } else {
            Err(Error::Validation(
                self.reason.unwrap_or_else(|| "command rejected".to_string()),
            ))
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum DirectoryInput<'a> {
    /// As given by the submitter
    Requested(&'a Path),
    /// Canonical path from an earlier validation
    Resolved(&'a Path),
}

/// Validates commands against a `SecurityPolicy`. Stateless apart from
/// compiled patterns; cheap to share behind an `Arc`.
pub struct SecurityValidator {
    policy: SecurityPolicy,
    /// 인젝션 시그니처 (패턴, 설명)
    injection_patterns: Vec<(Regex, &'static str)>,
    /// Compiled `argPatterns`, keyed by command
    arg_patterns: HashMap<String, Vec<Regex>>,
    audit: Option<Arc<dyn AuditSink>>,
}

impl std::fmt::Debug for SecurityValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityValidator")
            .field("commands", &self.policy.commands.len())
            .field("audit", &self.audit.is_some())
            .finish()
    }
}

impl SecurityValidator {
    /// Compile the policy. Invalid `argPatterns` are a configuration error.
    pub fn new(policy: SecurityPolicy) -> Result<Self> {
        let mut arg_patterns = HashMap::new();
        for entry in &policy.commands {
            let Some(patterns) = &entry.arg_patterns else {
                continue;
            };
            let compiled = patterns
                .iter()
                .map(|p| {
                    Regex::new(p).map_err(|e| {
                        Error::Config(format!(
                            "Invalid argument pattern '{}' for '{}': {}",
                            p, entry.command, e
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            arg_patterns.insert(entry.command.clone(), compiled);
        }

        Ok(Self {
            policy,
            injection_patterns: injection_patterns(),
            arg_patterns,
            audit: None,
        })
    }

    pub fn with_audit(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    pub fn policy(&self) -> &SecurityPolicy {
        &self.policy
    }

    /// 명령어 검증
    pub fn validate_command(
        &self,
        command: &str,
        args: &[String],
        working_directory: Option<&Path>,
    ) -> ValidationResult {
        let result = self.evaluate(command, args, working_directory.map(DirectoryInput::Requested));
        self.report(command, args, &result);
        result
    }

    /// Re-check a stored job right before spawn. The directory was resolved
    /// at submission, so it is not subject to `requireRelativeDirectory`.
    pub fn validate_for_execution(
        &self,
        command: &str,
        args: &[String],
        working_directory: &Path,
    ) -> ValidationResult {
        let result = self.evaluate(command, args, Some(DirectoryInput::Resolved(working_directory)));
        self.report(command, args, &result);
        result
    }

    fn report(&self, command: &str, args: &[String], result: &ValidationResult) {
        if result.allowed {
            debug!(
                component = "security_validator",
                operation = "validate_command",
                command,
                "Command allowed"
            );
            self.record_audit(AuditAction::CommandAllowed, command, args, None);
        } else {
            let reason = result.reason.as_deref().unwrap_or("-");
            warn!(
                component = "security_validator",
                operation = "validate_command",
                command,
                reason,
                "Command blocked"
            );
            self.record_audit(AuditAction::CommandBlocked, command, args, result.reason.as_deref());
        }
    }

    fn evaluate(
        &self,
        command: &str,
        args: &[String],
        working_directory: Option<DirectoryInput<'_>>,
    ) -> ValidationResult {
        // 1. 허용 목록
        let Some(entry) = self.policy.find(command) else {
            return ValidationResult::deny(format!("Command '{}' is not whitelisted", command));
        };

        // 2. 인젝션 패턴
        for arg in args {
            if let Some(signature) = self.injection_signature(arg) {
                return ValidationResult::deny_with(
                    entry,
                    format!("Argument '{}' contains a blocked pattern ({})", arg, signature),
                );
            }
        }

        // 3. 인자 허용 목록 - 모든 인자를 개별 검사
        if entry.restricts_args() {
            if let Some(rejected) = args.iter().find(|arg| !self.arg_admissible(entry, arg)) {
                return ValidationResult::deny_with(
                    entry,
                    format!("Argument '{}' is not allowed for '{}'", rejected, command),
                );
            }
        }

        // 4. 작업 디렉토리
        let dir = match self.resolve_working_directory(entry, working_directory) {
            Ok(dir) => dir,
            Err(reason) => return ValidationResult::deny_with(entry, reason),
        };

        ValidationResult {
            allowed: true,
            reason: None,
            matched_policy: Some(entry.clone()),
            sanitized_args: Some(args.to_vec()),
            working_directory: Some(dir),
        }
    }

    fn injection_signature(&self, arg: &str) -> Option<&'static str> {
        self.injection_patterns
            .iter()
            .find(|(re, _)| re.is_match(arg))
            .map(|(_, name)| *name)
    }

    fn arg_admissible(&self, entry: &CommandPolicy, arg: &str) -> bool {
        let listed = entry
            .allowed_args
            .as_ref()
            .map_or(false, |allowed| allowed.iter().any(|a| a == arg));
        if listed {
            return true;
        }
        self.arg_patterns
            .get(&entry.command)
            .map_or(false, |patterns| patterns.iter().any(|re| re.is_match(arg)))
    }

    /// Default base for relative directories: first project root, else cwd
    fn base_directory(&self) -> std::result::Result<PathBuf, String> {
        match self.policy.project_roots.first() {
            Some(root) => Ok(root.clone()),
            None => std::env::current_dir()
                .map_err(|e| format!("Cannot determine current directory: {}", e)),
        }
    }

    fn resolve_working_directory(
        &self,
        entry: &CommandPolicy,
        requested: Option<DirectoryInput<'_>>,
    ) -> std::result::Result<PathBuf, String> {
        let base = self.base_directory()?;

        let candidate = match requested {
            None => base.clone(),
            Some(DirectoryInput::Resolved(path)) => path.to_path_buf(),
            Some(DirectoryInput::Requested(path)) if path.is_absolute() => {
                if entry.require_relative_directory {
                    return Err(format!(
                        "Absolute working directory '{}' is not allowed for '{}'",
                        path.display(),
                        entry.command
                    ));
                }
                path.to_path_buf()
            }
            Some(DirectoryInput::Requested(path)) => base.join(path),
        };

        let resolved = candidate.canonicalize().map_err(|e| {
            format!(
                "Working directory '{}' is not accessible: {}",
                candidate.display(),
                e
            )
        })?;
        if !resolved.is_dir() {
            return Err(format!(
                "Working directory '{}' is not a directory",
                resolved.display()
            ));
        }

        let roots: Vec<PathBuf> = match entry.working_directory {
            DirectoryRestriction::None => return Ok(resolved),
            DirectoryRestriction::ProjectOnly => {
                if self.policy.project_roots.is_empty() {
                    vec![base]
                } else {
                    self.policy.project_roots.clone()
                }
            }
            DirectoryRestriction::Specific => entry
                .allowed_directories
                .iter()
                .map(|d| if d.is_absolute() { d.clone() } else { base.join(d) })
                .collect(),
        };

        // Roots that do not exist cannot contain anything
        let inside = roots
            .iter()
            .filter_map(|root| root.canonicalize().ok())
            .any(|root| resolved.starts_with(&root));

        if inside {
            Ok(resolved)
        } else {
            Err(format!(
                "Working directory '{}' is outside the allowed directories ({})",
                resolved.display(),
                entry.working_directory.as_str()
            ))
        }
    }

    /// Process environment filtered by policy, with `extra` merged under the
    /// same rules
    pub fn sanitize_environment(&self, extra: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        self.sanitize_from(std::env::vars(), extra)
    }

    /// Like `sanitize_environment`, with an explicit base environment
    pub fn sanitize_from(
        &self,
        base: impl IntoIterator<Item = (String, String)>,
        extra: &BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        let mut env: BTreeMap<String, String> = base
            .into_iter()
            .filter(|(name, _)| self.env_var_permitted(name))
            .collect();

        for (name, value) in extra {
            if self.env_var_permitted(name) {
                env.insert(name.clone(), value.clone());
            } else {
                debug!(component = "security_validator", var = %name, "Dropped blocked env var");
            }
        }
        env
    }

    /// 차단 목록이 허용 목록보다 우선
    pub fn env_var_permitted(&self, name: &str) -> bool {
        if self
            .policy
            .blocked_env_vars
            .iter()
            .any(|pattern| pattern_matches(pattern, name))
        {
            return false;
        }
        match &self.policy.allowed_env_vars {
            Some(allowed) => allowed.iter().any(|pattern| pattern_matches(pattern, name)),
            None => true,
        }
    }

    /// Entry override or the global default
    pub fn get_command_timeout(&self, entry: &CommandPolicy) -> Duration {
        Duration::from_millis(entry.timeout_ms.unwrap_or(self.policy.default_timeout_ms))
    }

    /// Requested timeout, else the command's, capped at the policy maximum
    pub fn effective_timeout(&self, entry: &CommandPolicy, requested_ms: Option<u64>) -> Duration {
        let ms = requested_ms
            .filter(|ms| *ms > 0)
            .unwrap_or_else(|| self.get_command_timeout(entry).as_millis() as u64);
        Duration::from_millis(ms.min(self.policy.max_timeout_ms))
    }

    pub fn requires_confirmation(&self, entry: &CommandPolicy) -> bool {
        entry.requires_confirmation
    }

    fn record_audit(&self, action: AuditAction, command: &str, args: &[String], reason: Option<&str>) {
        let Some(sink) = &self.audit else {
            return;
        };
        let mut entry = AuditEntry::new(action, "security_validator", command).with_args(args);
        if let Some(reason) = reason {
            entry = entry.with_reason(reason);
        }
        sink.record(&entry);
    }
}

fn injection_patterns() -> Vec<(Regex, &'static str)> {
    [
        (r"`", "backtick"),
        (r"\$\(", "command substitution"),
        (r"\$\{", "variable expansion"),
        (r"[;&|]", "command chaining"),
        (r"[<>]", "redirection"),
        (r"\x00", "NUL byte"),
        (r"\b(sudo|su|chmod|chown|eval|exec)\b", "privileged command"),
        (r"rm\s+-rf", "recursive delete"),
        (r"\.\.[/\\]", "path traversal"),
    ]
    .into_iter()
    .filter_map(|(pattern, name)| match Regex::new(pattern) {
        Ok(re) => Some((re, name)),
        Err(e) => {
            warn!("Invalid injection pattern {}: {}", pattern, e);
            None
        }
    })
    .collect()
}

/// Wildcard match: `*` allowed as prefix and/or suffix
fn pattern_matches(pattern: &str, name: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match (pattern.strip_prefix('*'), pattern.strip_suffix('*')) {
        (Some(rest), Some(_)) => name.contains(&rest[..rest.len() - 1]),
        (Some(suffix), None) => name.ends_with(suffix),
        (None, Some(prefix)) => name.starts_with(prefix),
        (None, None) => name == pattern,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn args(a: &[&str]) -> Vec<String> {
        a.iter().map(|s| s.to_string()).collect()
    }

    fn validator(root: &Path) -> SecurityValidator {
        let policy = SecurityPolicy::new()
            .with_project_roots(vec![root.to_path_buf()])
            .allow(CommandPolicy::new("echo").with_restriction(DirectoryRestriction::None))
            .allow(
                CommandPolicy::new("npm")
                    .with_allowed_args(vec!["install", "test", "run"])
                    .with_arg_patterns(vec![r"^--[a-z-]+$", r"^build(:[a-z]+)?$"]),
            )
            .allow(CommandPolicy::new("git").require_relative());
        SecurityValidator::new(policy).unwrap()
    }

    #[test]
    fn test_command_not_whitelisted() {
        let dir = tempfile::tempdir().unwrap();
        let v = validator(dir.path());
        let result = v.validate_command("rm", &args(&["-rf", "/"]), None);
        assert!(!result.allowed);
        assert!(result.reason.unwrap().contains("not whitelisted"));
        assert!(result.matched_policy.is_none());
    }

    #[test]
    fn test_injection_blocked_even_when_whitelisted() {
        let dir = tempfile::tempdir().unwrap();
        let v = validator(dir.path());
        for bad in [
            "`id`",
            "$(whoami)",
            "${HOME}",
            "a;b",
            "a && b",
            "a|b",
            "> out",
            "<in",
            "nul\0byte",
            "sudo",
            "rm -rf x",
            "../etc",
            "..\\windows",
        ] {
            let result = v.validate_command("echo", &args(&[bad]), None);
            assert!(!result.allowed, "{:?} should be blocked", bad);
        }
        assert!(v.validate_command("echo", &args(&["hello", "world"]), None).allowed);
        assert!(v.validate_command("echo", &args(&["summary", "sudoku"]), None).allowed);
    }

    #[test]
    fn test_every_argument_checked() {
        let dir = tempfile::tempdir().unwrap();
        let v = validator(dir.path());
        assert!(v.validate_command("npm", &args(&["install", "--save-dev"]), None).allowed);
        assert!(v.validate_command("npm", &args(&["run", "build:prod"]), None).allowed);

        // First argument passes; a later one must still be rejected
        let result = v.validate_command("npm", &args(&["install", "left-pad"]), None);
        assert!(!result.allowed);
        assert!(result.reason.unwrap().contains("left-pad"));
    }

    #[test]
    fn test_working_directory_project_only() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("sub")).unwrap();
        let outside = tempfile::tempdir().unwrap();
        let v = validator(root.path());

        let inside = v.validate_command("npm", &args(&["test"]), Some(Path::new("sub")));
        assert!(inside.allowed);
        assert_eq!(
            inside.working_directory.unwrap(),
            root.path().join("sub").canonicalize().unwrap()
        );

        let default = v.validate_command("npm", &args(&["test"]), None);
        assert_eq!(default.working_directory.unwrap(), root.path().canonicalize().unwrap());

        let escaped = v.validate_command("npm", &args(&["test"]), Some(outside.path()));
        assert!(!escaped.allowed);
        assert!(escaped.reason.unwrap().contains("outside"));
    }

    #[test]
    fn test_relative_directory_required() {
        let root = tempfile::tempdir().unwrap();
        let v = validator(root.path());
        let result = v.validate_command("git", &args(&["status"]), Some(root.path()));
        assert!(!result.allowed);
        assert!(v.validate_command("git", &args(&["status"]), Some(Path::new("."))).allowed);
    }

    #[test]
    fn test_execution_revalidation_accepts_resolved_directory() {
        let root = tempfile::tempdir().unwrap();
        let v = validator(root.path());
        let first = v.validate_command("git", &args(&["status"]), Some(Path::new(".")));
        let resolved = first.working_directory.unwrap();

        assert!(v.validate_for_execution("git", &args(&["status"]), &resolved).allowed);
        assert!(!v.validate_for_execution("git", &args(&["status;id"]), &resolved).allowed);
    }

    #[test]
    fn test_specific_directories() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("allowed")).unwrap();
        std::fs::create_dir(root.path().join("other")).unwrap();
        let policy = SecurityPolicy::new()
            .with_project_roots(vec![root.path().to_path_buf()])
            .allow(
                CommandPolicy::new("make")
                    .with_restriction(DirectoryRestriction::Specific)
                    .with_allowed_directories(vec![PathBuf::from("allowed")]),
            );
        let v = SecurityValidator::new(policy).unwrap();

        assert!(v.validate_command("make", &[], Some(Path::new("allowed"))).allowed);
        assert!(!v.validate_command("make", &[], Some(Path::new("other"))).allowed);
        assert!(!v.validate_command("make", &[], Some(Path::new("missing"))).allowed);
    }

    #[test]
    fn test_environment_sanitized() {
        let policy = SecurityPolicy::new().with_blocked_env(vec!["AWS_*", "*_TOKEN", "SECRET"]);
        let v = SecurityValidator::new(policy).unwrap();

        let base = vec![
            ("PATH".to_string(), "/usr/bin".to_string()),
            ("AWS_ACCESS_KEY_ID".to_string(), "x".to_string()),
            ("GITHUB_TOKEN".to_string(), "y".to_string()),
            ("SECRET".to_string(), "z".to_string()),
        ];
        let mut extra = BTreeMap::new();
        extra.insert("NODE_ENV".to_string(), "test".to_string());
        extra.insert("NPM_TOKEN".to_string(), "leak".to_string());

        let env = v.sanitize_from(base, &extra);
        assert_eq!(env.get("PATH").map(String::as_str), Some("/usr/bin"));
        assert_eq!(env.get("NODE_ENV").map(String::as_str), Some("test"));
        assert!(!env.contains_key("AWS_ACCESS_KEY_ID"));
        assert!(!env.contains_key("GITHUB_TOKEN"));
        assert!(!env.contains_key("NPM_TOKEN"));
        assert!(!env.contains_key("SECRET"));
    }

    #[test]
    fn test_blocked_beats_allowed() {
        let policy = SecurityPolicy::new()
            .with_blocked_env(vec!["*_TOKEN"])
            .with_allowed_env(vec!["PATH", "CI_*"]);
        let v = SecurityValidator::new(policy).unwrap();
        assert!(v.env_var_permitted("PATH"));
        assert!(v.env_var_permitted("CI_JOB"));
        assert!(!v.env_var_permitted("CI_TOKEN"));
        assert!(!v.env_var_permitted("HOME"));
    }

    #[test]
    fn test_pattern_matches() {
        assert!(pattern_matches("AWS_*", "AWS_SECRET"));
        assert!(pattern_matches("*_KEY", "API_KEY"));
        assert!(pattern_matches("*SECRET*", "MY_SECRET_VALUE"));
        assert!(pattern_matches("*", "ANY"));
        assert!(!pattern_matches("AWS_*", "MY_AWS"));
    }

    #[test]
    fn test_timeouts() {
        let policy = SecurityPolicy::new()
            .allow(CommandPolicy::new("docker").with_timeout_ms(600_000))
            .allow(CommandPolicy::new("ls"));
        let v = SecurityValidator::new(policy).unwrap();
        let docker = v.policy().find("docker").unwrap().clone();
        let ls = v.policy().find("ls").unwrap().clone();

        assert_eq!(v.get_command_timeout(&docker), Duration::from_secs(600));
        assert_eq!(v.get_command_timeout(&ls), Duration::from_secs(300));
        assert_eq!(v.effective_timeout(&ls, Some(500)), Duration::from_millis(500));
        assert_eq!(
            v.effective_timeout(&ls, Some(u64::MAX)),
            Duration::from_millis(cmdgate_foundation::MAX_TIMEOUT_MS)
        );
        assert!(v.requires_confirmation(&ls));
    }

    #[test]
    fn test_invalid_arg_pattern_is_config_error() {
        let policy = SecurityPolicy::new()
            .allow(CommandPolicy::new("npm").with_arg_patterns(vec!["(unclosed"]));
        assert!(matches!(SecurityValidator::new(policy), Err(Error::Config(_))));
    }

    struct Recording(Mutex<Vec<AuditEntry>>);

    impl AuditSink for Recording {
        fn record(&self, entry: &AuditEntry) {
            self.0.lock().unwrap().push(entry.clone());
        }
    }

    #[test]
    fn test_decisions_are_audited() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(Recording(Mutex::new(Vec::new())));
        let v = validator(dir.path()).with_audit(sink.clone());

        v.validate_command("echo", &args(&["ok"]), None);
        v.validate_command("curl", &args(&["evil.sh"]), None);

        let entries = sink.0.lock().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, AuditAction::CommandAllowed);
        assert_eq!(entries[1].action, AuditAction::CommandBlocked);
        assert!(entries[1].reason.as_deref().unwrap().contains("not whitelisted"));
    }
}
