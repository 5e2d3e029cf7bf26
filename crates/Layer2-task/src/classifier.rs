//! Operation classifier
//!
//! Ordered rules, first match wins. The docker rule runs before the generic
//! "build" substring so that `docker build` is not reported as a compile.

use crate::job::OperationType;
use std::time::Duration;

const PACKAGE_MANAGERS: &[&str] = &["npm", "yarn", "pnpm"];
const INSTALL_VERBS: &[&str] = &["install", "i", "ci", "add"];
const BUILD_TOOLS: &[&str] = &["tsc", "webpack", "rollup", "vite", "esbuild"];
const TEST_RUNNERS: &[&str] = &["jest", "vitest", "mocha", "cypress", "playwright", "pytest"];
const E2E_RUNNERS: &[&str] = &["cypress", "playwright"];

/// Classify a command line
pub fn classify_operation(command: &str, args: &[String]) -> OperationType {
    let program = program_name(command);
    // `npx <tool> ...` classifies as the tool itself
    if program == "npx" {
        if let Some((tool, rest)) = args.split_first() {
            return classify_operation(tool, rest);
        }
    }

    let first = args.first().map(|a| a.to_lowercase());
    let line = command_line(command, args);

    if is_package_install(&program, first.as_deref(), args) {
        return OperationType::PackageInstall;
    }

    if program == "docker" && args.iter().any(|a| a == "build" || a == "buildx") {
        return OperationType::DockerBuild;
    }

    if BUILD_TOOLS.contains(&program.as_str()) || line.contains("build") {
        return OperationType::BuildCompile;
    }

    if TEST_RUNNERS.contains(&program.as_str()) || is_script_test(&program, args) {
        return OperationType::TestSuite;
    }

    if line.contains("deploy") || line.contains("publish") {
        return OperationType::Deployment;
    }

    if line.contains("migrate") || line.contains("seed") {
        return OperationType::Database;
    }

    OperationType::Other
}

/// Display estimate for how long a job will run. Never bounds execution.
pub fn estimate_execution_duration(
    operation_type: OperationType,
    command: &str,
    args: &[String],
) -> Duration {
    let program = program_name(command);
    let secs = match operation_type {
        OperationType::PackageInstall => {
            if args.iter().any(|a| a == "-g" || a == "--global") {
                120
            } else {
                90
            }
        }
        OperationType::BuildCompile => {
            if program == "tsc" {
                60
            } else {
                120
            }
        }
        OperationType::DockerBuild => 600,
        OperationType::TestSuite => {
            let e2e = E2E_RUNNERS.contains(&program.as_str())
                || args.iter().any(|a| a.to_lowercase().contains("e2e"));
            if e2e {
                600
            } else {
                180
            }
        }
        OperationType::Deployment => 300,
        OperationType::Database => 120,
        OperationType::Other => 30,
    };
    Duration::from_secs(secs)
}

fn is_package_install(program: &str, first: Option<&str>, args: &[String]) -> bool {
    match program {
        "npm" | "pnpm" => first.map_or(false, |a| INSTALL_VERBS.contains(&a)),
        // Bare `yarn` installs
        "yarn" => first.map_or(true, |a| INSTALL_VERBS.contains(&a)),
        "pip" | "pip3" | "cargo" => first == Some("install"),
        "python" | "python3" => {
            args.len() >= 3 && args[0] == "-m" && args[1] == "pip" && args[2] == "install"
        }
        _ => false,
    }
}

fn is_script_test(program: &str, args: &[String]) -> bool {
    if program == "cargo" || program == "go" {
        return args.first().map_or(false, |a| a == "test");
    }
    if !PACKAGE_MANAGERS.contains(&program) {
        return false;
    }
    match args.first().map(String::as_str) {
        Some("test") | Some("t") => true,
        Some("run") => args.get(1).map_or(false, |s| s.starts_with("test")),
        _ => false,
    }
}

/// Basename, lowercased, without a Windows `.exe`/`.cmd` suffix
fn program_name(command: &str) -> String {
    let base = command.rsplit(['/', '\\']).next().unwrap_or(command);
    let base = base.to_lowercase();
    match base.strip_suffix(".exe").or_else(|| base.strip_suffix(".cmd")) {
        Some(stem) => stem.to_string(),
        None => base,
    }
}

fn command_line(command: &str, args: &[String]) -> String {
    std::iter::once(command)
        .chain(args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(command: &str, args: &[&str]) -> OperationType {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        classify_operation(command, &args)
    }

    #[test]
    fn test_package_installs() {
        assert_eq!(classify("npm", &["install"]), OperationType::PackageInstall);
        assert_eq!(classify("npm", &["ci"]), OperationType::PackageInstall);
        assert_eq!(classify("pnpm", &["add", "react"]), OperationType::PackageInstall);
        assert_eq!(classify("yarn", &[]), OperationType::PackageInstall);
        assert_eq!(classify("pip", &["install", "requests"]), OperationType::PackageInstall);
        assert_eq!(classify("cargo", &["install", "ripgrep"]), OperationType::PackageInstall);
    }

    #[test]
    fn test_docker_build_wins_over_generic_build() {
        assert_eq!(classify("docker", &["build", "."]), OperationType::DockerBuild);
        assert_eq!(classify("/usr/bin/docker", &["build", "-t", "app", "."]), OperationType::DockerBuild);
        assert_eq!(classify("docker", &["ps"]), OperationType::Other);
    }

    #[test]
    fn test_builds() {
        assert_eq!(classify("tsc", &["--noEmit"]), OperationType::BuildCompile);
        assert_eq!(classify("npm", &["run", "build"]), OperationType::BuildCompile);
        assert_eq!(classify("cargo", &["build", "--release"]), OperationType::BuildCompile);
        assert_eq!(classify("vite", &[]), OperationType::BuildCompile);
    }

    #[test]
    fn test_tests() {
        assert_eq!(classify("jest", &[]), OperationType::TestSuite);
        assert_eq!(classify("npm", &["test"]), OperationType::TestSuite);
        assert_eq!(classify("npm", &["run", "test:unit"]), OperationType::TestSuite);
        assert_eq!(classify("cargo", &["test"]), OperationType::TestSuite);
        assert_eq!(classify("npx", &["playwright", "test"]), OperationType::TestSuite);
    }

    #[test]
    fn test_deploy_and_database() {
        assert_eq!(classify("npm", &["publish"]), OperationType::Deployment);
        assert_eq!(classify("vercel", &["deploy", "--prod"]), OperationType::Deployment);
        assert_eq!(classify("npx", &["prisma", "migrate", "dev"]), OperationType::Database);
        assert_eq!(classify("knex", &["seed:run"]), OperationType::Database);
        assert_eq!(classify("echo", &["hello"]), OperationType::Other);
    }

    #[test]
    fn test_estimates() {
        fn args(a: &[&str]) -> Vec<String> {
            a.iter().map(|s| s.to_string()).collect()
        }
        assert_eq!(
            estimate_execution_duration(OperationType::PackageInstall, "npm", &args(&["install", "-g", "x"])),
            Duration::from_secs(120)
        );
        assert_eq!(
            estimate_execution_duration(OperationType::PackageInstall, "npm", &args(&["install"])),
            Duration::from_secs(90)
        );
        assert_eq!(
            estimate_execution_duration(OperationType::DockerBuild, "docker", &args(&["build", "."])),
            Duration::from_secs(600)
        );
        assert_eq!(
            estimate_execution_duration(OperationType::TestSuite, "cypress", &args(&["run"])),
            Duration::from_secs(600)
        );
        assert_eq!(
            estimate_execution_duration(OperationType::TestSuite, "jest", &[]),
            Duration::from_secs(180)
        );
        assert_eq!(
            estimate_execution_duration(OperationType::Other, "echo", &[]),
            Duration::from_secs(30)
        );
    }
}
