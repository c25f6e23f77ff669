/// Result of validating a stdio endpoint's command/args/env before ever
/// spawning it, spec §4.2. Carries the rejection reason so the Pool can
/// drop it straight into `HealthRecord::last_error` without re-deriving it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Ok,
    Rejected(String),
}

impl ValidationOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, ValidationOutcome::Ok)
    }
}

const SHELL_METACHARACTERS: &[char] = &[';', '&', '|', '`', '$', '(', ')', '<', '>', '\n'];

/// Runtime basenames spec §4.2 expects to see fronting an MCP server:
/// language runtimes, container tooling, the POSIX shells (in case a
/// downstream genuinely needs one as an interpreter rather than for shell
/// injection), and the build-tool launchers wrapping them (`npx`, `uvx`,
/// `pnpm`, `yarn`).
const KNOWN_RUNTIME_BASENAMES: &[&str] = &[
    "node", "nodejs", "python", "python3", "python2", "docker", "podman", "sh", "bash", "zsh", "dash", "npx", "uvx",
    "uv", "pnpm", "yarn", "deno", "bun", "cargo", "go",
];

/// Validate a command line intended for direct `exec`, never a shell.
/// Rejects shell metacharacters (since there is no shell to interpret them,
/// their presence signals either a misconfiguration or an injection
/// attempt), path traversal in the basename, and non-string env values
/// (callers must have already coerced env to `HashMap<String, String>`, so
/// this mainly guards empty keys). An unrecognized basename is never
/// rejected outright — operators run plenty of legitimate MCP servers under
/// names this list can't anticipate — but it is logged at warning level so
/// an unexpected launcher doesn't pass silently (spec §4.2).
pub fn validate_command(command: &str, args: &[String], env: &std::collections::HashMap<String, String>) -> ValidationOutcome {
    if command.trim().is_empty() {
        return ValidationOutcome::Rejected("command is empty".into());
    }
    if let Some(c) = contains_metacharacter(command) {
        return ValidationOutcome::Rejected(format!("command contains shell metacharacter '{c}'"));
    }
    if command.contains("../") || command.contains("..\\") {
        return ValidationOutcome::Rejected("command path contains '..'".into());
    }
    for arg in args {
        if let Some(c) = contains_metacharacter(arg) {
            return ValidationOutcome::Rejected(format!("argument contains shell metacharacter '{c}'"));
        }
    }
    for key in env.keys() {
        if key.trim().is_empty() {
            return ValidationOutcome::Rejected("environment variable name is empty".into());
        }
    }

    let basename = basename_of(command);
    if !KNOWN_RUNTIME_BASENAMES.contains(&basename.as_str()) && !resolves_to_executable(command) {
        tracing::warn!(
            target = "validator",
            command = %command,
            basename = %basename,
            "stdio command uses an unrecognized runtime basename and does not resolve to an executable on PATH"
        );
    }

    ValidationOutcome::Ok
}

fn contains_metacharacter(s: &str) -> Option<char> {
    s.chars().find(|c| SHELL_METACHARACTERS.contains(c))
}

fn basename_of(command: &str) -> String {
    std::path::Path::new(command)
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| command.to_string())
}

/// Best-effort check for whether `command` resolves to something executable,
/// either as an absolute/relative path or via `PATH`. Never used to reject —
/// only to decide whether the unrecognized-basename warning fires — so a
/// nonexistent binary here is not itself an error; the Pool will surface the
/// real failure when it actually tries to spawn it.
fn resolves_to_executable(command: &str) -> bool {
    let path = std::path::Path::new(command);
    if path.is_absolute() || command.contains('/') {
        return is_executable_file(path);
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| is_executable_file(&dir.join(command))))
        .unwrap_or(false)
}

#[cfg(unix)]
fn is_executable_file(path: &std::path::Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0).unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable_file(path: &std::path::Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn accepts_a_plain_command() {
        let env = HashMap::new();
        let out = validate_command("npx", &["-y".into(), "@modelcontextprotocol/server-git".into()], &env);
        assert_eq!(out, ValidationOutcome::Ok);
    }

    #[test]
    fn rejects_shell_metacharacters_in_command() {
        let env = HashMap::new();
        let out = validate_command("echo hi; rm -rf /", &[], &env);
        assert!(!out.is_ok());
    }

    #[test]
    fn rejects_shell_metacharacters_in_args() {
        let env = HashMap::new();
        let out = validate_command("node", &["server.js".into(), "$(whoami)".into()], &env);
        assert!(!out.is_ok());
    }

    #[test]
    fn rejects_path_traversal() {
        let env = HashMap::new();
        let out = validate_command("../../bin/sh", &[], &env);
        assert!(!out.is_ok());
    }

    #[test]
    fn rejects_empty_env_key() {
        let mut env = HashMap::new();
        env.insert(String::new(), "x".into());
        let out = validate_command("node", &[], &env);
        assert!(!out.is_ok());
    }

    #[test]
    fn rejects_empty_command() {
        let env = HashMap::new();
        let out = validate_command("   ", &[], &env);
        assert!(!out.is_ok());
    }

    #[test]
    fn known_runtime_basename_is_accepted() {
        let env = HashMap::new();
        let out = validate_command("python3", &["server.py".into()], &env);
        assert_eq!(out, ValidationOutcome::Ok);
    }

    #[test]
    fn unrecognized_basename_that_does_not_resolve_is_still_accepted() {
        let env = HashMap::new();
        let out = validate_command("/definitely/not/a/real/binary-ncp-test", &[], &env);
        assert_eq!(out, ValidationOutcome::Ok);
    }
}
