//! Stateful shell emulation over stateless container execs.
//!
//! Each container exec is an independent `bash -c` invocation, so nothing a
//! command does to its shell (cd, export, alias, function definitions)
//! survives on its own. [`StatefulShell`] synthesizes persistence: every
//! command is wrapped in a composite script that first restores the recorded
//! state, then runs the user command, then dumps the resulting state between
//! rare markers so the parser can refresh its records from what the shell
//! actually observed.

use std::collections::{BTreeMap, VecDeque};
use std::sync::OnceLock;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Markers separating user output from the state dump. Chosen to be unlikely
/// to collide with real command output.
const STATE_MARKER: &str = "___DOCKHAND_STATE_a6f3___";
const ENV_MARKER: &str = "___DOCKHAND_ENV_a6f3___";
const ALIAS_MARKER: &str = "___DOCKHAND_ALIAS_a6f3___";
const END_MARKER: &str = "___DOCKHAND_END_a6f3___";

/// Oldest history entries are dropped past this cap.
const HISTORY_CAP: usize = 200;

/// Environment variables owned by the shell or the exec scrubber, never
/// tracked as user state.
const IGNORED_ENV_KEYS: &[&str] = &[
    "PATH", "PWD", "OLDPWD", "SHLVL", "SHELL", "HOME", "USER", "LOGNAME", "TERM", "HOSTNAME",
    "PS1", "PS2", "_", "AGENT_ID",
];

/// Persistent view of one conversation's shell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatefulShell {
    cwd: String,
    env: BTreeMap<String, String>,
    aliases: BTreeMap<String, String>,
    functions: BTreeMap<String, String>,
    history: VecDeque<String>,
}

impl Default for StatefulShell {
    fn default() -> Self {
        Self::new()
    }
}

impl StatefulShell {
    pub fn new() -> Self {
        Self {
            cwd: "/mnt".to_string(),
            env: BTreeMap::new(),
            aliases: BTreeMap::new(),
            functions: BTreeMap::new(),
            history: VecDeque::new(),
        }
    }

    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn aliases(&self) -> &BTreeMap<String, String> {
        &self.aliases
    }

    pub fn history(&self) -> impl Iterator<Item = &str> {
        self.history.iter().map(String::as_str)
    }

    /// Reset to the state of a fresh container shell.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Build the composite script for one user command.
    ///
    /// Layout: restore recorded state, run the user command in a grouping so
    /// its exit status is captured, then emit the marker-delimited state dump
    /// and exit with the saved status. The user command travels as a base64
    /// blob decoded into a single `bash` invocation, which sidesteps quoting
    /// pitfalls with heredocs and multiline input.
    pub fn build_command(&mut self, command: &str) -> String {
        let prepared = self.pre_parse(command);

        let mut setup: Vec<String> = Vec::new();
        setup.push(format!("cd '{}' 2>/dev/null || cd /mnt", shell_escape(&self.cwd)));
        for (key, value) in &self.env {
            setup.push(format!("export {}='{}'", key, shell_escape(value)));
        }
        for (name, value) in &self.aliases {
            setup.push(format!("alias {}='{}'", name, shell_escape(value)));
        }
        for body in self.functions.values() {
            setup.push(body.clone());
        }

        let encoded = BASE64.encode(prepared.as_bytes());
        let payload = format!("printf '%s' '{encoded}' | base64 -d | bash");

        let extraction = format!(
            "__DOCKHAND_EXIT=$?; \
             echo '{STATE_MARKER}'; \
             pwd; \
             echo '{ENV_MARKER}'; \
             env | grep -E '^[A-Za-z_][A-Za-z0-9_]*=' || true; \
             echo '{ALIAS_MARKER}'; \
             alias 2>/dev/null || true; \
             echo '{END_MARKER}'; \
             exit $__DOCKHAND_EXIT"
        );

        format!("{}; ({}); {}", setup.join("; "), payload, extraction)
    }

    /// Parse one exec's stdout: refresh cwd/env/aliases from the state dump
    /// and return only the user-visible portion. A missing or garbled marker
    /// sequence (shell killed mid-output, marker elided by `exec`) leaves the
    /// state untouched and returns the raw output.
    pub fn absorb_output(&mut self, output: &str) -> String {
        let Some((user_output, state_dump)) = output.split_once(STATE_MARKER) else {
            debug!("shell output carried no state markers; leaving state unchanged");
            return output.to_string();
        };

        let Some((pwd_part, rest)) = state_dump.split_once(ENV_MARKER) else {
            return output.to_string();
        };
        let Some((env_part, rest)) = rest.split_once(ALIAS_MARKER) else {
            return output.to_string();
        };
        let Some((alias_part, _)) = rest.split_once(END_MARKER) else {
            return output.to_string();
        };

        let pwd = pwd_part.trim();
        if !pwd.is_empty() {
            self.cwd = pwd.to_string();
        }

        self.refresh_env(env_part);
        self.refresh_aliases(alias_part);

        user_output.to_string()
    }

    fn refresh_env(&mut self, dump: &str) {
        let mut seen = BTreeMap::new();
        for line in dump.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            if key.starts_with("___") || key.starts_with("BASH_") || key.starts_with("__DOCKHAND") {
                continue;
            }
            if IGNORED_ENV_KEYS.contains(&key) {
                continue;
            }
            seen.insert(key.to_string(), value.to_string());
        }
        // `env` shows the full truth for what survives, so replace wholesale:
        // anything unset inside the command disappears here too.
        self.env = seen;
    }

    fn refresh_aliases(&mut self, dump: &str) {
        for line in dump.lines() {
            let def = line.strip_prefix("alias ").unwrap_or(line);
            let Some((name, value)) = def.split_once('=') else {
                continue;
            };
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            self.aliases
                .insert(name.to_string(), strip_quotes(value.trim()).to_string());
        }
    }

    /// Capture declarative intent the output parser cannot recover on its
    /// own. Conservative: supplements post-parse, never rewrites semantics.
    fn pre_parse(&mut self, command: &str) -> String {
        let trimmed = command.trim();

        self.history.push_back(trimmed.to_string());
        while self.history.len() > HISTORY_CAP {
            self.history.pop_front();
        }

        if trimmed == "cd" {
            // Bare `cd` goes home, like an interactive shell.
            return "cd ~".to_string();
        }

        if let Some(name) = trimmed.strip_prefix("unset ") {
            // Removed even if the command later fails: `unset` on a tracked
            // variable must not be resurrected by the restore prologue.
            self.env.remove(name.trim());
            return trimmed.to_string();
        }

        if let Some(name) = trimmed.strip_prefix("unalias ") {
            self.aliases.remove(name.trim());
            return trimmed.to_string();
        }

        if let Some(name) = parse_function_name(trimmed) {
            self.functions.insert(name, trimmed.to_string());
            return trimmed.to_string();
        }

        trimmed.to_string()
    }
}

/// Color/cursor escape sequences interactive shells sprinkle over stderr.
fn ansi_codes() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\x1b\[[0-9;]*[mGKHJ]").unwrap())
}

/// Strip ANSI escape codes and lines that are solely shell-prompt noise
/// from stderr.
pub fn clean_stderr(stderr: &str) -> String {
    let mut cleaned: Vec<String> = Vec::new();
    for line in stderr.lines() {
        let line = ansi_codes().replace_all(line, "");
        let stripped = line.trim();
        if stripped.is_empty() {
            continue;
        }
        if matches!(stripped, "%" | "$" | "#" | "%%") {
            continue;
        }
        // Full prompts look like `user@host dir %`.
        if stripped.contains('@') && stripped.ends_with('%') && stripped.split_whitespace().count() <= 3
        {
            continue;
        }
        cleaned.push(line.trim_end().to_string());
    }
    cleaned.join("\n")
}

fn shell_escape(value: &str) -> String {
    value.replace('\'', "'\\''")
}

fn strip_quotes(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'\'' && last == b'\'') || (first == b'"' && last == b'"') {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Recognize `function f { … }` and `f() { … }` definitions.
fn parse_function_name(command: &str) -> Option<String> {
    if let Some(rest) = command.strip_prefix("function ") {
        let name: String = rest
            .chars()
            .take_while(|c| !c.is_whitespace() && *c != '(' && *c != '{')
            .collect();
        if !name.is_empty() {
            return Some(name);
        }
    }
    if let Some(paren) = command.find("()") {
        let name = command[..paren].trim();
        if !name.is_empty()
            && command[paren..].contains('{')
            && name.chars().all(|c| c.is_alphanumeric() || c == '_')
        {
            return Some(name.to_string());
        }
    }
    None
}
