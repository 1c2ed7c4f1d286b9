//! Workspace sandbox.
//!
//! Every path a tool touches is resolved against a canonical workspace root
//! and rejected (never clamped) if it would land outside it. Shell commands
//! are screened for expansion syntax and out-of-root path arguments before
//! they reach the confined runner in `neural-execution`.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Stable machine-readable code for each sandbox violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxErrorCode {
    PathEscape,
    PathAbsolute,
    PathInvalid,
    PathNotFound,
    ExpectedFile,
    ExpectedDirectory,
    RootOutOfPolicy,
    RootUnavailable,
    CommandEmpty,
    CommandUnsafeSyntax,
    CommandPathOutsideWorkspace,
    Io,
}

impl SandboxErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxErrorCode::PathEscape => "path_escape",
            SandboxErrorCode::PathAbsolute => "path_absolute",
            SandboxErrorCode::PathInvalid => "path_invalid",
            SandboxErrorCode::PathNotFound => "path_not_found",
            SandboxErrorCode::ExpectedFile => "expected_file",
            SandboxErrorCode::ExpectedDirectory => "expected_directory",
            SandboxErrorCode::RootOutOfPolicy => "root_out_of_policy",
            SandboxErrorCode::RootUnavailable => "root_unavailable",
            SandboxErrorCode::CommandEmpty => "command_empty",
            SandboxErrorCode::CommandUnsafeSyntax => "command_unsafe_syntax",
            SandboxErrorCode::CommandPathOutsideWorkspace => "command_path_outside_workspace",
            SandboxErrorCode::Io => "io_error",
        }
    }
}

impl fmt::Display for SandboxErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
#[error("[{code}] {message}")]
pub struct SandboxError {
    pub code: SandboxErrorCode,
    pub message: String,
}

impl SandboxError {
    pub fn new(code: SandboxErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn io(context: &str, path: &Path, err: std::io::Error) -> Self {
        Self::new(
            SandboxErrorCode::Io,
            format!("{} '{}': {}", context, path.display(), err),
        )
    }
}

pub type SandboxResult<T> = std::result::Result<T, SandboxError>;

/// Which roots a workspace may be opened at.
#[derive(Debug, Clone, Default)]
pub struct WorkspacePolicy {
    pub default_root: PathBuf,
    /// When non-empty, the canonical root must descend from one of these
    pub allowed_roots: Vec<PathBuf>,
}

impl WorkspacePolicy {
    pub fn from_config(config: &neural_config::Config) -> Self {
        Self {
            default_root: config.default_root(),
            allowed_roots: config.allowed_roots(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// A canonical, existing workspace root and the checks bound to it.
#[derive(Debug, Clone)]
pub struct WorkspaceSandbox {
    root: PathBuf,
    policy: WorkspacePolicy,
}

impl WorkspaceSandbox {
    /// Open the sandbox at `requested` (or the policy default), creating the
    /// directory if it does not exist yet.
    pub fn open(requested: Option<&Path>, policy: &WorkspacePolicy) -> SandboxResult<Self> {
        let wanted = requested.unwrap_or(&policy.default_root);
        if wanted.as_os_str().is_empty() {
            return Err(SandboxError::new(
                SandboxErrorCode::RootUnavailable,
                "No workspace root configured",
            ));
        }
        if !wanted.is_absolute() {
            return Err(SandboxError::new(
                SandboxErrorCode::RootUnavailable,
                format!("Workspace root must be absolute: '{}'", wanted.display()),
            ));
        }

        std::fs::create_dir_all(wanted)
            .map_err(|e| SandboxError::io("Cannot create workspace root", wanted, e))?;
        let root = std::fs::canonicalize(wanted)
            .map_err(|e| SandboxError::io("Cannot resolve workspace root", wanted, e))?;
        if !root.is_dir() {
            return Err(SandboxError::new(
                SandboxErrorCode::RootUnavailable,
                format!("Workspace root is not a directory: '{}'", root.display()),
            ));
        }

        if !policy.allowed_roots.is_empty() {
            let allowed = policy.allowed_roots.iter().any(|allowed| {
                std::fs::canonicalize(allowed)
                    .map(|allowed| root.starts_with(allowed))
                    .unwrap_or(false)
            });
            if !allowed {
                warn!("Workspace root {} rejected by policy", root.display());
                return Err(SandboxError::new(
                    SandboxErrorCode::RootOutOfPolicy,
                    format!(
                        "Workspace root '{}' is not under any allowed root",
                        root.display()
                    ),
                ));
            }
        }

        debug!("Workspace sandbox opened at {}", root.display());
        Ok(Self {
            root,
            policy: policy.clone(),
        })
    }

    /// Re-open the sandbox at a new root under the same policy.
    pub fn reopen_at(&self, new_root: &Path) -> SandboxResult<Self> {
        Self::open(Some(new_root), &self.policy)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn policy(&self) -> &WorkspacePolicy {
        &self.policy
    }

    /// Lexically join a relative path onto the root, rejecting absolute
    /// paths, null bytes and `..` components that climb above the root.
    pub fn lexical_join(&self, relative: &str) -> SandboxResult<PathBuf> {
        if relative.contains('\0') {
            return Err(SandboxError::new(
                SandboxErrorCode::PathInvalid,
                "Path contains a null byte",
            ));
        }
        let trimmed = relative.trim();
        if trimmed.is_empty() {
            return Err(SandboxError::new(
                SandboxErrorCode::PathInvalid,
                "Path is empty",
            ));
        }
        let path = Path::new(trimmed);
        if path.is_absolute() || trimmed.starts_with('~') {
            return Err(SandboxError::new(
                SandboxErrorCode::PathAbsolute,
                format!("Path must be relative to the workspace root: '{}'", trimmed),
            ));
        }

        let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
        for component in path.components() {
            match component {
                Component::Normal(part) => parts.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    if parts.pop().is_none() {
                        return Err(SandboxError::new(
                            SandboxErrorCode::PathEscape,
                            format!("Path escapes the workspace root: '{}'", trimmed),
                        ));
                    }
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(SandboxError::new(
                        SandboxErrorCode::PathAbsolute,
                        format!("Path must be relative to the workspace root: '{}'", trimmed),
                    ));
                }
            }
        }

        let mut joined = self.root.clone();
        joined.extend(parts);
        Ok(joined)
    }

    fn ensure_contained(&self, resolved: &Path, original: &str) -> SandboxResult<()> {
        if resolved.starts_with(&self.root) {
            Ok(())
        } else {
            warn!(
                "Sandbox escape blocked: '{}' resolves to {}",
                original,
                resolved.display()
            );
            Err(SandboxError::new(
                SandboxErrorCode::PathEscape,
                format!("Path '{}' resolves outside the workspace root", original),
            ))
        }
    }

    /// Resolve an existing path for reading.
    pub fn resolve_read(&self, relative: &str, kind: Option<EntryKind>) -> SandboxResult<PathBuf> {
        let joined = self.lexical_join(relative)?;
        if !joined.exists() {
            // exists() follows symlinks; a dangling link is reported the same way
            return Err(SandboxError::new(
                SandboxErrorCode::PathNotFound,
                format!("No such file or directory: '{}'", relative),
            ));
        }
        let canonical = std::fs::canonicalize(&joined)
            .map_err(|e| SandboxError::io("Cannot resolve path", &joined, e))?;
        self.ensure_contained(&canonical, relative)?;

        match kind {
            Some(EntryKind::File) if !canonical.is_file() => Err(SandboxError::new(
                SandboxErrorCode::ExpectedFile,
                format!("Not a file: '{}'", relative),
            )),
            Some(EntryKind::Directory) if !canonical.is_dir() => Err(SandboxError::new(
                SandboxErrorCode::ExpectedDirectory,
                format!("Not a directory: '{}'", relative),
            )),
            _ => Ok(canonical),
        }
    }

    /// Resolve a path for writing a file, creating missing parent directories.
    ///
    /// The deepest existing ancestor is validated before anything is created,
    /// so an escaping path never mutates the filesystem.
    pub fn resolve_write(&self, relative: &str) -> SandboxResult<PathBuf> {
        let joined = self.lexical_join(relative)?;
        let file_name = joined
            .file_name()
            .map(|n| n.to_os_string())
            .ok_or_else(|| {
                SandboxError::new(
                    SandboxErrorCode::PathInvalid,
                    format!("Path does not name a file: '{}'", relative),
                )
            })?;
        let parent = joined.parent().unwrap_or(&self.root).to_path_buf();

        let mut ancestor = parent.as_path();
        while !ancestor.exists() {
            match ancestor.parent() {
                Some(next) => ancestor = next,
                None => break,
            }
        }
        let canonical_ancestor = std::fs::canonicalize(ancestor)
            .map_err(|e| SandboxError::io("Cannot resolve path", ancestor, e))?;
        self.ensure_contained(&canonical_ancestor, relative)?;

        std::fs::create_dir_all(&parent)
            .map_err(|e| SandboxError::io("Cannot create directory", &parent, e))?;
        let canonical_parent = std::fs::canonicalize(&parent)
            .map_err(|e| SandboxError::io("Cannot resolve path", &parent, e))?;
        self.ensure_contained(&canonical_parent, relative)?;
        if !canonical_parent.is_dir() {
            return Err(SandboxError::new(
                SandboxErrorCode::ExpectedDirectory,
                format!("Parent is not a directory: '{}'", relative),
            ));
        }

        let target = canonical_parent.join(file_name);
        if target.exists() || target.symlink_metadata().is_ok() {
            let canonical_target = std::fs::canonicalize(&target).map_err(|_| {
                SandboxError::new(
                    SandboxErrorCode::PathEscape,
                    format!("Path '{}' is a dangling link", relative),
                )
            })?;
            self.ensure_contained(&canonical_target, relative)?;
            if canonical_target.is_dir() {
                return Err(SandboxError::new(
                    SandboxErrorCode::ExpectedFile,
                    format!("Cannot write over a directory: '{}'", relative),
                ));
            }
            return Ok(canonical_target);
        }

        Ok(target)
    }

    /// Screen a shell command before execution.
    pub fn validate_command(&self, command: &str) -> SandboxResult<()> {
        let trimmed = command.trim();
        if trimmed.is_empty() {
            return Err(SandboxError::new(
                SandboxErrorCode::CommandEmpty,
                "Command is empty",
            ));
        }
        if command.contains('\0') {
            return Err(SandboxError::new(
                SandboxErrorCode::CommandUnsafeSyntax,
                "Command contains a null byte",
            ));
        }
        if let Some(reason) = unsafe_expansion(command) {
            return Err(SandboxError::new(
                SandboxErrorCode::CommandUnsafeSyntax,
                format!("Command uses {}, which is not allowed", reason),
            ));
        }

        let segments = split_command(command);
        for segment in &segments {
            if let Some((verb, rest)) = segment.split_first() {
                if matches!(verb.as_str(), "cd" | "pushd") {
                    let target = rest.iter().find(|arg| !arg.starts_with('-'));
                    match target {
                        None => {
                            return Err(SandboxError::new(
                                SandboxErrorCode::CommandUnsafeSyntax,
                                format!("'{}' without a target leaves the workspace", verb),
                            ))
                        }
                        Some(target)
                            if target.starts_with('/')
                                || target.starts_with('~')
                                || target == "-"
                                || Path::new(target.as_str())
                                    .components()
                                    .any(|c| c == Component::ParentDir) =>
                        {
                            return Err(SandboxError::new(
                                SandboxErrorCode::CommandUnsafeSyntax,
                                format!("'{} {}' is not allowed; stay inside the workspace", verb, target),
                            ))
                        }
                        _ => {}
                    }
                }
            }

            for token in segment {
                self.validate_command_token(token)?;
            }
        }

        Ok(())
    }

    fn validate_command_token(&self, token: &str) -> SandboxResult<()> {
        // `--out=dir/file` style options carry their path after `=`
        let candidate = match token.split_once('=') {
            Some((flag, value)) if flag.starts_with('-') => value,
            _ => token,
        };
        if !looks_like_path(candidate) {
            return Ok(());
        }

        if candidate.starts_with('~') {
            return Err(SandboxError::new(
                SandboxErrorCode::CommandPathOutsideWorkspace,
                format!("Home-relative path '{}' is outside the workspace", candidate),
            ));
        }

        let path = Path::new(candidate);
        let normalized = if path.is_absolute() {
            normalize_lexically(path)
        } else {
            normalize_lexically(&self.root.join(path))
        };
        let resolved = match std::fs::canonicalize(&normalized) {
            Ok(canonical) => canonical,
            Err(_) => resolve_via_existing_ancestor(&normalized),
        };

        if resolved.starts_with(&self.root) {
            Ok(())
        } else {
            warn!("Command path outside workspace blocked: {}", candidate);
            Err(SandboxError::new(
                SandboxErrorCode::CommandPathOutsideWorkspace,
                format!("Path '{}' is outside the workspace root", candidate),
            ))
        }
    }
}

static DOLLAR_PAREN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$\(").expect("valid regex"));
static DOLLAR_BRACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$\{").expect("valid regex"));
static BARE_VAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$[A-Za-z_][A-Za-z0-9_]*").expect("valid regex"));

fn unsafe_expansion(command: &str) -> Option<&'static str> {
    if command.contains('`') {
        Some("backtick command substitution")
    } else if DOLLAR_PAREN.is_match(command) {
        Some("$(...) command substitution")
    } else if DOLLAR_BRACE.is_match(command) {
        Some("${...} parameter expansion")
    } else if BARE_VAR.is_match(command) {
        Some("$VAR variable expansion")
    } else {
        None
    }
}

fn looks_like_path(token: &str) -> bool {
    if token.is_empty() || token.contains("://") {
        return false;
    }
    token.contains('/') || token.starts_with('~') || token == ".." || token.starts_with("../")
}

/// Collapse `.` and `..` without touching the filesystem.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Canonicalize the deepest existing ancestor and re-append the rest.
fn resolve_via_existing_ancestor(path: &Path) -> PathBuf {
    let mut existing = path.to_path_buf();
    let mut tail = Vec::new();
    while !existing.exists() {
        match (existing.file_name().map(|n| n.to_os_string()), existing.parent()) {
            (Some(name), Some(parent)) => {
                tail.push(name);
                existing = parent.to_path_buf();
            }
            _ => break,
        }
    }
    let mut resolved = std::fs::canonicalize(&existing).unwrap_or(existing);
    for part in tail.into_iter().rev() {
        resolved.push(part);
    }
    resolved
}

/// Quote-aware split of a command line into simple-command word lists.
///
/// Control operators and redirections end a word; redirection targets become
/// ordinary words so they get path-checked like any other argument.
pub fn split_command(command: &str) -> Vec<Vec<String>> {
    let mut segments: Vec<Vec<String>> = Vec::new();
    let mut words: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = command.chars().peekable();

    fn flush(current: &mut String, in_word: &mut bool, words: &mut Vec<String>) {
        if *in_word {
            words.push(std::mem::take(current));
            *in_word = false;
        }
    }

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                for q in chars.by_ref() {
                    if q == '\'' {
                        break;
                    }
                    current.push(q);
                }
            }
            '"' => {
                in_word = true;
                while let Some(q) = chars.next() {
                    match q {
                        '"' => break,
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                current.push(escaped);
                            }
                        }
                        _ => current.push(q),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            ';' | '&' | '|' | '\n' | '(' | ')' => {
                flush(&mut current, &mut in_word, &mut words);
                if !words.is_empty() {
                    segments.push(std::mem::take(&mut words));
                }
            }
            '<' | '>' => {
                // A leading fd number such as `2>` belongs to the operator
                if in_word && current.chars().all(|ch| ch.is_ascii_digit()) {
                    current.clear();
                    in_word = false;
                }
                flush(&mut current, &mut in_word, &mut words);
                while matches!(chars.peek(), Some('>') | Some('&')) {
                    chars.next();
                }
            }
            c if c.is_whitespace() => flush(&mut current, &mut in_word, &mut words),
            _ => {
                in_word = true;
                current.push(c);
            }
        }
    }
    flush(&mut current, &mut in_word, &mut words);
    if !words.is_empty() {
        segments.push(words);
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn sandbox() -> (TempDir, WorkspaceSandbox) {
        let dir = TempDir::new().unwrap();
        let policy = WorkspacePolicy {
            default_root: dir.path().to_path_buf(),
            allowed_roots: Vec::new(),
        };
        let sandbox = WorkspaceSandbox::open(None, &policy).unwrap();
        (dir, sandbox)
    }

    #[test]
    fn test_open_creates_missing_root() {
        let dir = TempDir::new().unwrap();
        let wanted = dir.path().join("fresh").join("root");
        let policy = WorkspacePolicy::default();
        let sandbox = WorkspaceSandbox::open(Some(&wanted), &policy).unwrap();
        assert!(sandbox.root().is_dir());
        assert!(sandbox.root().is_absolute());
    }

    #[test]
    fn test_policy_rejects_root_outside_allowed() {
        let allowed = TempDir::new().unwrap();
        let elsewhere = TempDir::new().unwrap();
        let policy = WorkspacePolicy {
            default_root: allowed.path().to_path_buf(),
            allowed_roots: vec![allowed.path().to_path_buf()],
        };

        assert!(WorkspaceSandbox::open(Some(&allowed.path().join("nested")), &policy).is_ok());
        let err = WorkspaceSandbox::open(Some(elsewhere.path()), &policy).unwrap_err();
        assert_eq!(err.code, SandboxErrorCode::RootOutOfPolicy);
    }

    #[test]
    fn test_rejects_absolute_null_and_escaping_paths() {
        let (_dir, sandbox) = sandbox();

        assert_eq!(
            sandbox.resolve_read("/etc/passwd", None).unwrap_err().code,
            SandboxErrorCode::PathAbsolute
        );
        assert_eq!(
            sandbox.resolve_read("a\0b", None).unwrap_err().code,
            SandboxErrorCode::PathInvalid
        );
        assert_eq!(
            sandbox.resolve_write("../outside.txt").unwrap_err().code,
            SandboxErrorCode::PathEscape
        );
        assert_eq!(
            sandbox.resolve_write("a/../../outside.txt").unwrap_err().code,
            SandboxErrorCode::PathEscape
        );
    }

    #[test]
    fn test_inner_parent_components_are_fine() {
        let (_dir, sandbox) = sandbox();
        let path = sandbox.resolve_write("notes/../todo.txt").unwrap();
        assert_eq!(path, sandbox.root().join("todo.txt"));
    }

    #[test]
    fn test_write_creates_parents_inside_root() {
        let (_dir, sandbox) = sandbox();
        let path = sandbox.resolve_write("deep/nested/file.md").unwrap();
        assert!(path.starts_with(sandbox.root()));
        assert!(sandbox.root().join("deep/nested").is_dir());
    }

    #[test]
    fn test_read_kind_checks() {
        let (_dir, sandbox) = sandbox();
        fs::create_dir(sandbox.root().join("dir")).unwrap();
        fs::write(sandbox.root().join("file.txt"), "x").unwrap();

        assert_eq!(
            sandbox
                .resolve_read("dir", Some(EntryKind::File))
                .unwrap_err()
                .code,
            SandboxErrorCode::ExpectedFile
        );
        assert_eq!(
            sandbox
                .resolve_read("file.txt", Some(EntryKind::Directory))
                .unwrap_err()
                .code,
            SandboxErrorCode::ExpectedDirectory
        );
        assert_eq!(
            sandbox.resolve_read("missing.txt", None).unwrap_err().code,
            SandboxErrorCode::PathNotFound
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_is_rejected_without_mutation() {
        let (_dir, sandbox) = sandbox();
        let outside = TempDir::new().unwrap();
        fs::write(outside.path().join("secret.txt"), "s").unwrap();
        std::os::unix::fs::symlink(outside.path(), sandbox.root().join("link")).unwrap();

        assert_eq!(
            sandbox.resolve_read("link/secret.txt", None).unwrap_err().code,
            SandboxErrorCode::PathEscape
        );
        assert_eq!(
            sandbox.resolve_write("link/new/file.txt").unwrap_err().code,
            SandboxErrorCode::PathEscape
        );
        assert!(!outside.path().join("new").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_file_pointing_outside_cannot_be_written() {
        let (_dir, sandbox) = sandbox();
        let outside = TempDir::new().unwrap();
        let target = outside.path().join("target.txt");
        fs::write(&target, "t").unwrap();
        std::os::unix::fs::symlink(&target, sandbox.root().join("alias.txt")).unwrap();

        assert_eq!(
            sandbox.resolve_write("alias.txt").unwrap_err().code,
            SandboxErrorCode::PathEscape
        );
    }

    #[test]
    fn test_command_expansions_are_rejected() {
        let (_dir, sandbox) = sandbox();
        for command in [
            "echo `whoami`",
            "echo $(whoami)",
            "echo ${HOME}",
            "cat $HOME/.ssh/id_rsa",
        ] {
            let err = sandbox.validate_command(command).unwrap_err();
            assert_eq!(err.code, SandboxErrorCode::CommandUnsafeSyntax, "{}", command);
        }
    }

    #[test]
    fn test_cd_outside_is_rejected() {
        let (_dir, sandbox) = sandbox();
        for command in ["cd /tmp && ls", "cd ~ && ls", "cd .. && ls", "pushd ../x", "cd"] {
            assert_eq!(
                sandbox.validate_command(command).unwrap_err().code,
                SandboxErrorCode::CommandUnsafeSyntax,
                "{}",
                command
            );
        }
        fs::create_dir(sandbox.root().join("src")).unwrap();
        assert!(sandbox.validate_command("cd src && ls -la").is_ok());
    }

    #[test]
    fn test_path_arguments_are_checked() {
        let (_dir, sandbox) = sandbox();
        assert_eq!(
            sandbox
                .validate_command("cat ../../etc/passwd")
                .unwrap_err()
                .code,
            SandboxErrorCode::CommandPathOutsideWorkspace
        );
        assert_eq!(
            sandbox.validate_command("ls /etc").unwrap_err().code,
            SandboxErrorCode::CommandPathOutsideWorkspace
        );
        assert_eq!(
            sandbox
                .validate_command("echo hi > ~/.bashrc")
                .unwrap_err()
                .code,
            SandboxErrorCode::CommandPathOutsideWorkspace
        );
        assert_eq!(
            sandbox
                .validate_command("tar --file=/tmp/out.tar .")
                .unwrap_err()
                .code,
            SandboxErrorCode::CommandPathOutsideWorkspace
        );

        assert!(sandbox.validate_command("ls src/ && cat ./README.md").is_ok());
        assert!(sandbox
            .validate_command("curl -s https://example.com/a/b | head -n 5")
            .is_ok());
        let inside = sandbox.root().join("out.txt");
        assert!(sandbox
            .validate_command(&format!("echo hi > {}", inside.display()))
            .is_ok());
    }

    #[test]
    fn test_quoted_text_is_one_word() {
        let segments = split_command("grep -r 'a b' \"src dir\"; echo x 2>err.log");
        assert_eq!(
            segments,
            vec![
                vec!["grep".to_string(), "-r".into(), "a b".into(), "src dir".into()],
                vec!["echo".to_string(), "x".into(), "err.log".into()],
            ]
        );
    }

    #[test]
    fn test_empty_command_is_rejected() {
        let (_dir, sandbox) = sandbox();
        assert_eq!(
            sandbox.validate_command("   ").unwrap_err().code,
            SandboxErrorCode::CommandEmpty
        );
    }
}
