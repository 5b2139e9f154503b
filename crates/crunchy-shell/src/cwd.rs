//! Working directory tracking across stateless executions.
//!
//! Every command runs in a fresh process, so the session keeps its own idea
//! of the current directory. It is updated either by predicting `cd` locally
//! or by accepting a directory the sandbox reported.

/// Lexically clean a slash-separated path.
///
/// Collapses repeated separators, drops `.` elements, and resolves `..`
/// against the preceding element. `..` at the root of an absolute path stays
/// at the root. The empty path cleans to `.`.
pub fn clean_path(path: &str) -> String {
    let rooted = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => match parts.last() {
                Some(&last) if last != ".." => {
                    parts.pop();
                }
                _ if rooted => {}
                _ => parts.push(".."),
            },
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    match (rooted, joined.is_empty()) {
        (true, _) => format!("/{joined}"),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

/// Resolve the directory a `cd` command would move to.
///
/// Returns `None` when the leading token is not exactly `cd`. The target is
/// not checked for existence.
pub fn resolve_cd(command: &str, current: &str, home: &str) -> Option<String> {
    let words = shell_words::split(command)
        .unwrap_or_else(|_| command.split_whitespace().map(String::from).collect());
    let mut words = words.into_iter();
    if words.next().as_deref() != Some("cd") {
        return None;
    }
    let target = match words.next() {
        None => return Some(home.to_string()),
        Some(target) => target,
    };
    let resolved = match target.as_str() {
        "~" => home.to_string(),
        "-" => current.to_string(),
        _ => {
            if let Some(rest) = target.strip_prefix("~/") {
                clean_path(&format!("{home}/{rest}"))
            } else if target.starts_with('/') {
                clean_path(&target)
            } else {
                clean_path(&format!("{current}/{target}"))
            }
        }
    };
    Some(resolved)
}

/// The session's logical current directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryTracker {
    current: String,
    home: String,
}

impl DirectoryTracker {
    pub fn new(start: impl Into<String>, home: impl Into<String>) -> Self {
        Self {
            current: start.into(),
            home: home.into(),
        }
    }

    pub fn current(&self) -> &str {
        &self.current
    }

    pub fn home(&self) -> &str {
        &self.home
    }

    /// Directory `command` would move to, without changing state.
    pub fn predict(&self, command: &str) -> Option<String> {
        resolve_cd(command, &self.current, &self.home)
    }

    /// Apply local `cd` recognition. Returns whether the command was a `cd`.
    pub fn observe_command(&mut self, command: &str) -> bool {
        match self.predict(command) {
            Some(next) => {
                self.current = next;
                true
            }
            None => false,
        }
    }

    /// Accept the directory the sandbox reported as authoritative.
    pub fn apply_report(&mut self, reported: &str) {
        self.current = reported.to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::{DirectoryTracker, clean_path, resolve_cd};
    use pretty_assertions::assert_eq;

    #[test]
    fn clean_path_matches_lexical_rules() {
        let cases = [
            ("/", "/"),
            ("//usr///bin/", "/usr/bin"),
            ("/var/./log/..", "/var"),
            ("/../..", "/"),
            ("/tmp/../../etc", "/etc"),
            ("a/b/../../..", ".."),
            ("", "."),
            ("./", "."),
        ];
        for (input, expected) in cases {
            assert_eq!(clean_path(input), expected, "input {input:?}");
        }
    }

    #[test]
    fn bare_cd_and_tilde_go_home() {
        assert_eq!(resolve_cd("cd", "/tmp", "/root"), Some("/root".to_string()));
        assert_eq!(resolve_cd("cd ~", "/tmp", "/root"), Some("/root".to_string()));
        assert_eq!(
            resolve_cd("cd ~/.ssh", "/tmp", "/root"),
            Some("/root/.ssh".to_string())
        );
    }

    #[test]
    fn cd_dash_keeps_current_directory() {
        assert_eq!(
            resolve_cd("cd -", "/var/log", "/root"),
            Some("/var/log".to_string())
        );
    }

    #[test]
    fn relative_and_absolute_targets_are_cleaned() {
        assert_eq!(
            resolve_cd("cd ../etc", "/var/log", "/root"),
            Some("/var/etc".to_string())
        );
        assert_eq!(
            resolve_cd("cd /usr//local/./bin/", "/", "/root"),
            Some("/usr/local/bin".to_string())
        );
        assert_eq!(
            resolve_cd("cd 'My Documents'", "/root", "/root"),
            Some("/root/My Documents".to_string())
        );
    }

    #[test]
    fn only_an_exact_cd_token_is_recognized() {
        assert_eq!(resolve_cd("cdrecord /dev/sr0", "/", "/root"), None);
        assert_eq!(resolve_cd("ls /tmp", "/", "/root"), None);
        assert_eq!(resolve_cd("echo cd /tmp", "/", "/root"), None);
    }

    #[test]
    fn unbalanced_quotes_fall_back_to_whitespace_split() {
        assert_eq!(
            resolve_cd("cd /tmp 'oops", "/", "/root"),
            Some("/tmp".to_string())
        );
    }

    #[test]
    fn tracker_updates_from_prediction_or_report() {
        let mut tracker = DirectoryTracker::new("/", "/root");
        assert!(tracker.observe_command("cd /does/not/exist"));
        assert_eq!(tracker.current(), "/does/not/exist");
        assert!(!tracker.observe_command("ls"));
        assert_eq!(tracker.current(), "/does/not/exist");

        tracker.apply_report("/var/log");
        assert_eq!(tracker.current(), "/var/log");
        assert_eq!(tracker.predict("cd .."), Some("/var".to_string()));
        assert_eq!(tracker.current(), "/var/log");
    }
}
