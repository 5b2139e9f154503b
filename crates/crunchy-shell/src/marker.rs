//! Directory markers embedded in command output.

use rand::Rng;
use rand::distr::Alphanumeric;
use regex::Regex;

const TOKEN_LEN: usize = 16;

/// Output with any marker removed, plus the directory it reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerScan {
    pub output: String,
    pub directory: Option<String>,
}

/// Per-invocation marker that makes the sandbox print its final directory.
#[derive(Debug, Clone)]
pub struct DirectoryMarker {
    token: String,
    pattern: Option<Regex>,
}

impl DirectoryMarker {
    /// Create a marker with a fresh random token.
    pub fn generate() -> Self {
        let token: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(TOKEN_LEN)
            .map(char::from)
            .collect();
        Self::with_token(token)
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        let token = token.into();
        let pattern = format!(
            r"\n?__CWD__{}:([^\n]*)__END__\n?",
            regex::escape(&token)
        );
        Self {
            token,
            pattern: Regex::new(&pattern).ok(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Shell snippet that prints the marker with the current directory.
    pub fn echo_command(&self) -> String {
        format!("echo __CWD__{}:$(pwd)__END__", self.token)
    }

    /// Append the marker echo to a command that starts in `quoted_dir`.
    pub fn wrap(&self, quoted_dir: &str, command: &str) -> String {
        format!("cd {quoted_dir}; {command}; {}", self.echo_command())
    }

    /// Strip every marker occurrence and return the last reported directory.
    pub fn extract(&self, output: &str) -> MarkerScan {
        let Some(pattern) = &self.pattern else {
            return MarkerScan {
                output: output.to_string(),
                directory: None,
            };
        };
        let directory = pattern
            .captures_iter(output)
            .last()
            .and_then(|captures| captures.get(1))
            .map(|path| path.as_str().to_string());
        let output = match directory {
            Some(_) => pattern.replace_all(output, "").into_owned(),
            None => output.to_string(),
        };
        MarkerScan { output, directory }
    }
}

#[cfg(test)]
mod tests {
    use super::{DirectoryMarker, MarkerScan};
    use pretty_assertions::{assert_eq, assert_ne};

    #[test]
    fn tokens_are_random_alphanumeric() {
        let first = DirectoryMarker::generate();
        let second = DirectoryMarker::generate();
        assert_ne!(first.token(), second.token());
        assert_eq!(first.token().len(), 16);
        assert!(first.token().chars().all(|ch| ch.is_ascii_alphanumeric()));
    }

    #[test]
    fn wrap_places_marker_after_command() {
        let marker = DirectoryMarker::with_token("abc");
        assert_eq!(
            marker.wrap("/tmp", "ls -la"),
            "cd /tmp; ls -la; echo __CWD__abc:$(pwd)__END__"
        );
    }

    #[test]
    fn extract_strips_marker_and_preceding_newline() {
        let marker = DirectoryMarker::with_token("abc");
        let scan = marker.extract("file1\nfile2\n__CWD__abc:/var/log__END__\n");
        assert_eq!(
            scan,
            MarkerScan {
                output: "file1\nfile2".to_string(),
                directory: Some("/var/log".to_string()),
            }
        );
    }

    #[test]
    fn extract_handles_output_without_trailing_newline() {
        let marker = DirectoryMarker::with_token("abc");
        let scan = marker.extract("no-newline__CWD__abc:/root__END__\n");
        assert_eq!(scan.output, "no-newline");
        assert_eq!(scan.directory.as_deref(), Some("/root"));
    }

    #[test]
    fn directories_with_spaces_are_captured() {
        let marker = DirectoryMarker::with_token("abc");
        let scan = marker.extract("__CWD__abc:/root/My Documents__END__\n");
        assert_eq!(scan.output, "");
        assert_eq!(scan.directory.as_deref(), Some("/root/My Documents"));
    }

    #[test]
    fn missing_or_foreign_markers_leave_output_untouched() {
        let marker = DirectoryMarker::with_token("abc");
        for raw in [
            "plain output\n",
            "__CWD__other:/etc__END__\n",
            "__CWD__abc:/etc\n",
            "",
        ] {
            let scan = marker.extract(raw);
            assert_eq!(scan.output, raw);
            assert_eq!(scan.directory, None);
        }
    }

    #[test]
    fn token_is_matched_literally() {
        let marker = DirectoryMarker::with_token("a.c");
        assert_eq!(marker.extract("__CWD__abc:/etc__END__").directory, None);
        assert_eq!(
            marker.extract("__CWD__a.c:/etc__END__").directory.as_deref(),
            Some("/etc")
        );
    }
}
