use std::fs;
use std::process::{Command, ExitStatus, Stdio};

use camino::Utf8Path;
use serde_json::Value;

use crate::error::UsageError;

/// A fully assembled child invocation for a prefix-dispatched task.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ChildCommand {
    pub program: String,
    pub args: Vec<String>,
}

/// Builds the command line for a prefix-dispatched task body:
/// `<prefix words> <self-invocation> --task-name N --task-id I --cache P --args J`.
///
/// The child reconstructs the task from its name and literal args, runs the
/// body, populates the cache entry, and exits 0.
pub(crate) fn child_command(
    slot: &str,
    prefix: &str,
    self_invocation: &[String],
    task_name: &str,
    task_id: &str,
    cache_root: &Utf8Path,
    args_json: &Value,
) -> Result<ChildCommand, UsageError> {
    let mut words = split_words(prefix).map_err(|reason| UsageError::BadPrefix {
        slot: slot.to_string(),
        reason,
    })?;

    if words.is_empty() {
        return Err(UsageError::EmptyPrefix(slot.to_string()));
    }

    words.extend(self_invocation.iter().cloned());
    words.push("--task-name".to_string());
    words.push(task_name.to_string());
    words.push("--task-id".to_string());
    words.push(task_id.to_string());
    words.push("--cache".to_string());
    words.push(cache_root.to_string());
    words.push("--args".to_string());
    words.push(args_json.to_string());

    let program = words.remove(0);
    Ok(ChildCommand {
        program,
        args: words,
    })
}

/// Spawns the child with its stdout and stderr redirected to the entry's
/// log files, and waits for it to exit. The child is never killed; failure
/// is reported through its exit status.
pub(crate) fn run_child(
    command: &ChildCommand,
    stdout_path: &Utf8Path,
    stderr_path: &Utf8Path,
) -> std::io::Result<ExitStatus> {
    let stdout = fs::File::create(stdout_path)?;
    let stderr = fs::File::create(stderr_path)?;

    Command::new(&command.program)
        .args(&command.args)
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .status()
}

/// Splits a prefix string into words by POSIX shell rules: whitespace
/// separates, single quotes are literal, double quotes allow backslash
/// escapes, a bare backslash escapes the next character. No expansion of
/// any kind is performed.
pub(crate) fn split_words(input: &str) -> Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = input.chars();

    while let Some(ch) = chars.next() {
        match ch {
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            '\\' => {
                in_word = true;
                match chars.next() {
                    Some(next) => current.push(next),
                    None => return Err("trailing backslash".to_string()),
                }
            }
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(next) => current.push(next),
                        None => return Err("unterminated single quote".to_string()),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(next @ ('"' | '\\' | '$' | '`')) => current.push(next),
                            Some(next) => {
                                current.push('\\');
                                current.push(next);
                            }
                            None => return Err("unterminated double quote".to_string()),
                        },
                        Some(next) => current.push(next),
                        None => return Err("unterminated double quote".to_string()),
                    }
                }
            }
            other => {
                in_word = true;
                current.push(other);
            }
        }
    }

    if in_word {
        words.push(current);
    }

    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_plain_words() {
        assert_eq!(
            split_words("srun --partition gpu").unwrap(),
            vec!["srun", "--partition", "gpu"],
        );
    }

    #[test]
    fn test_split_quotes() {
        assert_eq!(
            split_words(r#"docker run -e 'NAME=a b' --label "x\"y""#).unwrap(),
            vec!["docker", "run", "-e", "NAME=a b", "--label", "x\"y"],
        );
    }

    #[test]
    fn test_split_empty_quoted_word() {
        assert_eq!(split_words("a '' b").unwrap(), vec!["a", "", "b"]);
    }

    #[test]
    fn test_split_backslash() {
        assert_eq!(split_words(r"a\ b c").unwrap(), vec!["a b", "c"]);
    }

    #[test]
    fn test_split_unterminated() {
        assert!(split_words("'oops").is_err());
        assert!(split_words("\"oops").is_err());
        assert!(split_words("oops\\").is_err());
    }

    #[test]
    fn test_child_command_shape() {
        let cmd = child_command(
            "gpu",
            "/usr/bin/env -i",
            &["worker".to_string(), "__task".to_string()],
            "choose",
            "abcd",
            Utf8Path::new("/tmp/cache"),
            &serde_json::json!({ "n": 1 }),
        )
        .unwrap();

        assert_eq!(cmd.program, "/usr/bin/env");
        assert_eq!(
            cmd.args[..8],
            [
                "-i", "worker", "__task", "--task-name", "choose", "--task-id", "abcd",
                "--cache",
            ],
        );
        assert_eq!(cmd.args[9], "--args");
    }

    #[test]
    fn test_empty_prefix_rejected() {
        let err = child_command(
            "gpu",
            "   ",
            &[],
            "t",
            "i",
            Utf8Path::new("/c"),
            &Value::Null,
        )
        .unwrap_err();
        assert!(matches!(err, UsageError::EmptyPrefix(_)));
    }
}
