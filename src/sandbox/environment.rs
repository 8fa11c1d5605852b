//! Execution environments a task can ask for.

/// How generated code for one environment is stored and run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionEnvironment {
    /// Canonical environment name.
    pub name: &'static str,
    /// Container image providing the interpreter.
    pub image: &'static str,
    /// File the generated code is written to, inside the workspace.
    pub source_file: &'static str,
    /// Interpreter invocation; the source file is appended.
    pub interpreter: &'static [&'static str],
}

impl ExecutionEnvironment {
    /// Full command that runs the source file, relative to the workspace.
    pub fn run_command(&self) -> Vec<String> {
        self.interpreter
            .iter()
            .map(|part| part.to_string())
            .chain(std::iter::once(self.source_file.to_string()))
            .collect()
    }
}

const PYTHON: ExecutionEnvironment = ExecutionEnvironment {
    name: "python",
    image: "python:3.11-slim",
    source_file: "main.py",
    interpreter: &["python", "-u"],
};

const NODE: ExecutionEnvironment = ExecutionEnvironment {
    name: "node",
    image: "node:20-slim",
    source_file: "main.js",
    interpreter: &["node"],
};

const RUBY: ExecutionEnvironment = ExecutionEnvironment {
    name: "ruby",
    image: "ruby:3.3-slim",
    source_file: "main.rb",
    interpreter: &["ruby"],
};

const BASH: ExecutionEnvironment = ExecutionEnvironment {
    name: "bash",
    image: "debian:bookworm-slim",
    source_file: "main.sh",
    interpreter: &["bash"],
};

/// Resolves an environment name (case-insensitive).
///
/// Supported:
/// - "python", "python3", "py"
/// - "node", "nodejs", "javascript", "js"
/// - "ruby", "rb"
/// - "bash", "shell", "sh"
///
/// Unknown names fall back to "bash".
pub fn resolve_environment(name: &str) -> ExecutionEnvironment {
    match name.trim().to_lowercase().as_str() {
        "python" | "python3" | "py" => PYTHON,
        "node" | "nodejs" | "javascript" | "js" => NODE,
        "ruby" | "rb" => RUBY,
        "bash" | "shell" | "sh" => BASH,
        other => {
            tracing::debug!(environment = other, "Unknown execution environment, using bash");
            BASH
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_known_environments() {
        assert_eq!(resolve_environment("Python").image, "python:3.11-slim");
        assert_eq!(resolve_environment("javascript").name, "node");
        assert_eq!(resolve_environment(" sh ").name, "bash");
        assert_eq!(resolve_environment("rb").source_file, "main.rb");
    }

    #[test]
    fn test_unknown_environment_falls_back_to_bash() {
        assert_eq!(resolve_environment("cobol").name, "bash");
    }

    #[test]
    fn test_run_command() {
        assert_eq!(
            resolve_environment("python").run_command(),
            vec!["python", "-u", "main.py"]
        );
        assert_eq!(resolve_environment("node").run_command(), vec!["node", "main.js"]);
    }
}
