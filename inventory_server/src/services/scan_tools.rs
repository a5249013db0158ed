//! Registry of supported scanners: how to invoke them and how to read their
//! exit codes.

use std::path::{Path, PathBuf};

/// Meaning of one scanner exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCodeRule {
    pub code: i32,
    pub success: bool,
    pub description: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    Success(&'static str),
    Failure(&'static str),
    /// Not in the tool's table, or killed by a signal.
    Unknown,
}

impl ExitClass {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolSpec {
    pub name: &'static str,
    /// Executable looked up on PATH before a run starts.
    pub binary: &'static str,
    /// Whitespace-separated template. Placeholders: `{config}`,
    /// `{scan_folder}`, `{report_folder}`, `{report_name}`.
    pub command: &'static str,
    pub report_name: &'static str,
    pub exit_codes: &'static [ExitCodeRule],
}

pub static GITLEAKS: ToolSpec = ToolSpec {
    name: "gitleaks",
    binary: "gitleaks",
    command: "gitleaks -c {config} detect -s {scan_folder} --exit-code 2 -f json -r {report_folder}/{report_name}",
    report_name: "report-gitleaks-nogit.json",
    exit_codes: &[
        ExitCodeRule {
            code: 0,
            success: true,
            description: "gitleaks ran successfully and found no leaks",
        },
        ExitCodeRule {
            code: 1,
            success: false,
            description: "gitleaks ran with errors",
        },
        ExitCodeRule {
            code: 2,
            success: true,
            description: "gitleaks ran successfully and found leaks",
        },
    ],
};

static TOOLS: &[&ToolSpec] = &[&GITLEAKS];

pub fn lookup(name: &str) -> Option<&'static ToolSpec> {
    TOOLS.iter().copied().find(|tool| tool.name == name)
}

impl ToolSpec {
    /// Argument vector with placeholders filled in. Substituted paths are
    /// never split, whatever characters they contain.
    pub fn command_line(&self, config: &Path, scan_folder: &Path, report_folder: &Path) -> Vec<String> {
        let config = config.display().to_string();
        let scan_folder = scan_folder.display().to_string();
        let report_folder = report_folder.display().to_string();

        self.command
            .split_whitespace()
            .map(|token| {
                token
                    .replace("{config}", &config)
                    .replace("{scan_folder}", &scan_folder)
                    .replace("{report_folder}", &report_folder)
                    .replace("{report_name}", self.report_name)
            })
            .collect()
    }

    pub fn classify(&self, code: Option<i32>) -> ExitClass {
        let Some(code) = code else {
            return ExitClass::Unknown;
        };
        match self.exit_codes.iter().find(|rule| rule.code == code) {
            Some(rule) if rule.success => ExitClass::Success(rule.description),
            Some(rule) => ExitClass::Failure(rule.description),
            None => ExitClass::Unknown,
        }
    }
}

/// Resolved location of `binary` on PATH.
pub fn tool_path(binary: &str) -> Option<PathBuf> {
    which::which(binary).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gitleaks_exit_codes() {
        assert_eq!(
            GITLEAKS.classify(Some(0)),
            ExitClass::Success("gitleaks ran successfully and found no leaks")
        );
        assert!(GITLEAKS.classify(Some(2)).is_success());
        assert!(matches!(GITLEAKS.classify(Some(1)), ExitClass::Failure(_)));
        assert_eq!(GITLEAKS.classify(Some(137)), ExitClass::Unknown);
        assert_eq!(GITLEAKS.classify(None), ExitClass::Unknown);
    }

    #[test]
    fn placeholders_do_not_split_paths() {
        let argv = GITLEAKS.command_line(
            Path::new("/etc/gitleaks rules.toml"),
            Path::new("/tmp/scan/git.example.com/42"),
            Path::new("/tmp/scan/git.example.com/42"),
        );
        assert_eq!(
            argv,
            vec![
                "gitleaks",
                "-c",
                "/etc/gitleaks rules.toml",
                "detect",
                "-s",
                "/tmp/scan/git.example.com/42",
                "--exit-code",
                "2",
                "-f",
                "json",
                "-r",
                "/tmp/scan/git.example.com/42/report-gitleaks-nogit.json",
            ]
        );
    }

    #[test]
    fn lookup_by_name() {
        assert_eq!(lookup("gitleaks").map(|t| t.report_name), Some("report-gitleaks-nogit.json"));
        assert!(lookup("trufflehog").is_none());
    }

    #[test]
    fn sh_is_on_path() {
        let sh = tool_path("sh").unwrap();
        assert!(sh.is_absolute());
        assert!(sh.ends_with("sh"));
        assert!(tool_path("definitely-not-a-real-binary-name").is_none());
    }
}
