//! Foreground-app detector: produces the package name of the topmost
//! visible application, auto-selecting among three scraping strategies over
//! `dumpsys activity` output.
//!
//! Grounded on `ForegroundApp.cpp`'s `__preProcessing` state machine: the
//! grep-backup strategy is tried first; switching to `lru` or to the
//! indentation-based fast scan is permanent and, once it happens, the
//! probing function is never invoked again.

use crate::shell::ShellCommand;
use regex::Regex;
use std::sync::OnceLock;

/// How many cumulative successes of the alternate strategy are required
/// before the detector permanently switches away from grep-backup, or back
/// to it from the fast scan.
const SWITCH_THRESHOLD: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    GrepBackup,
    Scan,
    Lru,
}

pub struct ForegroundDetector {
    strategy: Strategy,
    switched: bool,
    lru_success_count: u32,
    scan_failure_count: u32,
    top_fullscreen_indent: Option<i8>,
    display_policy_indent: Option<i8>,
}

impl Default for ForegroundDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl ForegroundDetector {
    pub fn new() -> Self {
        Self {
            strategy: Strategy::GrepBackup,
            switched: false,
            lru_success_count: 0,
            scan_failure_count: 0,
            top_fullscreen_indent: None,
            display_policy_indent: None,
        }
    }

    /// Returns the package name, or empty string on "unknown" — a valid
    /// result, not an error.
    pub fn get_foreground_app(&mut self) -> String {
        if self.switched {
            return self.run_current_strategy();
        }
        self.pre_processing()
    }

    fn run_current_strategy(&self) -> String {
        match self.strategy {
            Strategy::GrepBackup => grep_backup(),
            Strategy::Scan => self.scan(),
            Strategy::Lru => lru(),
        }
    }

    /// Mirrors `__preProcessing`: probe grep-backup and lru in parallel
    /// (counting lru's cumulative wins), then probe the indentation-based
    /// scan, switching permanently the first time either alternate strategy
    /// proves itself.
    fn pre_processing(&mut self) -> String {
        let backup = grep_backup();

        if backup.is_empty() {
            let lru_result = lru();
            if !lru_result.is_empty() {
                self.lru_success_count += 1;
                if self.lru_success_count >= SWITCH_THRESHOLD {
                    log::info!("foreground detector: switching permanently to lru strategy");
                    self.strategy = Strategy::Lru;
                    self.switched = true;
                    return lru_result;
                }
            }
            return lru_result;
        }

        self.ensure_indentation_bootstrap();
        if self.indentation_valid() {
            let scan_result = self.scan();
            if !scan_result.is_empty() {
                log::info!("foreground detector: switching permanently to activities-scan strategy");
                self.strategy = Strategy::Scan;
                self.switched = true;
                return scan_result;
            }
            self.scan_failure_count += 1;
            if self.scan_failure_count >= SWITCH_THRESHOLD {
                log::info!("foreground detector: falling back permanently to grep-backup strategy");
                self.strategy = Strategy::GrepBackup;
                self.switched = true;
            }
        }

        backup
    }

    fn indentation_valid(&self) -> bool {
        self.top_fullscreen_indent.map(|v| v >= 0).unwrap_or(false)
            && self.display_policy_indent.map(|v| v >= 0).unwrap_or(false)
    }

    fn ensure_indentation_bootstrap(&mut self) {
        if self.top_fullscreen_indent.is_some() && self.display_policy_indent.is_some() {
            return;
        }
        self.top_fullscreen_indent = Some(measure_indent("mTopFullscreen"));
        self.display_policy_indent = Some(measure_indent("DisplayPolicy"));
    }

    fn scan(&self) -> String {
        let display_indent = self.display_policy_indent.unwrap_or(-1);
        let top_indent = self.top_fullscreen_indent.unwrap_or(-1);
        if display_indent < 0 || top_indent < 0 {
            return String::new();
        }
        let output = ShellCommand::new("dumpsys activity activities").run();
        if !output.status_success {
            return String::new();
        }
        scan_for_package(&output.stdout, display_indent as usize, top_indent as usize)
    }
}

fn measure_indent(marker: &str) -> i8 {
    let out = ShellCommand::new(format!(
        "dumpsys activity activities | grep -m1 '{marker}'"
    ))
    .run();
    if !out.status_success || out.stdout.is_empty() {
        return -1;
    }
    let leading = out.stdout.chars().take_while(|c| *c == ' ').count();
    leading.min(i8::MAX as usize) as i8
}

/// Finds the `DisplayPolicy` section at the measured indentation, then the
/// `mTopFullscreen` line within it, then extracts the package name.
fn scan_for_package(dump: &str, display_indent: usize, top_indent: usize) -> String {
    let mut in_display_policy = false;
    for line in dump.lines() {
        let indent = line.chars().take_while(|c| *c == ' ').count();
        let trimmed = line.trim_start();
        if trimmed.starts_with("DisplayPolicy") && indent == display_indent {
            in_display_policy = true;
            continue;
        }
        if in_display_policy && trimmed.starts_with("mTopFullscreen") && indent == top_indent {
            return extract_package(trimmed);
        }
    }
    String::new()
}

fn grep_backup() -> String {
    let out = ShellCommand::new("dumpsys activity activities | grep -m1 mTopFullscreen").run();
    if !out.status_success {
        return String::new();
    }
    extract_package(out.stdout.trim())
}

/// Extracts `<pkg>` from a line containing `<pkg>/<activity>` by finding the
/// `/` and scanning left to the preceding whitespace.
fn extract_package(line: &str) -> String {
    let Some(slash) = line.find('/') else {
        return String::new();
    };
    let before_slash = &line[..slash];
    let start = before_slash.rfind(char::is_whitespace).map(|i| i + 1).unwrap_or(0);
    before_slash[start..].to_string()
}

fn lru_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r":(\S+)/").unwrap())
}

/// Reads the third line of `dumpsys activity lru`; extracts the token
/// between `:` and `/`, verifying the immediately preceding substring is
/// `TOP` and not `BTOP`.
fn lru() -> String {
    let out = ShellCommand::new("dumpsys activity lru").run();
    if !out.status_success {
        return String::new();
    }
    let Some(third_line) = out.stdout.lines().nth(2) else {
        return String::new();
    };
    extract_lru_top_package(third_line)
}

/// Extracted from `lru()` so the TOP/BTOP marker check can be exercised
/// without spawning a real `dumpsys` subprocess. The captured package name
/// sits right after a `:`; the marker check scans the text before that
/// colon for a `TOP` occurrence not immediately preceded by `'B'` (so
/// `BTOP` rows, which mean "not actually on top", are rejected).
fn extract_lru_top_package(line: &str) -> String {
    let Some(caps) = lru_regex().captures(line) else {
        return String::new();
    };
    let Some(m) = caps.get(1) else {
        return String::new();
    };
    let colon_idx = m.start().saturating_sub(1);
    let before_colon = &line[..colon_idx];
    if has_top_marker(before_colon) {
        m.as_str().to_string()
    } else {
        String::new()
    }
}

/// True if `prefix` contains a `TOP` substring whose preceding character
/// (if any) isn't `'B'`.
fn has_top_marker(prefix: &str) -> bool {
    let bytes = prefix.as_bytes();
    let mut search_start = 0;
    while let Some(rel) = prefix[search_start..].find("TOP") {
        let pos = search_start + rel;
        if pos == 0 || bytes[pos - 1] != b'B' {
            return true;
        }
        search_start = pos + "TOP".len();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_package_finds_prefix_before_slash() {
        assert_eq!(extract_package("  u0 com.example.app/.MainActivity t123"), "com.example.app");
    }

    #[test]
    fn extract_package_empty_without_slash() {
        assert_eq!(extract_package("no slash here"), "");
    }

    #[test]
    fn scan_for_package_finds_nested_line() {
        let dump = "  DisplayPolicy\n    mTopFullscreen=com.foo.bar/.Act\n";
        assert_eq!(scan_for_package(dump, 2, 4), "com.foo.bar");
    }

    #[test]
    fn scan_for_package_ignores_outside_section() {
        let dump = "mTopFullscreen=com.should.not.match/.Act\n  DisplayPolicy\n";
        assert_eq!(scan_for_package(dump, 2, 0), "");
    }

    #[test]
    fn lru_extracts_package_when_marked_top() {
        let line = "  u0 TOP:com.example.app/.Act t5";
        assert_eq!(extract_lru_top_package(line), "com.example.app");
    }

    #[test]
    fn lru_extracts_package_when_top_marker_precedes_pid() {
        let line = "  u0 TOP 12345:com.example.app/.Act t5";
        assert_eq!(extract_lru_top_package(line), "com.example.app");
    }

    #[test]
    fn lru_rejects_btop() {
        let line = "  u0 BTOP:com.excluded.app/.Act t5";
        assert_eq!(extract_lru_top_package(line), "");
    }

    #[test]
    fn lru_rejects_missing_top_marker() {
        let line = "  u0 12345:com.background.app/.Act t5";
        assert_eq!(extract_lru_top_package(line), "");
    }

    #[test]
    fn new_detector_starts_unswitched_on_grep_backup() {
        let detector = ForegroundDetector::new();
        assert_eq!(detector.strategy, Strategy::GrepBackup);
        assert!(!detector.switched);
    }
}
