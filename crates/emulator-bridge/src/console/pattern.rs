//! Pattern watches evaluated against console output

use regex::Regex;

/// What a watch is matched against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchScope {
    /// Each line on its own
    Line,
    /// Everything received so far, lines joined with `\n`
    Accumulated,
}

/// A named regular expression registered before a session starts
#[derive(Debug, Clone)]
pub struct PatternWatch {
    name: &'static str,
    regex: Regex,
    scope: WatchScope,
}

/// Name of the file-based auth challenge watch
pub const AUTH_CHALLENGE: &str = "auth-challenge";

/// Name of the acknowledgment watch
pub const ACKNOWLEDGMENT: &str = "ack";

impl PatternWatch {
    pub fn new(name: &'static str, regex: Regex, scope: WatchScope) -> Self {
        Self { name, regex, scope }
    }

    /// `... <auth_token> in ... '<path>'`, possibly split across lines.
    /// Group 1 is the token file path.
    pub fn auth_challenge() -> Self {
        Self::new(
            AUTH_CHALLENGE,
            Regex::new(r"(?s)<auth_token> in.*?'([^']+)'").expect("static regex"),
            WatchScope::Accumulated,
        )
    }

    /// A line carrying the literal `OK`
    pub fn acknowledgment() -> Self {
        Self::new(
            ACKNOWLEDGMENT,
            Regex::new("OK").expect("static regex"),
            WatchScope::Line,
        )
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn scope(&self) -> WatchScope {
        self.scope
    }

    fn evaluate(&self, line: &str, accumulated: &str) -> Option<PatternMatch> {
        let haystack = match self.scope {
            WatchScope::Line => line,
            WatchScope::Accumulated => accumulated,
        };
        self.regex.captures(haystack).map(|caps| PatternMatch {
            watch: self.name,
            groups: caps
                .iter()
                .skip(1)
                .map(|g| g.map(|m| m.as_str().to_string()))
                .collect(),
        })
    }
}

/// A watch that fired, with its capture groups
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternMatch {
    pub watch: &'static str,
    groups: Vec<Option<String>>,
}

impl PatternMatch {
    /// Capture group `index`, 1-based like regex groups
    pub fn group(&self, index: usize) -> Option<&str> {
        index
            .checked_sub(1)
            .and_then(|i| self.groups.get(i))
            .and_then(|g| g.as_deref())
    }
}

/// The watches of one session. Each watch fires at most once.
#[derive(Debug, Clone)]
pub struct PatternSet {
    watches: Vec<(PatternWatch, bool)>,
    accumulated: String,
}

impl PatternSet {
    pub fn new(watches: Vec<PatternWatch>) -> Self {
        Self {
            watches: watches.into_iter().map(|w| (w, false)).collect(),
            accumulated: String::new(),
        }
    }

    /// The two watches active while waiting for the banner
    pub fn banner() -> Self {
        Self::new(vec![PatternWatch::auth_challenge(), PatternWatch::acknowledgment()])
    }

    /// Feed one received line, returning the watches it fired
    pub fn ingest(&mut self, line: &str) -> Vec<PatternMatch> {
        if !self.accumulated.is_empty() {
            self.accumulated.push('\n');
        }
        self.accumulated.push_str(line);

        let mut fired = Vec::new();
        for (watch, done) in self.watches.iter_mut() {
            if *done {
                continue;
            }
            if let Some(m) = watch.evaluate(line, &self.accumulated) {
                *done = true;
                fired.push(m);
            }
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_challenge_across_lines() {
        let mut set = PatternSet::banner();
        assert!(set.ingest("Android Console: you can find your <auth_token> in ").is_empty());

        let fired = set.ingest("'/tmp/token'");
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].watch, AUTH_CHALLENGE);
        assert_eq!(fired[0].group(1), Some("/tmp/token"));
    }

    #[test]
    fn test_auth_directive_hint_is_not_a_challenge() {
        let mut set = PatternSet::banner();
        assert!(set.ingest("Android Console: type 'auth <auth_token>' to authenticate").is_empty());
        let fired = set.ingest("Android Console: you can find your <auth_token> in '/home/u/.emulator_console_auth_token'");
        assert_eq!(fired[0].group(1), Some("/home/u/.emulator_console_auth_token"));
    }

    #[test]
    fn test_ack_is_line_scoped_and_fires_once() {
        let mut set = PatternSet::new(vec![PatternWatch::acknowledgment()]);
        assert!(set.ingest("Android Console: type 'help' for a list of commands").is_empty());
        assert_eq!(set.ingest("OK")[0].watch, ACKNOWLEDGMENT);
        assert!(set.ingest("OK").is_empty());
    }

    #[test]
    fn test_group_out_of_range() {
        let mut set = PatternSet::new(vec![PatternWatch::acknowledgment()]);
        let m = set.ingest("OK").remove(0);
        assert_eq!(m.group(0), None);
        assert_eq!(m.group(1), None);
    }
}
