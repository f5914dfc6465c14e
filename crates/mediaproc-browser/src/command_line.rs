//! Ordered `--switch[=value]` command lines for launching the media process.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

const SWITCH_PREFIX: &str = "--";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandLine {
    program: PathBuf,
    switches: Vec<(String, Option<String>)>,
    args: Vec<String>,
    wrapper: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Parse `argv`, first element being the program. Anything after a bare
    /// `--` is a positional argument.
    pub fn from_args<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let mut argv = argv.into_iter().map(|a| a.into().to_string_lossy().into_owned());
        let mut line = Self::new(argv.next().unwrap_or_default());
        let mut switches_done = false;
        for arg in argv {
            if switches_done {
                line.args.push(arg);
                continue;
            }
            if arg == SWITCH_PREFIX {
                switches_done = true;
                continue;
            }
            match arg.strip_prefix(SWITCH_PREFIX) {
                Some(switch) => match switch.split_once('=') {
                    Some((name, value)) => line.append_switch_value(name, value),
                    None => line.append_switch(switch),
                },
                None => line.args.push(arg),
            }
        }
        line
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn has_switch(&self, name: &str) -> bool {
        self.switches.iter().any(|(n, _)| n == name)
    }

    /// Value of `--name=value`. A switch given without a value yields `""`.
    pub fn switch_value(&self, name: &str) -> Option<&str> {
        self.switches
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_deref().unwrap_or(""))
    }

    pub fn append_switch(&mut self, name: &str) {
        self.set(name, None);
    }

    pub fn append_switch_value(&mut self, name: &str, value: impl Into<String>) {
        self.set(name, Some(value.into()));
    }

    pub fn append_arg(&mut self, arg: impl Into<String>) {
        self.args.push(arg.into());
    }

    /// Copy each of `names` that `other` carries, value included.
    pub fn copy_switches_from(&mut self, other: &CommandLine, names: &[&str]) {
        for name in names {
            if let Some((_, value)) = other.switches.iter().find(|(n, _)| n == name) {
                self.set(name, value.clone());
            }
        }
    }

    /// Run the command under `launcher` (e.g. `"gdb --args"`).
    pub fn prepend_wrapper(&mut self, launcher: &str) {
        let mut wrapper: Vec<String> = launcher.split_whitespace().map(str::to_string).collect();
        wrapper.append(&mut self.wrapper);
        self.wrapper = wrapper;
    }

    pub fn argv(&self) -> Vec<String> {
        let mut argv = self.wrapper.clone();
        argv.push(self.program.to_string_lossy().into_owned());
        for (name, value) in &self.switches {
            match value {
                Some(value) => argv.push(format!("{SWITCH_PREFIX}{name}={value}")),
                None => argv.push(format!("{SWITCH_PREFIX}{name}")),
            }
        }
        argv.extend(self.args.iter().cloned());
        argv
    }

    fn set(&mut self, name: &str, value: Option<String>) {
        match self.switches.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = value,
            None => self.switches.push((name.to_string(), value)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_switches_and_args() {
        let line = CommandLine::from_args(["shell", "--in-process-media", "--v=2", "clip.mp4", "--", "--not-a-switch"]);
        assert_eq!(line.program(), Path::new("shell"));
        assert!(line.has_switch("in-process-media"));
        assert_eq!(line.switch_value("in-process-media"), Some(""));
        assert_eq!(line.switch_value("v"), Some("2"));
        assert_eq!(line.switch_value("vmodule"), None);
        assert_eq!(
            line.argv(),
            vec!["shell", "--in-process-media", "--v=2", "clip.mp4", "--not-a-switch"]
        );
    }

    #[test]
    fn copies_only_named_switches() {
        let browser = CommandLine::from_args(["browser", "--no-sandbox", "--v=1", "--user-data-dir=/tmp/x"]);
        let mut media = CommandLine::new("media");
        media.append_switch_value("process-type", "media");
        media.copy_switches_from(&browser, &["v", "no-sandbox", "enable-logging"]);
        assert_eq!(media.argv(), vec!["media", "--process-type=media", "--v=1", "--no-sandbox"]);
    }

    #[test]
    fn setting_a_switch_twice_keeps_one_entry() {
        let mut line = CommandLine::new("media");
        line.append_switch_value("v", "1");
        line.append_switch_value("v", "3");
        assert_eq!(line.argv(), vec!["media", "--v=3"]);
    }

    #[test]
    fn wrapper_goes_first() {
        let mut line = CommandLine::new("/opt/media");
        line.append_switch("no-sandbox");
        line.prepend_wrapper("xterm -e gdb --args");
        assert_eq!(
            line.argv(),
            vec!["xterm", "-e", "gdb", "--args", "/opt/media", "--no-sandbox"]
        );
    }
}
