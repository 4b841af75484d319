//! External hook invocation.
//!
//! A hook is a shell command template invoked synchronously around slice
//! transitions (to upload a slice that has been superseded, or to fetch one
//! that is missing locally) and around named subtrees during a directory
//! walk (to bracket a path with a `start`/`end` pair, e.g. to snapshot a
//! database before copying its files). The template substitutes `%`-escapes
//! and is run through `/bin/sh -c`; its stdout is teed to the parent's
//! stderr so operators see hook chatter interleaved with normal diagnostics.

use std::io::Write as _;
use std::path::Path;
use std::process::{Command, Stdio};

use crate::error::{Error, Result};

/// Context under which a hook command is invoked, substituted as `%c`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookContext {
    /// A slice other than the last was closed; fetch/upload it now.
    Operation,
    /// The slice set is being opened for reading and no local slice exists.
    Init,
    /// The archive is being finished; upload the final slice.
    LastSlice,
    /// A named subtree is about to begin walking.
    Start,
    /// A named subtree has finished walking.
    End,
}

impl HookContext {
    fn as_str(self) -> &'static str {
        match self {
            HookContext::Operation => "operation",
            HookContext::Init => "init",
            HookContext::LastSlice => "last_slice",
            HookContext::Start => "start",
            HookContext::End => "end",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HookParams {
    pub parent: String,
    pub filename: String,
    pub base: String,
    pub part: String,
}

impl HookParams {
    pub fn for_path(base_name: &Path, path: &Path, part: u32) -> Self {
        Self {
            parent: path
                .parent()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            filename: path.display().to_string(),
            base: base_name.display().to_string(),
            part: part.to_string(),
        }
    }
}

/// A `%`-substituted shell command template.
#[derive(Debug, Clone)]
pub struct Hook {
    template: String,
}

impl Hook {
    pub fn new(template: impl Into<String>) -> Self {
        Self { template: template.into() }
    }

    /// Substitute `%p` parent dir, `%f` full filename, `%b` base name,
    /// `%n` part-number suffix, `%e` the `.part` separator, `%c` context,
    /// then run the resulting string through `/bin/sh -c`.
    pub fn run(&self, params: &HookParams, ctx: HookContext) -> Result<()> {
        let cmd = substitute(&self.template, params, ctx);
        let output = Command::new("/bin/sh")
            .arg("-c")
            .arg(&cmd)
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .output()
            .map_err(|e| Error::slice(format!("failed to spawn hook `{cmd}`: {e}")))?;

        let _ = std::io::stderr().write_all(&output.stdout);

        if !output.status.success() {
            return Err(Error::slice(format!(
                "hook `{cmd}` exited with status {:?}",
                output.status.code()
            )));
        }
        Ok(())
    }
}

fn substitute(template: &str, p: &HookParams, ctx: HookContext) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('p') => out.push_str(&p.parent),
            Some('f') => out.push_str(&p.filename),
            Some('b') => out.push_str(&p.base),
            Some('n') => out.push_str(&p.part),
            Some('e') => out.push_str(".part"),
            Some('c') => out.push_str(ctx.as_str()),
            Some('%') => out.push('%'),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_all_escapes() {
        let p = HookParams {
            parent: "/tmp".into(),
            filename: "/tmp/out.part2".into(),
            base: "/tmp/out".into(),
            part: "2".into(),
        };
        let s = substitute("echo %p %f %b %n%e %c", &p, HookContext::Operation);
        assert_eq!(s, "echo /tmp /tmp/out.part2 /tmp/out 2.part operation");
    }

    #[test]
    fn hook_runs_and_reports_failure() {
        let hook = Hook::new("exit 1".to_string());
        let err = hook
            .run(&HookParams::default(), HookContext::Init)
            .unwrap_err();
        assert!(matches!(err, Error::Slice(_)));
    }
}
