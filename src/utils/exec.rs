use anyhow::Result;
use std::ffi::OsStr;
use std::process::Stdio;
use tokio::process::Command;

pub struct Captured {
    pub code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl Captured {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Last `n` lines of stderr, for error messages.
    pub fn stderr_tail(&self, n: usize) -> String {
        let text = String::from_utf8_lossy(&self.stderr);
        let lines: Vec<&str> = text.lines().collect();
        lines[lines.len().saturating_sub(n)..].join("\n")
    }
}

pub async fn exec_capture<I, S>(cmd: impl AsRef<OsStr>, args: I) -> Result<Captured>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut c = Command::new(cmd);
    c.args(args);
    c.stdin(Stdio::null());
    c.stdout(Stdio::piped());
    c.stderr(Stdio::piped());
    c.kill_on_drop(true);
    let output = c.spawn()?.wait_with_output().await?;
    let code = output.status.code().unwrap_or(-1);
    Ok(Captured { code, stdout: output.stdout, stderr: output.stderr })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stderr_tail_keeps_last_lines() {
        let c = Captured { code: 1, stdout: vec![], stderr: b"a\nb\nc\n".to_vec() };
        assert_eq!(c.stderr_tail(2), "b\nc");
        assert_eq!(c.stderr_tail(10), "a\nb\nc");
        assert!(!c.success());
    }
}
