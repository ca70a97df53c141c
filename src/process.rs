use std::process::Output;

use anyhow::{bail, Context as _};
use tokio::process::Command;

pub trait OutputExt {
    // Exit code of the process, as long as it wasn't killed by a signal.
    fn code_not_killed(&self) -> anyhow::Result<i32>;
    // Error unless the process exited zero, with stderr/stdout in the message.
    fn ok(&self) -> anyhow::Result<()>;
    fn stdout_string(&self) -> anyhow::Result<String>;
}

impl OutputExt for Output {
    fn code_not_killed(&self) -> anyhow::Result<i32> {
        self.status
            .code()
            .context("process terminated by signal")
    }

    fn ok(&self) -> anyhow::Result<()> {
        let code = self.code_not_killed()?;
        if code != 0 {
            bail!(
                "failed with exit code {}. stderr:\n{}\nstdout:\n{}",
                code,
                String::from_utf8_lossy(&self.stderr),
                String::from_utf8_lossy(&self.stdout)
            );
        }
        Ok(())
    }

    fn stdout_string(&self) -> anyhow::Result<String> {
        Ok(String::from_utf8(self.stdout.clone()).context("non utf-8 process output")?)
    }
}

pub trait CommandExt {
    // Run the command to completion, failing if it exits nonzero.
    async fn execute(&mut self) -> anyhow::Result<Output>;
}

impl CommandExt for Command {
    async fn execute(&mut self) -> anyhow::Result<Output> {
        let description = format!("{:?}", self.as_std());
        let output = self
            .output()
            .await
            .with_context(|| format!("spawning {description}"))?;
        output
            .ok()
            .with_context(|| format!("running {description}"))?;
        Ok(output)
    }
}
