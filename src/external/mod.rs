//! External executables (drizzle, blot, SExtractor, shift finders) run
//! through the [`ToolRunner`] seam.

pub mod drizzle;
pub mod sextractor;

use anyhow::{bail, Context, Result};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::Config;

/// One call of an external program.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub program: String,
    pub args: Vec<String>,
    /// Working directory of the child process
    pub cwd: PathBuf,
}

impl ToolInvocation {
    pub fn new(program: impl Into<String>, args: Vec<String>, cwd: &Path) -> Self {
        Self {
            program: program.into(),
            args,
            cwd: cwd.to_path_buf(),
        }
    }

    /// Value of a `key=value` argument.
    pub fn arg_value(&self, key: &str) -> Option<&str> {
        self.args.iter().find_map(|a| {
            a.split_once('=')
                .filter(|(k, _)| *k == key)
                .map(|(_, v)| v)
        })
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

pub trait ToolRunner {
    fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput>;
}

/// Runs tools as child processes, killing them after `timeout`.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    timeout: Duration,
}

impl ProcessRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = String::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_string(&mut buf);
        }
        buf
    })
}

impl ToolRunner for ProcessRunner {
    fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput> {
        tracing::info!("🔧 {}", invocation.command_line());
        let start = Instant::now();

        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .current_dir(&invocation.cwd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to start {}", invocation.program))?;

        // Pipes are drained on their own threads while we poll
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = loop {
            if let Some(status) = child
                .try_wait()
                .with_context(|| format!("Failed to wait for {}", invocation.program))?
            {
                break status;
            }
            if start.elapsed() > self.timeout {
                let _ = child.kill();
                let _ = child.wait();
                bail!(
                    "{} timed out after {}",
                    invocation.program,
                    humantime::format_duration(self.timeout)
                );
            }
            std::thread::sleep(Duration::from_millis(100));
        };

        let output = ToolOutput {
            stdout: stdout.join().unwrap_or_default(),
            stderr: stderr.join().unwrap_or_default(),
        };
        for line in output.stdout.lines() {
            tracing::debug!("   {}", line);
        }
        for line in output.stderr.lines() {
            tracing::debug!("   [stderr] {}", line);
        }

        if !status.success() {
            bail!(
                "{} exited with {}: {}",
                invocation.program,
                status,
                output.stderr.lines().last().unwrap_or("")
            );
        }
        tracing::debug!(
            "✅ {} finished in {:.1}s",
            invocation.program,
            start.elapsed().as_secs_f64()
        );
        Ok(output)
    }
}

type Hook = Box<dyn Fn(&ToolInvocation) -> Result<()> + Send + Sync>;

/// Records invocations instead of running them. An optional hook can
/// produce the files a real tool would write.
#[derive(Default)]
pub struct RecordingRunner {
    calls: Mutex<Vec<ToolInvocation>>,
    hook: Option<Hook>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hook<F>(hook: F) -> Self
    where
        F: Fn(&ToolInvocation) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            calls: Mutex::new(Vec::new()),
            hook: Some(Box::new(hook)),
        }
    }

    pub fn calls(&self) -> Vec<ToolInvocation> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Programs called, in order.
    pub fn programs(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.program).collect()
    }
}

impl ToolRunner for RecordingRunner {
    fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput> {
        tracing::debug!("(recorded) {}", invocation.command_line());
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(invocation.clone());
        }
        if let Some(hook) = &self.hook {
            hook(invocation)?;
        }
        Ok(ToolOutput::default())
    }
}

/// Working directory, configuration and tool runner shared by every stage.
pub struct Workspace<'a> {
    pub dir: PathBuf,
    pub config: &'a Config,
    pub runner: &'a dyn ToolRunner,
}

impl<'a> Workspace<'a> {
    pub fn new(dir: impl Into<PathBuf>, config: &'a Config, runner: &'a dyn ToolRunner) -> Self {
        Self {
            dir: dir.into(),
            config,
            runner,
        }
    }

    /// A file in the working directory.
    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Same configuration and runner, another directory.
    pub fn at(&self, dir: impl Into<PathBuf>) -> Workspace<'a> {
        Workspace {
            dir: dir.into(),
            config: self.config,
            runner: self.runner,
        }
    }

    /// Run `program` in the working directory.
    pub fn run_tool(&self, program: &str, args: Vec<String>) -> Result<ToolOutput> {
        let invocation = ToolInvocation::new(program, args, &self.dir);
        self.runner.run(&invocation)
    }
}

/// Render a boolean the way IRAF-style tasks expect.
pub fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}
