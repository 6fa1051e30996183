//! External converter (slicer) resolution and invocation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ConverterError;

/// Fixed mapping from converter name to executable path.
///
/// Relative paths are resolved against the worker's installation directory
/// when the registry is built, never against the current working directory.
#[derive(Debug, Clone, Default)]
pub struct ConverterRegistry {
    converters: BTreeMap<String, PathBuf>,
}

impl ConverterRegistry {
    pub fn new<I, N, P>(install_dir: &Path, entries: I) -> Self
    where
        I: IntoIterator<Item = (N, P)>,
        N: Into<String>,
        P: AsRef<Path>,
    {
        let converters = entries
            .into_iter()
            .map(|(name, path)| (name.into(), install_dir.join(path)))
            .collect();
        Self { converters }
    }

    /// Looks up the executable for `name`.
    pub fn resolve(&self, name: &str) -> Result<&Path, ConverterError> {
        self.converters
            .get(name)
            .map(PathBuf::as_path)
            .ok_or_else(|| ConverterError::NotRegistered(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.converters.keys().map(String::as_str)
    }
}

/// Runs a resolved converter as a child process under a watchdog timeout.
#[derive(Debug, Clone)]
pub struct ConverterInvoker {
    registry: ConverterRegistry,
    timeout: Duration,
}

impl ConverterInvoker {
    pub fn new(registry: ConverterRegistry, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    pub fn resolve(&self, name: &str) -> Result<&Path, ConverterError> {
        self.registry.resolve(name)
    }

    /// Converts `input` into `output` by running `<executable> <input> -o <output>`.
    ///
    /// The converter's stdout and stderr are forwarded to the log line by line.
    /// Returns `output` only if the process exits successfully and a regular
    /// file exists there afterward.
    ///
    /// # Errors
    ///
    /// - Spawn failures (missing executable, permissions)
    /// - Non-zero exit status
    /// - Watchdog timeout (the child is killed)
    /// - Missing output file after a zero exit
    pub async fn run(
        &self,
        executable: &Path,
        input: &Path,
        output: &Path,
    ) -> Result<PathBuf, ConverterError> {
        // A leftover artifact from an earlier delivery must not pass for this run's output.
        match tokio::fs::remove_file(output).await {
            Ok(()) => warn!("Removed stale output {}", output.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ConverterError::Io(e)),
        }

        info!(
            "Running converter: executable={}, input={}, output={}",
            executable.display(),
            input.display(),
            output.display()
        );

        let mut child = Command::new(executable)
            .arg(input)
            .arg("-o")
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ConverterError::Spawn {
                path: executable.to_path_buf(),
                source,
            })?;

        let mut forwarders: Vec<JoinHandle<()>> = [
            child.stdout.take().map(|out| tokio::spawn(forward_lines(out, false))),
            child.stderr.take().map(|err| tokio::spawn(forward_lines(err, true))),
        ]
        .into_iter()
        .flatten()
        .collect();

        // The watchdog also covers draining the pipes, which a background
        // process started by the converter may keep open after it exits.
        let deadline = tokio::time::Instant::now() + self.timeout;
        let finished = tokio::time::timeout_at(deadline, async {
            let status = child.wait().await?;
            for forwarder in forwarders.iter_mut() {
                let _ = forwarder.await;
            }
            Ok::<_, std::io::Error>(status)
        })
        .await;

        let status = match finished {
            Ok(status) => status?,
            Err(_) => {
                warn!(
                    "Converter timed out after {:?}, killing process",
                    self.timeout
                );
                let _ = child.kill().await;
                for forwarder in &forwarders {
                    forwarder.abort();
                }
                return Err(ConverterError::Timeout(self.timeout));
            }
        };

        if !status.success() {
            return Err(ConverterError::Exited {
                code: status.code(),
            });
        }

        match tokio::fs::metadata(output).await {
            Ok(meta) if meta.is_file() => {
                info!("Converter finished: output={} ({} bytes)", output.display(), meta.len());
                Ok(output.to_path_buf())
            }
            _ => Err(ConverterError::MissingOutput(output.to_path_buf())),
        }
    }
}

/// Logs each output line. Bytes that are not UTF-8 are replaced rather than
/// ending the read, so the converter never writes into a closed pipe.
async fn forward_lines<R>(reader: R, is_stderr: bool)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(target: "converter", "Stopped reading converter output: {}", e);
                break;
            }
        }

        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end_matches(&['\r', '\n'][..]);
        if is_stderr {
            warn!(target: "converter", "{}", line);
        } else {
            info!(target: "converter", "{}", line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[cfg(unix)]
    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_resolve_relative_to_install_dir() {
        let registry = ConverterRegistry::new(
            Path::new("/opt/slicer-worker"),
            [("acme", "bin/acme"), ("abs", "/usr/bin/abs-slicer")],
        );

        assert_eq!(
            registry.resolve("acme").unwrap(),
            Path::new("/opt/slicer-worker/bin/acme")
        );
        assert_eq!(registry.resolve("abs").unwrap(), Path::new("/usr/bin/abs-slicer"));
        assert!(matches!(
            registry.resolve("other"),
            Err(ConverterError::NotRegistered(name)) if name == "other"
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_success() {
        let dir = TempDir::new().unwrap();
        let exe = write_script(dir.path(), "copy", r#"echo "slicing $1"; cp "$1" "$3""#);
        let input = dir.path().join("part.stl");
        let output = dir.path().join("1.gcode");
        std::fs::write(&input, b"solid part").unwrap();

        let invoker = ConverterInvoker::new(ConverterRegistry::default(), Duration::from_secs(10));
        let produced = invoker.run(&exe, &input, &output).await.unwrap();

        assert_eq!(produced, output);
        assert_eq!(std::fs::read(&output).unwrap(), b"solid part");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_zero_exit() {
        let dir = TempDir::new().unwrap();
        let exe = write_script(dir.path(), "fail", r#"cp "$1" "$3"; exit 3"#);
        let input = dir.path().join("part.stl");
        std::fs::write(&input, b"solid").unwrap();

        let invoker = ConverterInvoker::new(ConverterRegistry::default(), Duration::from_secs(10));
        let result = invoker.run(&exe, &input, &dir.path().join("1.gcode")).await;

        assert!(matches!(result, Err(ConverterError::Exited { code: Some(3) })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_output() {
        let dir = TempDir::new().unwrap();
        let exe = write_script(dir.path(), "noop", "exit 0");
        let input = dir.path().join("part.stl");
        let output = dir.path().join("1.gcode");
        std::fs::write(&input, b"solid").unwrap();
        // Stale artifact from an earlier attempt must not count.
        std::fs::write(&output, b"old").unwrap();

        let invoker = ConverterInvoker::new(ConverterRegistry::default(), Duration::from_secs(10));
        let result = invoker.run(&exe, &input, &output).await;

        assert!(matches!(result, Err(ConverterError::MissingOutput(_))));
        assert!(!output.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_watchdog_kills_slow_converter() {
        let dir = TempDir::new().unwrap();
        let exe = write_script(dir.path(), "slow", "exec sleep 30");
        let input = dir.path().join("part.stl");
        std::fs::write(&input, b"solid").unwrap();

        let invoker =
            ConverterInvoker::new(ConverterRegistry::default(), Duration::from_millis(200));
        let started = std::time::Instant::now();
        let result = invoker.run(&exe, &input, &dir.path().join("1.gcode")).await;

        assert!(matches!(result, Err(ConverterError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_utf8_output_does_not_fail_conversion() {
        let dir = TempDir::new().unwrap();
        let exe = write_script(
            dir.path(),
            "noisy",
            r#"printf 'temp 200\260C\n'
i=0
while [ $i -lt 5000 ]; do echo "layer $i"; i=$((i+1)); done
cp "$1" "$3""#,
        );
        let input = dir.path().join("part.stl");
        let output = dir.path().join("1.gcode");
        std::fs::write(&input, b"solid part").unwrap();

        let invoker = ConverterInvoker::new(ConverterRegistry::default(), Duration::from_secs(10));
        let produced = invoker.run(&exe, &input, &output).await.unwrap();

        assert_eq!(std::fs::read(produced).unwrap(), b"solid part");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_watchdog_covers_background_process_holding_pipes() {
        let dir = TempDir::new().unwrap();
        let exe = write_script(dir.path(), "detach", r#"sleep 5 & cp "$1" "$3"; exit 0"#);
        let input = dir.path().join("part.stl");
        std::fs::write(&input, b"solid").unwrap();

        let invoker =
            ConverterInvoker::new(ConverterRegistry::default(), Duration::from_millis(300));
        let started = std::time::Instant::now();
        let result = invoker.run(&exe, &input, &dir.path().join("1.gcode")).await;

        assert!(matches!(result, Err(ConverterError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(3), "blocked {:?}", started.elapsed());
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let dir = TempDir::new().unwrap();
        let invoker = ConverterInvoker::new(ConverterRegistry::default(), Duration::from_secs(1));

        let result = invoker
            .run(
                &dir.path().join("does-not-exist"),
                &dir.path().join("in.stl"),
                &dir.path().join("out.gcode"),
            )
            .await;

        assert!(matches!(result, Err(ConverterError::Spawn { .. })));
    }
}
