//! Embedding extraction by an external command.
//!
//! The command gets the raw image on stdin and prints a JSON array of
//! detected faces on stdout:
//!
//! ```text
//! [{"region": {"top": 10, "right": 90, "bottom": 100, "left": 20},
//!   "embedding": [0.013, -0.092, ...]}]
//! ```

use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};

use roll_core::{CoreError, DetectedFace, EmbeddingExtractor, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct CommandExtractor {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandExtractor {
    /// `argv[0]` is the program. An empty `argv` is allowed so commands that
    /// never extract still work; extraction then fails with a hint.
    pub fn new(argv: Vec<String>, timeout: Duration) -> Self {
        Self { argv, timeout }
    }

    fn timed_out(&self, child: &mut Child) -> CoreError {
        kill_tree(child);
        tracing::warn!(timeout = ?self.timeout, "extractor killed after deadline");
        CoreError::ExtractionTimeout(self.timeout)
    }

    fn wait_until(&self, child: &mut Child, deadline: Instant) -> Result<ExitStatus> {
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) if Instant::now() >= deadline => return Err(self.timed_out(child)),
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(e) => {
                    kill_tree(child);
                    return Err(CoreError::Extraction(format!("waiting for extractor: {e}")));
                }
            }
        }
    }

    /// Waits for a pipe reader until `deadline`. A descendant that inherited
    /// the pipe can keep it open after the child itself has exited.
    fn collect<T>(&self, child: &mut Child, rx: &Receiver<T>, deadline: Instant) -> Result<T> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        rx.recv_timeout(remaining).map_err(|e| match e {
            mpsc::RecvTimeoutError::Timeout => self.timed_out(child),
            mpsc::RecvTimeoutError::Disconnected => {
                kill_tree(child);
                CoreError::Extraction("extractor pipe reader panicked".into())
            }
        })
    }
}

/// Kills the child and every process in its group.
fn kill_tree(child: &mut Child) {
    kill_group(child.id());
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(unix)]
fn kill_group(pgid: u32) {
    if let Ok(pgid) = libc::pid_t::try_from(pgid) {
        // The group id is the child's pid, which stays reserved while any
        // member of the group is alive.
        unsafe {
            libc::kill(-pgid, libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) {}

fn spawn_reader<R, T, F>(mut pipe: R, read: F) -> Receiver<T>
where
    R: Read + Send + 'static,
    T: Send + 'static,
    F: FnOnce(&mut R) -> T + Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel(1);
    thread::spawn(move || {
        let _ = tx.send(read(&mut pipe));
    });
    rx
}

impl EmbeddingExtractor for CommandExtractor {
    fn extract(&self, image: &[u8]) -> Result<Vec<DetectedFace>> {
        let Some((program, args)) = self.argv.split_first() else {
            return Err(CoreError::Extraction(
                "no extractor configured, set [extractor].command in roll.toml".into(),
            ));
        };

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Own process group, so a timeout also reaches helpers it forks.
            command.process_group(0);
        }
        let deadline = Instant::now() + self.timeout;
        let mut child = command
            .spawn()
            .map_err(|e| CoreError::Extraction(format!("failed to start {program}: {e}")))?;
        tracing::debug!(program, bytes = image.len(), "running extractor");

        // Each pipe gets its own thread; a full pipe would stall the child.
        let (Some(mut stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            kill_tree(&mut child);
            return Err(CoreError::Extraction("extractor pipes unavailable".into()));
        };
        let input = image.to_vec();
        thread::spawn(move || {
            // A child that exits without reading all input is judged by its
            // exit status, not by the broken pipe.
            let _ = stdin.write_all(&input);
        });
        let stdout_rx = spawn_reader(stdout, |pipe| {
            let mut buf = Vec::new();
            pipe.read_to_end(&mut buf).map(|_| buf)
        });
        let stderr_rx = spawn_reader(stderr, |pipe| {
            let mut buf = String::new();
            let _ = pipe.read_to_string(&mut buf);
            buf
        });

        let status = self.wait_until(&mut child, deadline)?;
        let output = self
            .collect(&mut child, &stdout_rx, deadline)?
            .map_err(|e| CoreError::Extraction(format!("reading extractor output: {e}")))?;
        let diagnostics = self.collect(&mut child, &stderr_rx, deadline)?;

        if !status.success() {
            return Err(CoreError::Extraction(format!(
                "{program} exited with {status}: {}",
                diagnostics.trim()
            )));
        }
        parse_faces(&output)
    }
}

/// Parses the extractor's stdout.
pub fn parse_faces(output: &[u8]) -> Result<Vec<DetectedFace>> {
    serde_json::from_slice(output)
        .map_err(|e| CoreError::Extraction(format!("extractor output is not a face list: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_faces() {
        let faces = parse_faces(
            br#"[{"region":{"top":1,"right":2,"bottom":3,"left":4},"embedding":[0.5,-0.5]}]"#,
        )
        .unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].region.left, 4);
        assert_eq!(faces[0].embedding, vec![0.5, -0.5]);

        assert!(parse_faces(b"[]").unwrap().is_empty());
        assert!(matches!(parse_faces(b""), Err(CoreError::Extraction(_))));
        assert!(matches!(
            parse_faces(b"{\"faces\":[]}"),
            Err(CoreError::Extraction(_))
        ));
    }

    #[test]
    fn test_empty_command_is_extraction_error() {
        let extractor = CommandExtractor::new(Vec::new(), Duration::from_secs(1));
        let err = extractor.extract(b"img").unwrap_err();
        assert!(matches!(err, CoreError::Extraction(ref m) if m.contains("roll.toml")));
    }

    #[test]
    fn test_missing_program_is_extraction_error() {
        let extractor = CommandExtractor::new(
            argv(&["roll-extractor-that-does-not-exist"]),
            Duration::from_secs(1),
        );
        assert!(matches!(
            extractor.extract(b"img"),
            Err(CoreError::Extraction(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_cat_echoes_faces() {
        let extractor = CommandExtractor::new(argv(&["cat"]), Duration::from_secs(5));
        let faces = extractor
            .extract(br#"[{"region":{"top":0,"right":0,"bottom":0,"left":0},"embedding":[1.0]}]"#)
            .unwrap();
        assert_eq!(faces[0].embedding, vec![1.0]);
    }

    #[cfg(unix)]
    #[test]
    fn test_non_zero_exit_reports_stderr() {
        let extractor = CommandExtractor::new(
            argv(&["sh", "-c", "echo model missing >&2; exit 3"]),
            Duration::from_secs(5),
        );
        let err = extractor.extract(b"img").unwrap_err();
        assert!(matches!(err, CoreError::Extraction(ref m) if m.contains("model missing")));
    }

    #[cfg(unix)]
    #[test]
    fn test_slow_command_is_killed() {
        let extractor = CommandExtractor::new(
            argv(&["sh", "-c", "sleep 10"]),
            Duration::from_millis(100),
        );
        let started = Instant::now();
        let err = extractor.extract(b"img").unwrap_err();
        assert!(matches!(err, CoreError::ExtractionTimeout(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[test]
    fn test_background_helper_holding_stdout_hits_deadline() {
        let extractor = CommandExtractor::new(
            argv(&["sh", "-c", "sleep 4 & echo []"]),
            Duration::from_millis(200),
        );
        let started = Instant::now();
        let err = extractor.extract(b"img").unwrap_err();
        assert!(matches!(err, CoreError::ExtractionTimeout(_)), "got {err:?}");
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
