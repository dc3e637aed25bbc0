use std::{io::{self, BufRead, BufReader, Write}, process::{Child, Command, Stdio}, sync::mpsc::{self, Receiver, RecvTimeoutError, Sender}, thread, time::{Duration, Instant}};

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{corpus::TestPosition, params::TuningParameter};

/// Positions per `eval` command; bounds the size of a single protocol line.
pub const CHUNK_SIZE: usize = 100;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct EngineCommand {
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Longest wait for an expected reply line.
    pub reply: Duration,
    /// How long a process gets to exit after `quit` before it is killed.
    pub shutdown_grace: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts { reply: Duration::from_secs(60), shutdown_grace: Duration::from_secs(2) }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to start engine '{cmd}': {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: io::Error,
    },
    #[error("engine {worker} sent no line containing '{token}' within {timeout:?}")]
    Timeout { worker: usize, token: &'static str, timeout: Duration },
    #[error("engine {worker} closed its output while we waited for '{token}'")]
    Closed { worker: usize, token: &'static str },
    #[error("engine {worker} I/O error: {source}")]
    Io {
        worker: usize,
        #[source]
        source: io::Error,
    },
    #[error("engine {worker} returned {got} scores for {expected} positions")]
    ScoreCount { worker: usize, expected: usize, got: usize },
    #[error("engine {worker} returned malformed score '{token}'")]
    InvalidScore { worker: usize, token: String },
    #[error("engine {worker} did not exit within {grace:?} and was killed")]
    ShutdownTimeout { worker: usize, grace: Duration },
}

impl EngineError {
    /// Fatal errors leave the session in an unknown protocol state.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, EngineError::InvalidScore { .. })
    }
}

/// One external engine process and the line protocol spoken with it.
pub struct EngineSession {
    worker: usize,
    child: Option<Child>,
    input: Option<Box<dyn Write + Send>>,
    lines: Receiver<io::Result<String>>,
    timeouts: Timeouts,
    stopped: bool,
}

impl EngineSession {
    pub fn spawn(worker: usize, command: &EngineCommand, timeouts: Timeouts) -> Result<Self, EngineError> {
        let mut child = Command::new(&command.cmd)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| EngineError::Spawn { cmd: command.cmd.clone(), source })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(EngineError::Io { worker, source: io::Error::other("engine pipes were not captured") });
        };

        debug!(worker, cmd = %command.cmd, pid = child.id(), "Started engine instance");
        let mut session = Self::from_streams(worker, stdin, BufReader::new(stdout), timeouts);
        session.child = Some(child);
        Ok(session)
    }

    /// Builds a session over arbitrary streams instead of a child process.
    pub fn from_streams<W, R>(worker: usize, input: W, output: R, timeouts: Timeouts) -> Self
    where
        W: Write + Send + 'static,
        R: BufRead + Send + 'static,
    {
        let (tx, lines) = mpsc::channel();
        spawn_reader(output, tx);
        EngineSession { worker, child: None, input: Some(Box::new(input)), lines, timeouts, stopped: false }
    }

    pub fn worker(&self) -> usize {
        self.worker
    }

    /// Configures the engine with `params` and writes a score into every position.
    pub fn score(&mut self, params: &[TuningParameter], positions: &mut [TestPosition]) -> Result<(), EngineError> {
        self.configure(params)?;
        self.evaluate(positions)
    }

    pub fn configure(&mut self, params: &[TuningParameter]) -> Result<(), EngineError> {
        self.send("uci")?;
        self.wait_for("uciok")?;

        for param in params {
            self.send(&format!("setoption name {} value {}", param.option_name(), param.value))?;
        }

        self.send("isready")?;
        self.wait_for("readyok")?;
        Ok(())
    }

    pub fn evaluate(&mut self, positions: &mut [TestPosition]) -> Result<(), EngineError> {
        for chunk in positions.chunks_mut(CHUNK_SIZE) {
            let fens: Vec<&str> = chunk.iter().map(|pos| pos.position_text.as_str()).collect();
            self.send(&format!("eval {}", fens.join(";")))?;

            let reply = self.wait_for("scores")?;
            let scores = parse_scores(self.worker, &reply, chunk.len())?;
            for (pos, score) in chunk.iter_mut().zip(scores) {
                pos.score = score;
            }
        }
        Ok(())
    }

    fn send(&mut self, command: &str) -> Result<(), EngineError> {
        debug!(worker = self.worker, ">>> {command}");
        let worker = self.worker;
        let input = self.input.as_mut().ok_or_else(|| EngineError::Io {
            worker,
            source: io::Error::new(io::ErrorKind::BrokenPipe, "engine already stopped"),
        })?;
        writeln!(input, "{command}")
            .and_then(|_| input.flush())
            .map_err(|source| EngineError::Io { worker, source })
    }

    /// Scans inbound lines until one contains `token`; every other line is dropped.
    fn wait_for(&mut self, token: &'static str) -> Result<String, EngineError> {
        let deadline = Instant::now() + self.timeouts.reply;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.lines.recv_timeout(remaining) {
                Ok(Ok(line)) => {
                    let line = line.trim_end();
                    debug!(worker = self.worker, "<<< {line}");
                    if line.contains(token) {
                        return Ok(line.to_string());
                    }
                }
                Ok(Err(source)) => return Err(EngineError::Io { worker: self.worker, source }),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(EngineError::Timeout { worker: self.worker, token, timeout: self.timeouts.reply })
                }
                Err(RecvTimeoutError::Disconnected) => return Err(EngineError::Closed { worker: self.worker, token }),
            }
        }
    }

    /// Sends `quit`, waits for the grace period and kills the process if it is still running.
    /// Only the first call does anything.
    pub fn stop(&mut self) -> Result<(), EngineError> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        debug!(worker = self.worker, "Stopping engine instance");

        if let Some(mut input) = self.input.take() {
            // The engine may already be gone; the exit status below tells.
            let _ = writeln!(input, "quit").and_then(|_| input.flush());
        }

        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        let deadline = Instant::now() + self.timeouts.shutdown_grace;
        loop {
            match child.try_wait() {
                Ok(Some(_)) => return Ok(()),
                Ok(None) if Instant::now() < deadline => thread::sleep(EXIT_POLL_INTERVAL),
                Ok(None) => {
                    warn!(worker = self.worker, "Engine ignored quit, killing it");
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(EngineError::ShutdownTimeout { worker: self.worker, grace: self.timeouts.shutdown_grace });
                }
                Err(source) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(EngineError::Io { worker: self.worker, source });
                }
            }
        }
    }
}

impl Drop for EngineSession {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!(worker = self.worker, "{err}");
        }
    }
}

fn spawn_reader<R: BufRead + Send + 'static>(output: R, tx: Sender<io::Result<String>>) {
    // Detached: a killed engine may leave grandchildren holding the pipe open.
    thread::spawn(move || {
        for line in output.lines() {
            let failed = line.is_err();
            if tx.send(line).is_err() || failed {
                break;
            }
        }
    });
}

/// Parses the `;`-separated list following the `scores` token.
pub fn parse_scores(worker: usize, reply: &str, expected: usize) -> Result<Vec<i32>, EngineError> {
    let rest = reply.find("scores").map_or("", |at| &reply[at + "scores".len()..]).trim();
    let tokens: Vec<&str> = if rest.is_empty() { Vec::new() } else { rest.split(';').map(str::trim).collect() };

    if tokens.len() != expected {
        return Err(EngineError::ScoreCount { worker, expected, got: tokens.len() });
    }

    tokens
        .into_iter()
        .map(|token| token.parse::<i32>().map_err(|_| EngineError::InvalidScore { worker, token: token.to_string() }))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::{io::{Cursor, Read}, sync::{Arc, Mutex}};

    use super::*;

    #[derive(Clone, Default)]
    struct Transcript(Arc<Mutex<Vec<u8>>>);

    impl Transcript {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl Write for Transcript {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Never produces a line until the sender is dropped.
    struct Stalled(mpsc::Receiver<()>);

    impl Read for Stalled {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            let _ = self.0.recv();
            Ok(0)
        }
    }

    fn session(replies: &str) -> (EngineSession, Transcript) {
        let transcript = Transcript::default();
        let timeouts = Timeouts { reply: Duration::from_secs(5), shutdown_grace: Duration::from_millis(100) };
        let session = EngineSession::from_streams(1, transcript.clone(), Cursor::new(replies.to_string()), timeouts);
        (session, transcript)
    }

    fn positions(n: usize) -> Vec<TestPosition> {
        (0..n).map(|i| TestPosition::new(format!("pos{i}"), 0.5)).collect()
    }

    #[test]
    fn runs_the_handshake_and_stores_scores() {
        let (mut session, transcript) = session("id name stub\nuciok\ninfo string ready soon\nreadyok\nscores 10;-20\n");
        let params = vec![TuningParameter::scalar("Tempo", 20), TuningParameter::element("Pst", 0, 3)];
        let mut batch = positions(2);

        session.score(&params, &mut batch).unwrap();

        assert_eq!(batch[0].score, 10);
        assert_eq!(batch[1].score, -20);
        assert_eq!(
            transcript.text(),
            "uci\nsetoption name Tempo value 20\nsetoption name Pst0 value 3\nisready\neval pos0;pos1\n"
        );
    }

    #[test]
    fn large_batches_are_sent_in_chunks() {
        let first = vec!["1"; 100].join(";");
        let second = vec!["2"; 50].join(";");
        let (mut session, transcript) = session(&format!("uciok\nreadyok\nscores {first}\nscores {second}\n"));
        let mut batch = positions(150);

        session.score(&[], &mut batch).unwrap();

        let evals: Vec<String> = transcript.text().lines().filter(|l| l.starts_with("eval ")).map(String::from).collect();
        assert_eq!(evals.len(), 2);
        assert_eq!(evals[0].split(';').count(), 100);
        assert_eq!(evals[1].split(';').count(), 50);
        assert!(batch[..100].iter().all(|p| p.score == 1));
        assert!(batch[100..].iter().all(|p| p.score == 2));
    }

    #[test]
    fn wrong_score_count_is_fatal() {
        let (mut session, _) = session("uciok\nreadyok\nscores 1;2;3\n");
        let err = session.score(&[], &mut positions(2)).unwrap_err();
        assert!(matches!(err, EngineError::ScoreCount { expected: 2, got: 3, .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn malformed_score_is_recoverable() {
        let (mut session, _) = session("uciok\nreadyok\nscores 1;abc\n");
        let err = session.score(&[], &mut positions(2)).unwrap_err();
        assert!(matches!(err, EngineError::InvalidScore { ref token, .. } if token == "abc"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn closed_output_is_reported() {
        let (mut session, _) = session("id name stub\n");
        let err = session.score(&[], &mut positions(1)).unwrap_err();
        assert!(matches!(err, EngineError::Closed { token: "uciok", .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn silent_engine_times_out() {
        let (_hold, rx) = mpsc::channel();
        let timeouts = Timeouts { reply: Duration::from_millis(50), shutdown_grace: Duration::from_millis(50) };
        let mut session = EngineSession::from_streams(3, Transcript::default(), BufReader::new(Stalled(rx)), timeouts);

        let err = session.configure(&[]).unwrap_err();
        assert!(matches!(err, EngineError::Timeout { worker: 3, token: "uciok", .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn stop_sends_quit_exactly_once() {
        let (mut session, transcript) = session("");
        session.stop().unwrap();
        session.stop().unwrap();
        drop(session);
        assert_eq!(transcript.text(), "quit\n");
    }

    #[test]
    fn score_line_may_carry_a_prefix() {
        assert_eq!(parse_scores(0, "info scores 5; -7 ;0", 3).unwrap(), vec![5, -7, 0]);
        assert!(matches!(parse_scores(0, "scores", 1), Err(EngineError::ScoreCount { got: 0, .. })));
    }
}
