//! sudo escalation protocol
//!
//! Escalated commands run under `sudo -S -p <prompt>`, which reads the
//! password from the same stdin the command uses. [`SudoEscalation`] watches
//! the output streams chunk by chunk: it answers the prompt with the password
//! once, releases held-back stdin when the `sudo-id` marker shows up, and turns
//! sudo's refusal messages into typed errors. Everything else passes through
//! untouched.

use crate::error::{EscalateCode, ExecError};

/// Prompt passed to `sudo -p`, chosen so it does not collide with program output
pub const SUDO_PROMPT: &str = "[sudo] fanout needs to run as another user, password: ";

/// Output stream a chunk was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn index(self) -> usize {
        match self {
            Stream::Stdout => 0,
            Stream::Stderr => 1,
        }
    }
}

/// Protocol state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SudoState {
    /// Output is ordinary program output
    Normal,
    /// The prompt was seen and no password can be sent
    AwaitingPassword,
    /// The user may not run sudo
    Denied,
    /// The password was rejected
    BadPassword,
}

/// What the driver must do after a chunk was scanned
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ChunkOutcome {
    /// Bytes to append to the captured stream
    pub output: Vec<u8>,
    /// Bytes to write to the process stdin
    pub write: Vec<u8>,
    /// Close stdin after writing
    pub close_stdin: bool,
}

/// Escalation state machine for one command
pub struct SudoEscalation {
    prompt: String,
    sudo_id: String,
    user: String,
    target: String,
    password: Option<String>,
    stdin: Option<Vec<u8>>,
    state: SudoState,
    password_sent: bool,
    carry: [Vec<u8>; 2],
}

impl SudoEscalation {
    /// Create the state machine
    ///
    /// # Arguments
    /// * `sudo_id` - Marker echoed by the command once sudo has let it run
    /// * `user` - User the connection is logged in as
    /// * `target` - Target name for error messages
    /// * `password` - Password to answer the prompt with
    pub fn new(
        sudo_id: impl Into<String>,
        user: impl Into<String>,
        target: impl Into<String>,
        password: Option<String>,
    ) -> Self {
        Self {
            prompt: SUDO_PROMPT.to_string(),
            sudo_id: sudo_id.into(),
            user: user.into(),
            target: target.into(),
            password,
            stdin: None,
            state: SudoState::Normal,
            password_sent: false,
            carry: [Vec::new(), Vec::new()],
        }
    }

    /// Hold `stdin` back until the `sudo-id` marker is seen
    #[must_use]
    pub fn with_stdin(mut self, stdin: Vec<u8>) -> Self {
        self.stdin = Some(stdin);
        self
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SudoState {
        self.state
    }

    /// Whether the password has been written
    #[must_use]
    pub fn password_sent(&self) -> bool {
        self.password_sent
    }

    /// Scan one chunk read from `stream`
    ///
    /// # Errors
    /// Returns `ExecError::Escalate` with `NO_PASSWORD`, `SUDO_DENIED` or
    /// `BAD_PASSWORD`; the state machine stays in the failed state
    pub fn on_chunk(&mut self, stream: Stream, data: &[u8]) -> Result<ChunkOutcome, ExecError> {
        if let Some(err) = self.failure() {
            return Err(err);
        }

        let mut buf = std::mem::take(&mut self.carry[stream.index()]);
        buf.extend_from_slice(data);

        let mut outcome = ChunkOutcome::default();
        let mut rest = buf.as_slice();
        while !rest.is_empty() {
            let (line, remainder) = match rest.iter().position(|b| *b == b'\n') {
                Some(i) => rest.split_at(i + 1),
                None => (rest, &[][..]),
            };
            if remainder.is_empty() && !line.ends_with(b"\n") && self.is_partial_marker(line) {
                self.carry[stream.index()] = line.to_vec();
                break;
            }
            self.scan_line(line, &mut outcome)?;
            rest = remainder;
        }
        Ok(outcome)
    }

    /// Bytes held back from `stream` waiting for more input
    pub fn finish(&mut self, stream: Stream) -> Vec<u8> {
        std::mem::take(&mut self.carry[stream.index()])
    }

    fn failure(&self) -> Option<ExecError> {
        match self.state {
            SudoState::Normal => None,
            SudoState::AwaitingPassword => Some(self.no_password()),
            SudoState::Denied => Some(self.denied()),
            SudoState::BadPassword => Some(self.bad_password()),
        }
    }

    // An unterminated line that may still grow into the prompt or the marker.
    fn is_partial_marker(&self, line: &[u8]) -> bool {
        let starts = |marker: &str| line.len() < marker.len() && marker.as_bytes().starts_with(line);
        starts(&self.prompt) || starts(&self.sudo_id)
    }

    fn scan_line(&mut self, line: &[u8], outcome: &mut ChunkOutcome) -> Result<(), ExecError> {
        if let Some(pos) = find(line, self.prompt.as_bytes()) {
            self.answer_prompt(outcome)?;
            outcome.output.extend_from_slice(&line[..pos]);
            outcome.output.extend_from_slice(&line[pos + self.prompt.len()..]);
            return Ok(());
        }

        if !self.sudo_id.is_empty() && line.starts_with(self.sudo_id.as_bytes()) {
            if let Some(stdin) = self.stdin.take() {
                outcome.write.extend_from_slice(&stdin);
                outcome.write.push(b'\n');
            }
            outcome.close_stdin = true;
            return Ok(());
        }

        let text = String::from_utf8_lossy(line);
        if text.starts_with(&format!("{} is not in the sudoers file", self.user)) {
            self.state = SudoState::Denied;
            return Err(self.denied());
        }
        if text.starts_with("Sorry, try again.") {
            self.state = SudoState::BadPassword;
            return Err(self.bad_password());
        }

        outcome.output.extend_from_slice(line);
        Ok(())
    }

    fn answer_prompt(&mut self, outcome: &mut ChunkOutcome) -> Result<(), ExecError> {
        if self.password_sent {
            self.state = SudoState::BadPassword;
            return Err(self.bad_password());
        }
        match &self.password {
            Some(password) => {
                outcome.write.extend_from_slice(password.as_bytes());
                outcome.write.push(b'\n');
                self.password_sent = true;
                Ok(())
            }
            None => {
                self.state = SudoState::AwaitingPassword;
                Err(self.no_password())
            }
        }
    }

    fn no_password(&self) -> ExecError {
        ExecError::escalate(
            EscalateCode::NoPassword,
            format!(
                "Sudo password for user {} was not provided for {}",
                self.user, self.target
            ),
        )
    }

    fn denied(&self) -> ExecError {
        ExecError::escalate(
            EscalateCode::SudoDenied,
            format!(
                "User {} does not have sudo permission on {}",
                self.user, self.target
            ),
        )
    }

    fn bad_password(&self) -> ExecError {
        ExecError::escalate(
            EscalateCode::BadPassword,
            format!(
                "Sudo password for user {} not recognized on {}",
                self.user, self.target
            ),
        )
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn escalation(password: Option<&str>) -> SudoEscalation {
        SudoEscalation::new("3f1c-marker", "deploy", "web1", password.map(str::to_string))
    }

    #[test]
    fn test_prompt_answered_once() {
        let mut sudo = escalation(Some("s3cret"));

        let outcome = sudo.on_chunk(Stream::Stderr, SUDO_PROMPT.as_bytes()).unwrap();
        assert_eq!(outcome.write, b"s3cret\n");
        assert!(outcome.output.is_empty());
        assert!(sudo.password_sent());

        let outcome = sudo.on_chunk(Stream::Stdout, b"hello\n").unwrap();
        assert_eq!(outcome.output, b"hello\n");
        assert!(outcome.write.is_empty());
        assert_eq!(sudo.state(), SudoState::Normal);
    }

    #[test]
    fn test_prompt_split_across_chunks() {
        let mut sudo = escalation(Some("pw"));
        let (head, tail) = SUDO_PROMPT.split_at(10);

        let first = sudo.on_chunk(Stream::Stderr, head.as_bytes()).unwrap();
        assert_eq!(first, ChunkOutcome::default());

        let second = sudo.on_chunk(Stream::Stderr, tail.as_bytes()).unwrap();
        assert_eq!(second.write, b"pw\n");
    }

    #[test]
    fn test_sudoers_denial() {
        let mut sudo = escalation(Some("pw"));
        let err = sudo
            .on_chunk(
                Stream::Stderr,
                b"deploy is not in the sudoers file.  This incident will be reported.\n",
            )
            .unwrap_err();

        assert_eq!(err.issue_code(), "SUDO_DENIED");
        assert_eq!(sudo.state(), SudoState::Denied);
        assert!(!sudo.password_sent());
        // absorbing
        assert!(sudo.on_chunk(Stream::Stdout, b"more\n").is_err());
    }

    #[test]
    fn test_bad_password() {
        let mut sudo = escalation(Some("wrong"));
        sudo.on_chunk(Stream::Stderr, SUDO_PROMPT.as_bytes()).unwrap();
        let err = sudo
            .on_chunk(Stream::Stderr, b"Sorry, try again.\n")
            .unwrap_err();
        assert_eq!(err.issue_code(), "BAD_PASSWORD");
    }

    #[test]
    fn test_second_prompt_is_bad_password() {
        let mut sudo = escalation(Some("wrong"));
        sudo.on_chunk(Stream::Stderr, SUDO_PROMPT.as_bytes()).unwrap();
        let err = sudo.on_chunk(Stream::Stderr, SUDO_PROMPT.as_bytes()).unwrap_err();
        assert_eq!(err.issue_code(), "BAD_PASSWORD");
    }

    #[test]
    fn test_missing_password() {
        let mut sudo = escalation(None);
        let err = sudo.on_chunk(Stream::Stderr, SUDO_PROMPT.as_bytes()).unwrap_err();
        assert_eq!(err.issue_code(), "NO_PASSWORD");
        assert_eq!(sudo.state(), SudoState::AwaitingPassword);
    }

    #[test]
    fn test_marker_releases_stdin() {
        let mut sudo = escalation(Some("pw")).with_stdin(b"{\"a\":1}".to_vec());

        let outcome = sudo
            .on_chunk(Stream::Stderr, b"3f1c-marker\nwarning: x\n")
            .unwrap();
        assert_eq!(outcome.write, b"{\"a\":1}\n");
        assert!(outcome.close_stdin);
        assert_eq!(outcome.output, b"warning: x\n");

        // stdin is delivered only once
        let again = sudo.on_chunk(Stream::Stderr, b"3f1c-marker\n").unwrap();
        assert!(again.write.is_empty());
    }

    #[test]
    fn test_ordinary_output_passes_through() {
        let mut sudo = escalation(None);
        let data = b"line one\nline two without newline";
        let outcome = sudo.on_chunk(Stream::Stdout, data).unwrap();
        assert_eq!(outcome.output, data);
        assert!(sudo.finish(Stream::Stdout).is_empty());
    }

    #[test]
    fn test_finish_flushes_partial_marker() {
        let mut sudo = escalation(None);
        let outcome = sudo.on_chunk(Stream::Stdout, b"[sudo]").unwrap();
        assert!(outcome.output.is_empty());
        assert_eq!(sudo.finish(Stream::Stdout), b"[sudo]");
    }
}
