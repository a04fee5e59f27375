//! WinRM transport speaking WS-Management over HTTP(S)
//!
//! A remote `cmd` shell is created on connect. Each command is started in
//! that shell and its output is polled with `Receive` requests until the
//! command reports `Done`. Only Basic authentication is supported.

use std::collections::VecDeque;
use std::path::Path;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::psfile;
use crate::connection::{Connection, ConnectionState};
use crate::error::ExecError;
use crate::process::{Process, ProcessEvent};
use crate::shell::ShellKind;
use crate::target::Target;

const RESOURCE_URI: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/cmd";
const ACTION_CREATE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Create";
const ACTION_DELETE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Delete";
const ACTION_COMMAND: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Command";
const ACTION_RECEIVE: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Receive";
const ACTION_SEND: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Send";
const ACTION_SIGNAL: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Signal";
const SIGNAL_TERMINATE: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/signal/terminate";
const STATE_DONE: &str = "CommandState/Done";

// WSManFault raised when a Receive finds no output within OperationTimeout
const TIMEOUT_FAULT: &str = "2150858793";

/// Failure of a single WS-Management request
#[derive(Debug, thiserror::Error)]
enum WsmanError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("operation timed out")]
    Timeout,

    #[error("{0}")]
    Fault(String),

    #[error("{0}")]
    Http(String),
}

impl WsmanError {
    fn into_exec(self) -> ExecError {
        ExecError::Exec(format!("WinRM request failed: {self}"))
    }
}

/// Authenticated WS-Management endpoint
#[derive(Clone)]
struct WsmanClient {
    http: reqwest::Client,
    endpoint: String,
    user: String,
    password: String,
}

impl WsmanClient {
    fn new(target: &Target) -> Result<Self, ExecError> {
        let options = &target.options;
        let scheme = if options.ssl { "https" } else { "http" };
        let endpoint = format!("{scheme}://{}:{}/wsman", target.host(), target.port());

        let mut builder = reqwest::Client::builder().connect_timeout(options.connect_timeout());
        if options.ssl && !options.ssl_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(cacert) = &options.cacert {
            let pem = std::fs::read(cacert).map_err(|e| {
                ExecError::connect(format!("could not read cacert {}: {e}", cacert.display()))
            })?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| ExecError::connect(format!("invalid cacert: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        let http = builder
            .build()
            .map_err(|e| ExecError::connect(format!("could not build HTTP client: {e}")))?;

        Ok(Self {
            http,
            endpoint,
            user: target.user.clone().unwrap_or_default(),
            password: target
                .password
                .as_ref()
                .map(|p| p.expose().to_string())
                .unwrap_or_default(),
        })
    }

    async fn post(&self, envelope: String) -> Result<String, WsmanError> {
        let response = self
            .http
            .post(&self.endpoint)
            .basic_auth(&self.user, Some(&self.password))
            .header(CONTENT_TYPE, "application/soap+xml;charset=UTF-8")
            .body(envelope)
            .send()
            .await
            .map_err(|e| WsmanError::Http(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(WsmanError::Unauthorized);
        }
        let body = response
            .text()
            .await
            .map_err(|e| WsmanError::Http(e.to_string()))?;
        if status.is_success() {
            Ok(body)
        } else if body.contains(TIMEOUT_FAULT) {
            Err(WsmanError::Timeout)
        } else {
            let reason = element_text(&body, b"Text")
                .ok()
                .flatten()
                .unwrap_or_else(|| format!("HTTP {status}"));
            Err(WsmanError::Fault(reason))
        }
    }

    async fn create_shell(&self) -> Result<String, WsmanError> {
        let body = "<rsp:Shell>\
                    <rsp:InputStreams>stdin</rsp:InputStreams>\
                    <rsp:OutputStreams>stdout stderr</rsp:OutputStreams>\
                    </rsp:Shell>";
        let options = [("WINRS_NOPROFILE", "FALSE"), ("WINRS_CODEPAGE", "65001")];
        let response = self
            .post(envelope(&self.endpoint, ACTION_CREATE, None, &options, body))
            .await?;
        element_text(&response, b"ShellId")
            .map_err(WsmanError::Fault)?
            .ok_or_else(|| WsmanError::Fault("response carried no ShellId".to_string()))
    }

    async fn delete_shell(&self, shell_id: &str) -> Result<(), WsmanError> {
        self.post(envelope(&self.endpoint, ACTION_DELETE, Some(shell_id), &[], ""))
            .await
            .map(|_| ())
    }

    async fn start_command(&self, shell_id: &str, command: &str) -> Result<String, WsmanError> {
        let body = format!(
            "<rsp:CommandLine><rsp:Command>{}</rsp:Command></rsp:CommandLine>",
            escape(command)
        );
        let options = [
            ("WINRS_CONSOLEMODE_STDIN", "TRUE"),
            ("WINRS_SKIP_CMD_SHELL", "FALSE"),
        ];
        let response = self
            .post(envelope(&self.endpoint, ACTION_COMMAND, Some(shell_id), &options, &body))
            .await?;
        element_text(&response, b"CommandId")
            .map_err(WsmanError::Fault)?
            .ok_or_else(|| WsmanError::Fault("response carried no CommandId".to_string()))
    }

    async fn receive(&self, shell_id: &str, command_id: &str) -> Result<ReceiveOutput, WsmanError> {
        let body = format!(
            "<rsp:Receive><rsp:DesiredStream CommandId=\"{command_id}\">stdout stderr</rsp:DesiredStream></rsp:Receive>"
        );
        let response = self
            .post(envelope(&self.endpoint, ACTION_RECEIVE, Some(shell_id), &[], &body))
            .await?;
        parse_receive(&response).map_err(WsmanError::Fault)
    }

    async fn send(
        &self,
        shell_id: &str,
        command_id: &str,
        data: &[u8],
        end: bool,
    ) -> Result<(), WsmanError> {
        let end = if end { " End=\"true\"" } else { "" };
        let body = format!(
            "<rsp:Send><rsp:Stream Name=\"stdin\" CommandId=\"{command_id}\"{end}>{}</rsp:Stream></rsp:Send>",
            STANDARD.encode(data)
        );
        self.post(envelope(&self.endpoint, ACTION_SEND, Some(shell_id), &[], &body))
            .await
            .map(|_| ())
    }

    async fn terminate(&self, shell_id: &str, command_id: &str) -> Result<(), WsmanError> {
        let body = format!(
            "<rsp:Signal CommandId=\"{command_id}\"><rsp:Code>{SIGNAL_TERMINATE}</rsp:Code></rsp:Signal>"
        );
        self.post(envelope(&self.endpoint, ACTION_SIGNAL, Some(shell_id), &[], &body))
            .await
            .map(|_| ())
    }
}

/// Build a SOAP envelope for one WS-Management request
fn envelope(
    endpoint: &str,
    action: &str,
    shell_id: Option<&str>,
    options: &[(&str, &str)],
    body: &str,
) -> String {
    let selector = shell_id
        .map(|id| {
            format!(
                "<wsman:SelectorSet><wsman:Selector Name=\"ShellId\">{id}</wsman:Selector></wsman:SelectorSet>"
            )
        })
        .unwrap_or_default();
    let option_set = if options.is_empty() {
        String::new()
    } else {
        let items = options
            .iter()
            .map(|(name, value)| format!("<wsman:Option Name=\"{name}\">{value}</wsman:Option>"))
            .collect::<String>();
        format!("<wsman:OptionSet>{items}</wsman:OptionSet>")
    };

    format!(
        r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:wsa="http://schemas.xmlsoap.org/ws/2004/08/addressing" xmlns:wsman="http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd" xmlns:rsp="http://schemas.microsoft.com/wbem/wsman/1/windows/shell"><s:Header><wsa:To>{endpoint}</wsa:To><wsman:ResourceURI s:mustUnderstand="true">{RESOURCE_URI}</wsman:ResourceURI><wsa:ReplyTo><wsa:Address s:mustUnderstand="true">http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous</wsa:Address></wsa:ReplyTo><wsa:Action s:mustUnderstand="true">{action}</wsa:Action><wsman:MaxEnvelopeSize s:mustUnderstand="true">153600</wsman:MaxEnvelopeSize><wsa:MessageID>uuid:{}</wsa:MessageID><wsman:Locale xml:lang="en-US" s:mustUnderstand="false"/><wsman:OperationTimeout>PT60S</wsman:OperationTimeout>{selector}{option_set}</s:Header><s:Body>{body}</s:Body></s:Envelope>"#,
        Uuid::new_v4().to_string().to_uppercase()
    )
}

/// Text of the first element whose local name is `name`
fn element_text(xml: &str, name: &[u8]) -> Result<Option<String>, String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut inside = false;
    loop {
        match reader.read_event().map_err(|e| e.to_string())? {
            Event::Start(e) if e.local_name().as_ref() == name => inside = true,
            Event::Text(t) if inside => {
                return t.unescape().map(|s| Some(s.into_owned())).map_err(|e| e.to_string());
            }
            Event::End(_) => inside = false,
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}

/// Decoded content of one `ReceiveResponse`
#[derive(Debug, Default, PartialEq, Eq)]
struct ReceiveOutput {
    events: Vec<ProcessEvent>,
    exit_code: Option<i32>,
    done: bool,
}

fn parse_receive(xml: &str) -> Result<ReceiveOutput, String> {
    enum Field {
        Stdout,
        Stderr,
        ExitCode,
    }

    fn is_done(e: &quick_xml::events::BytesStart<'_>) -> bool {
        e.attributes().flatten().any(|attr| {
            attr.key.local_name().as_ref() == b"State"
                && attr.unescape_value().is_ok_and(|v| v.ends_with(STATE_DONE))
        })
    }

    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut output = ReceiveOutput::default();
    let mut field = None;

    loop {
        match reader.read_event().map_err(|e| e.to_string())? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"Stream" => {
                    let name = e
                        .attributes()
                        .flatten()
                        .find(|attr| attr.key.local_name().as_ref() == b"Name")
                        .and_then(|attr| attr.unescape_value().ok().map(|v| v.into_owned()));
                    field = match name.as_deref() {
                        Some("stdout") => Some(Field::Stdout),
                        Some("stderr") => Some(Field::Stderr),
                        _ => None,
                    };
                }
                b"CommandState" => output.done |= is_done(&e),
                b"ExitCode" => field = Some(Field::ExitCode),
                _ => {}
            },
            Event::Empty(e) if e.local_name().as_ref() == b"CommandState" => {
                output.done |= is_done(&e);
            }
            Event::Text(t) => {
                let text = t.unescape().map_err(|e| e.to_string())?;
                match field {
                    Some(Field::Stdout) => output.events.push(ProcessEvent::Stdout(
                        STANDARD.decode(text.as_bytes()).map_err(|e| e.to_string())?,
                    )),
                    Some(Field::Stderr) => output.events.push(ProcessEvent::Stderr(
                        STANDARD.decode(text.as_bytes()).map_err(|e| e.to_string())?,
                    )),
                    Some(Field::ExitCode) => {
                        let code = text
                            .parse::<i32>()
                            .or_else(|_| text.parse::<u32>().map(u32::cast_signed))
                            .map_err(|e| format!("invalid exit code '{text}': {e}"))?;
                        output.exit_code = Some(code);
                    }
                    None => {}
                }
            }
            Event::End(_) => field = None,
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(output)
}

/// A command running in a remote WinRM shell
pub struct WinrmProcess {
    client: WsmanClient,
    shell_id: String,
    command_id: String,
    pending: VecDeque<ProcessEvent>,
    done: bool,
    stdin_closed: bool,
}

#[async_trait]
impl Process for WinrmProcess {
    async fn next_event(&mut self) -> Result<Option<ProcessEvent>, ExecError> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }
            if self.done {
                return Ok(None);
            }

            let output = match self.client.receive(&self.shell_id, &self.command_id).await {
                Ok(output) => output,
                Err(WsmanError::Timeout) => continue,
                Err(e) => return Err(e.into_exec()),
            };
            self.pending.extend(output.events);
            if output.done {
                self.done = true;
                self.pending
                    .push_back(ProcessEvent::Exit(output.exit_code.unwrap_or(-1)));
                if let Err(e) = self.client.terminate(&self.shell_id, &self.command_id).await {
                    debug!(error = %e, "could not release finished command");
                }
            }
        }
    }

    async fn write_stdin(&mut self, data: &[u8]) -> Result<(), ExecError> {
        if self.stdin_closed || data.is_empty() {
            return Ok(());
        }
        self.client
            .send(&self.shell_id, &self.command_id, data, false)
            .await
            .map_err(WsmanError::into_exec)
    }

    async fn close_stdin(&mut self) -> Result<(), ExecError> {
        if std::mem::replace(&mut self.stdin_closed, true) {
            return Ok(());
        }
        // a command that already exited rejects further input
        if let Err(e) = self.client.send(&self.shell_id, &self.command_id, &[], true).await {
            debug!(error = %e, "could not close stdin");
        }
        Ok(())
    }

    async fn abort(&mut self) {
        self.done = true;
        let _ = self.client.terminate(&self.shell_id, &self.command_id).await;
    }
}

/// Session with a Windows target over WinRM
pub struct WinrmConnection {
    target: Target,
    user: String,
    client: Option<WsmanClient>,
    shell_id: Option<String>,
    state: ConnectionState,
}

impl std::fmt::Debug for WinrmConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WinrmConnection")
            .field("target", &self.target.name)
            .field("user", &self.user)
            .field("shell_id", &self.shell_id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl WinrmConnection {
    /// Create a connection for `target`
    #[must_use]
    pub fn new(target: Target) -> Self {
        let user = target.user.clone().unwrap_or_default();
        Self {
            target,
            user,
            client: None,
            shell_id: None,
            state: ConnectionState::Unconnected,
        }
    }

    fn shell(&self) -> Result<(&WsmanClient, &str), ExecError> {
        match (&self.state, &self.client, &self.shell_id) {
            (ConnectionState::Connected, Some(client), Some(shell_id)) => Ok((client, shell_id)),
            _ => Err(ExecError::NotConnected),
        }
    }

    async fn open_shell(&self) -> Result<(WsmanClient, String), ExecError> {
        let client = WsmanClient::new(&self.target)?;
        info!(endpoint = %client.endpoint, user = %self.user, "connecting to WinRM");

        let host = self.target.host();
        let shell_id = match tokio::time::timeout(
            self.target.options.connect_timeout(),
            client.create_shell(),
        )
        .await
        {
            Ok(Ok(shell_id)) => shell_id,
            Ok(Err(WsmanError::Unauthorized)) => {
                return Err(ExecError::auth(format!(
                    "Authentication failed for user {} on {host}",
                    self.user
                )));
            }
            Ok(Err(e)) => {
                return Err(ExecError::connect(format!("Failed to connect to {host}: {e}")));
            }
            Err(_) => {
                return Err(ExecError::connect(format!(
                    "Failed to connect to {host}: timed out after {}s",
                    self.target.options.connect_timeout
                )));
            }
        };
        Ok((client, shell_id))
    }
}

#[async_trait]
impl Connection for WinrmConnection {
    fn target(&self) -> &Target {
        &self.target
    }

    fn user(&self) -> &str {
        &self.user
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    fn shell_kind(&self) -> ShellKind {
        ShellKind::PowerShell
    }

    fn transport_name(&self) -> &'static str {
        "winrm"
    }

    #[instrument(skip(self), fields(host = %self.target.host()))]
    async fn connect(&mut self) -> Result<(), ExecError> {
        if self.state == ConnectionState::Connected {
            return Ok(());
        }
        self.state = ConnectionState::Connecting;
        match self.open_shell().await {
            Ok((client, shell_id)) => {
                debug!(shell_id = %shell_id, "opened WinRM shell");
                self.client = Some(client);
                self.shell_id = Some(shell_id);
                self.state = ConnectionState::Connected;
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::Unconnected;
                Err(e)
            }
        }
    }

    async fn spawn(&mut self, command: &str, tty: bool) -> Result<Box<dyn Process>, ExecError> {
        let (client, shell_id) = self.shell()?;
        if tty {
            debug!("tty is not supported by the winrm transport; ignoring");
        }
        let command_id = client
            .start_command(shell_id, command)
            .await
            .map_err(WsmanError::into_exec)?;

        Ok(Box::new(WinrmProcess {
            client: client.clone(),
            shell_id: shell_id.to_string(),
            command_id,
            pending: VecDeque::new(),
            done: false,
            stdin_closed: false,
        }))
    }

    async fn upload(&mut self, source: &Path, destination: &str) -> Result<(), ExecError> {
        self.shell()?;
        psfile::upload(self, source, destination).await
    }

    async fn download(&mut self, source: &str, destination: &Path) -> Result<(), ExecError> {
        self.shell()?;
        psfile::download(self, source, destination).await
    }

    async fn disconnect(&mut self) -> Result<(), ExecError> {
        let (Some(client), Some(shell_id)) = (self.client.take(), self.shell_id.take()) else {
            return Ok(());
        };
        self.state = ConnectionState::Disconnected;

        let limit = self.target.options.disconnect_timeout();
        match tokio::time::timeout(limit, client.delete_shell(&shell_id)).await {
            Ok(Ok(())) => {
                info!(host = %self.target.host(), "WinRM shell closed");
                Ok(())
            }
            Ok(Err(e)) => Err(ExecError::Exec(format!("failed to close WinRM shell: {e}"))),
            Err(_) => {
                warn!(host = %self.target.host(), "WinRM disconnect timed out");
                Ok(())
            }
        }
    }
}
